//! Debounced Online/Offline state derived from poll outcomes.
//!
//! The inverter disappears every night and occasionally drops a single
//! request during the day. Only a run of fast-cadence failures takes the
//! device offline; one fast success brings it back.

use serde::{Deserialize, Serialize};

use kaco_types::CadenceClass;

/// Whether the inverter is considered reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A confirmed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
}

/// Two-state machine with a consecutive-failure guard.
///
/// - Starts `Offline`.
/// - The first success of either class goes `Online`.
/// - Afterwards only fast successes bring the device back `Online`.
/// - `threshold` consecutive fast failures take it `Offline`.
/// - Slow failures never change the state or the counter.
///
/// ```
/// use kaco_core::connectivity::{ConnectivityMachine, ConnectivityState};
/// use kaco_types::CadenceClass;
///
/// let mut machine = ConnectivityMachine::new(3);
/// machine.record(CadenceClass::Fast, true);
/// assert_eq!(machine.state(), ConnectivityState::Online);
///
/// machine.record(CadenceClass::Fast, false);
/// machine.record(CadenceClass::Fast, false);
/// assert_eq!(machine.state(), ConnectivityState::Online);
/// machine.record(CadenceClass::Fast, false);
/// assert_eq!(machine.state(), ConnectivityState::Offline);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectivityMachine {
    state: ConnectivityState,
    consecutive_fast_failures: u32,
    threshold: u32,
    ever_online: bool,
}

impl Default for ConnectivityMachine {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl ConnectivityMachine {
    /// Consecutive fast failures before going offline.
    pub const DEFAULT_THRESHOLD: u32 = 3;

    pub fn new(threshold: u32) -> Self {
        Self {
            state: ConnectivityState::Offline,
            consecutive_fast_failures: 0,
            threshold: threshold.max(1),
            ever_online: false,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == ConnectivityState::Online
    }

    pub fn consecutive_fast_failures(&self) -> u32 {
        self.consecutive_fast_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Feed one poll outcome; returns the transition if the state changed.
    pub fn record(&mut self, class: CadenceClass, success: bool) -> Option<Transition> {
        let next = match (class, success) {
            (CadenceClass::Fast, true) => {
                self.consecutive_fast_failures = 0;
                ConnectivityState::Online
            }
            (CadenceClass::Slow, true) if !self.ever_online => ConnectivityState::Online,
            (CadenceClass::Slow, _) => self.state,
            (CadenceClass::Fast, false) => {
                self.consecutive_fast_failures = self.consecutive_fast_failures.saturating_add(1);
                if self.consecutive_fast_failures >= self.threshold {
                    ConnectivityState::Offline
                } else {
                    self.state
                }
            }
        };

        if next == ConnectivityState::Online {
            self.ever_online = true;
        }
        if next == self.state {
            return None;
        }

        let transition = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CadenceClass::{Fast, Slow};

    #[test]
    fn test_initially_offline() {
        let machine = ConnectivityMachine::default();
        assert_eq!(machine.state(), ConnectivityState::Offline);
        assert_eq!(machine.threshold(), 3);
    }

    #[test]
    fn test_goes_offline_exactly_once() {
        let mut machine = ConnectivityMachine::new(3);
        machine.record(Fast, true);

        let transitions: Vec<_> = (0..10).filter_map(|_| machine.record(Fast, false)).collect();
        assert_eq!(
            transitions,
            vec![Transition {
                from: ConnectivityState::Online,
                to: ConnectivityState::Offline
            }]
        );
    }

    #[test]
    fn test_single_failure_never_transitions() {
        let mut machine = ConnectivityMachine::new(3);
        machine.record(Fast, true);

        assert_eq!(machine.record(Fast, false), None);
        assert_eq!(machine.record(Fast, true), None);
        assert_eq!(machine.state(), ConnectivityState::Online);
        assert_eq!(machine.consecutive_fast_failures(), 0);
    }

    #[test]
    fn test_back_online_on_first_fast_success() {
        let mut machine = ConnectivityMachine::new(2);
        machine.record(Fast, true);
        machine.record(Fast, false);
        machine.record(Fast, false);
        assert!(!machine.is_online());

        let transition = machine.record(Fast, true).unwrap();
        assert_eq!(transition.to, ConnectivityState::Online);
    }

    #[test]
    fn test_slow_success_only_counts_before_first_online() {
        let mut machine = ConnectivityMachine::new(1);
        assert!(machine.record(Slow, true).is_some());
        assert!(machine.is_online());

        machine.record(Fast, false);
        assert!(!machine.is_online());
        assert_eq!(machine.record(Slow, true), None);
        assert!(!machine.is_online());
    }

    #[test]
    fn test_slow_failures_ignored() {
        let mut machine = ConnectivityMachine::new(1);
        machine.record(Fast, true);
        for _ in 0..5 {
            assert_eq!(machine.record(Slow, false), None);
        }
        assert!(machine.is_online());
    }

    #[test]
    fn test_failures_while_offline_do_not_transition() {
        let mut machine = ConnectivityMachine::new(3);
        for _ in 0..5 {
            assert_eq!(machine.record(Fast, false), None);
        }
        assert_eq!(machine.state(), ConnectivityState::Offline);
    }
}
