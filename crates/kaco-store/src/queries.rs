//! Query builder for statistic points.
//!
//! # Example
//!
//! ```
//! use kaco_store::{PointQuery, Store};
//! use time::{Duration, OffsetDateTime};
//!
//! let store = Store::open_in_memory()?;
//! let last_week = OffsetDateTime::now_utc() - Duration::days(7);
//!
//! let query = PointQuery::new("sensor.kaco_entry9f2_power")
//!     .since(last_week)
//!     .limit(200);
//! let points = store.query_points(&query)?;
//! assert!(points.is_empty());
//! # Ok::<(), kaco_store::Error>(())
//! ```

use time::OffsetDateTime;

use kaco_types::PointOrigin;

/// Fluent query builder for points of one statistic series.
///
/// By default, results are ordered by `start` ascending (oldest first),
/// which is the order reconciliation works in.
#[derive(Debug, Clone, PartialEq)]
pub struct PointQuery {
    pub statistic_id: String,
    /// Points starting at or after this time.
    pub since: Option<OffsetDateTime>,
    /// Points starting at or before this time.
    pub until: Option<OffsetDateTime>,
    /// Only live or only imported points.
    pub origin: Option<PointOrigin>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub newest_first: bool,
}

impl PointQuery {
    pub fn new(statistic_id: impl Into<String>) -> Self {
        Self {
            statistic_id: statistic_id.into(),
            since: None,
            until: None,
            origin: None,
            limit: None,
            offset: None,
            newest_first: false,
        }
    }

    #[must_use]
    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    #[must_use]
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: PointOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Limit the maximum number of results returned.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first N results. Use with `limit()` for pagination.
    #[must_use]
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Order results by newest first.
    #[must_use]
    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = vec!["statistic_id = ?"];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(self.statistic_id.clone())];

        if let Some(since) = self.since {
            conditions.push("start >= ?");
            params.push(Box::new(since.unix_timestamp()));
        }

        if let Some(until) = self.until {
            conditions.push("start <= ?");
            params.push(Box::new(until.unix_timestamp()));
        }

        if let Some(origin) = self.origin {
            conditions.push("imported = ?");
            params.push(Box::new(origin == PointOrigin::Imported));
        }

        (format!("WHERE {}", conditions.join(" AND ")), params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT start, value, imported, segment_start FROM statistics {} ORDER BY start {}",
            where_clause, order
        );

        // SQLite requires LIMIT before OFFSET
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_default_query() {
        let query = PointQuery::new("sensor.kaco_e1_power");
        let sql = query.build_sql();
        assert!(sql.contains("WHERE statistic_id = ?"));
        assert!(sql.ends_with("ORDER BY start ASC"));
        assert_eq!(query.build_where().1.len(), 1);
    }

    #[test]
    fn test_filters_and_pagination() {
        let query = PointQuery::new("sensor.kaco_e1_power")
            .since(datetime!(2026-01-01 0:00 UTC))
            .until(datetime!(2026-02-01 0:00 UTC))
            .origin(PointOrigin::Imported)
            .newest_first()
            .limit(10)
            .offset(20);

        let (where_clause, params) = query.build_where();
        assert!(where_clause.contains("start >= ?"));
        assert!(where_clause.contains("start <= ?"));
        assert!(where_clause.contains("imported = ?"));
        assert_eq!(params.len(), 4);

        let sql = query.build_sql();
        assert!(sql.contains("ORDER BY start DESC"));
        assert!(sql.ends_with("LIMIT 10 OFFSET 20"));
    }

    #[test]
    fn test_offset_without_limit() {
        let sql = PointQuery::new("x").offset(5).build_sql();
        assert!(sql.ends_with("LIMIT -1 OFFSET 5"));
    }
}
