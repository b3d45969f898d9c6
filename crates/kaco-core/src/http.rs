//! HTTP client for the inverter's embedded web server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use time::Date;
use tracing::debug;

use kaco_types::{DailyLog, MIN_LOG_LENGTH, RealtimeReadings, day_log_name};

use crate::error::{Error, Result};
use crate::fetcher::ReadingFetcher;

/// Default timeout for `realtime.csv`.
pub const REALTIME_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for day logs.
pub const DAY_LOG_TIMEOUT: Duration = Duration::from_secs(15);

/// [`ReadingFetcher`] talking HTTP to one inverter.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    address: String,
    base_url: String,
    realtime_timeout: Duration,
    day_timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher for `address` (host name or IP, optionally with a port).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the address is empty or the HTTP
    /// client cannot be built.
    pub fn new(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::invalid_config("inverter address is empty"));
        }

        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::invalid_config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            address: address.to_string(),
            base_url,
            realtime_timeout: REALTIME_TIMEOUT,
            day_timeout: DAY_LOG_TIMEOUT,
        })
    }

    /// Override the per-request timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, realtime: Duration, day: Duration) -> Self {
        self.realtime_timeout = realtime;
        self.day_timeout = day;
        self
    }

    /// URL of a file served by the inverter.
    pub fn url(&self, file: &str) -> String {
        format!("{}/{}", self.base_url, file)
    }

    /// GET `file`, returning `None` on 404.
    async fn get(&self, file: &str, timeout: Duration) -> Result<Option<bytes::Bytes>> {
        let url = self.url(file);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.map_transport(e, file, timeout))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(Error::HttpStatus {
                    status: status.as_u16(),
                    url,
                });
            }
            _ => {}
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_transport(e, file, timeout))?;
        Ok(Some(body))
    }

    fn map_transport(&self, err: reqwest::Error, file: &str, timeout: Duration) -> Error {
        if err.is_timeout() {
            Error::timeout(format!("GET {file}"), timeout)
        } else {
            Error::unreachable(&self.address, err.to_string())
        }
    }
}

#[async_trait]
impl ReadingFetcher for HttpFetcher {
    fn address(&self) -> &str {
        &self.address
    }

    async fn fetch_realtime(&self) -> Result<RealtimeReadings> {
        let body = self
            .get("realtime.csv", self.realtime_timeout)
            .await?
            .ok_or_else(|| Error::HttpStatus {
                status: StatusCode::NOT_FOUND.as_u16(),
                url: self.url("realtime.csv"),
            })?;
        Ok(RealtimeReadings::from_csv(&body)?)
    }

    async fn fetch_day(&self, date: Date) -> Result<Option<DailyLog>> {
        let Some(body) = self.get(&day_log_name(date), self.day_timeout).await? else {
            return Ok(None);
        };
        // The device serves a stub for days it has not logged.
        if body.len() <= MIN_LOG_LENGTH {
            return Ok(None);
        }
        Ok(Some(DailyLog::from_csv(&body)?))
    }
}
