//! HTTP client for the sensors' `dataloader.cgi` export endpoint.

use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::config::SensorAuth;
use crate::error::SensorError;
use crate::models::Sensor;
use crate::retry::{RetryError, RetryHandler};

use super::parse::format_vendor_timestamp;

// ---

/// Export the sensor can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    // ---
    PeopleCounting,
    RegionalCounting,
}

impl Endpoint {
    /// Fixed query parameters for this export.
    pub fn query(&self) -> &'static str {
        match self {
            Endpoint::PeopleCounting => {
                "dw=vcalogcsv&report_type=0&statistics_type=3&linetype=31"
            }
            Endpoint::RegionalCounting => {
                "dw=regionalcountlogcsv&report_type=0&lengthtype=0&length=0\
                 &region1=1&region2=1&region3=1&region4=1"
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::PeopleCounting => "people_counting",
            Endpoint::RegionalCounting => "regional_counting",
        }
    }
}

/// Report window in the sensor's local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionWindow {
    // ---
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl CollectionWindow {
    /// `[now - lookback_hours, now]`, start truncated to the hour, rendered in `tz`.
    pub fn ending_at(now: DateTime<Utc>, tz: Tz, lookback_hours: u32) -> Self {
        // ---
        let end = now.with_timezone(&tz).naive_local();
        let start = end - chrono::Duration::hours(i64::from(lookback_hours));
        let start = start
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(start);
        Self { start, end }
    }
}

/// A fetched payload plus how long the sensor took to serve it.
#[derive(Debug, Clone)]
pub struct Fetched {
    // ---
    pub body: String,
    pub elapsed: Duration,
}

/// Authenticated, retrying client shared by every sensor in a run.
#[derive(Debug, Clone)]
pub struct SensorClient {
    http: reqwest::Client,
    auth: SensorAuth,
    retry: RetryHandler,
}

impl SensorClient {
    /// Build the client with a per-request timeout.
    pub fn new(
        auth: SensorAuth,
        timeout: Duration,
        retry: RetryHandler,
    ) -> Result<Self, SensorError> {
        // ---
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, auth, retry })
    }

    /// Full export URL for `sensor` over `window`.
    pub fn build_url(
        sensor: &Sensor,
        endpoint: Endpoint,
        window: &CollectionWindow,
    ) -> Result<String, SensorError> {
        // ---
        let host = sensor.ip_address.trim().trim_end_matches('/');
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(SensorError::InvalidAddress(sensor.ip_address.clone()));
        }

        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{}:{}", host, sensor.port)
        };

        Ok(format!(
            "{}/dataloader.cgi?{}&time_start={}&time_end={}",
            base,
            endpoint.query(),
            format_vendor_timestamp(window.start),
            format_vendor_timestamp(window.end),
        ))
    }

    /// Download one export, retrying transient failures.
    ///
    /// `max_attempts` caps the total number of attempts (used for half-open trials).
    pub async fn fetch(
        &self,
        sensor: &Sensor,
        endpoint: Endpoint,
        window: &CollectionWindow,
        max_attempts: Option<u32>,
    ) -> Result<Fetched, RetryError<SensorError>> {
        // ---
        let url = Self::build_url(sensor, endpoint, window).map_err(RetryError::Fatal)?;
        let retry = match max_attempts {
            Some(n) => self.retry.with_max_attempts(n),
            None => self.retry.clone(),
        };

        tracing::debug!(
            sensor = %sensor.sensor_name,
            endpoint = endpoint.as_str(),
            %url,
            "Fetching sensor export"
        );

        let started = Instant::now();
        let body = retry
            .execute(|| self.fetch_once(sensor, &url))
            .await?;

        Ok(Fetched {
            body,
            elapsed: started.elapsed(),
        })
    }

    async fn fetch_once(&self, sensor: &Sensor, url: &str) -> Result<String, SensorError> {
        // ---
        let creds = self.auth.for_type(sensor.sensor_type);
        let resp = self
            .http
            .get(url)
            .basic_auth(&creds.username, Some(&creds.password))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SensorError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.text().await?)
    }
}
