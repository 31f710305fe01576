//! Supabase PostgREST backend (`SUPABASE_URL` + service-role key).
//!
//! Writes use PostgREST's native upsert (`Prefer: resolution=merge-duplicates`
//! with `on_conflict`), so the row itself is written atomically. PostgREST
//! does not say whether the upsert inserted or merged, so an existence check
//! runs first purely to report the action.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{
    CircuitUpdate, DailyAnalytics, HealthLogEntry, HourlyAnalytics, NewAlert, RawReading,
    RegionalReading, Sensor, SensorRow, Store, UpsertAction,
};

use super::{sensors_from_rows, SensorStore};

// ---

/// PostgREST's default `max-rows`; reads page through results at this size.
const PAGE_SIZE: usize = 1000;

const SENSOR_SELECT: &str = "sensor_id,sensor_name,sensor_type,sensor_ip,sensor_port,store_id,\
organization_id,timezone,is_active,status,consecutive_failures,offline_since,recovery_attempts,\
circuit_state,last_successful_check,last_failed_check,\
stores(name,organization_id,timezone,organizations(name))";

#[derive(Debug, Deserialize)]
struct EmbeddedOrganization {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddedStore {
    name: String,
    organization_id: Option<Uuid>,
    timezone: Option<String>,
    organizations: Option<EmbeddedOrganization>,
}

/// `sensor_metadata` row with its store embedded by PostgREST.
#[derive(Debug, Deserialize)]
struct SensorRecord {
    sensor_id: Uuid,
    sensor_name: String,
    sensor_type: String,
    sensor_ip: String,
    sensor_port: i32,
    store_id: Uuid,
    organization_id: Option<Uuid>,
    timezone: Option<String>,
    is_active: bool,
    status: String,
    consecutive_failures: i32,
    offline_since: Option<DateTime<Utc>>,
    recovery_attempts: i32,
    circuit_state: Option<String>,
    last_successful_check: Option<DateTime<Utc>>,
    last_failed_check: Option<DateTime<Utc>>,
    stores: Option<EmbeddedStore>,
}

impl From<SensorRecord> for SensorRow {
    fn from(r: SensorRecord) -> Self {
        // ---
        let store = r.stores;
        SensorRow {
            sensor_id: r.sensor_id,
            sensor_name: r.sensor_name,
            sensor_type: r.sensor_type,
            sensor_ip: r.sensor_ip,
            sensor_port: r.sensor_port,
            store_id: r.store_id,
            store_name: store.as_ref().map(|s| s.name.clone()),
            organization_id: r
                .organization_id
                .or_else(|| store.as_ref().and_then(|s| s.organization_id)),
            organization_name: store
                .as_ref()
                .and_then(|s| s.organizations.as_ref())
                .map(|o| o.name.clone()),
            timezone: r
                .timezone
                .or_else(|| store.as_ref().and_then(|s| s.timezone.clone())),
            is_active: r.is_active,
            status: r.status,
            consecutive_failures: r.consecutive_failures,
            offline_since: r.offline_since,
            recovery_attempts: r.recovery_attempts,
            circuit_state: r.circuit_state,
            last_successful_check: r.last_successful_check,
            last_failed_check: r.last_failed_check,
        }
    }
}

/// PATCH body for the circuit columns; `None` checks are left untouched.
#[derive(Debug, Serialize)]
struct CircuitPatch<'a> {
    status: &'a str,
    consecutive_failures: u32,
    offline_since: Option<DateTime<Utc>>,
    recovery_attempts: u32,
    circuit_state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_successful_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_failed_check: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

/// Render a timestamp for a PostgREST filter value.
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl RestStore {
    pub fn new(base_url: String, service_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            service_key,
        }
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        // ---
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, table))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn check(table: &str, resp: Response) -> Result<Response> {
        // ---
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                table: table.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    /// GET every row matching `filters`, one page at a time.
    async fn select_all<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>> {
        // ---
        let mut all_rows = Vec::new();
        let mut page_count = 0;

        loop {
            let offset = page_count * PAGE_SIZE;
            page_count += 1;

            let resp = self
                .request(Method::GET, table)
                .query(filters)
                .query(&[("limit", PAGE_SIZE), ("offset", offset)])
                .send()
                .await?;
            let page: Vec<T> = Self::check(table, resp).await?.json().await?;
            let fetched = page.len();
            all_rows.extend(page);

            tracing::debug!(table, page = page_count, fetched, "Fetched page");
            if fetched < PAGE_SIZE {
                break;
            }
        }

        Ok(all_rows)
    }

    /// Whether a row matching `filters` exists.
    async fn exists(&self, table: &str, filters: &[(&str, String)]) -> Result<bool> {
        // ---
        let resp = self
            .request(Method::GET, table)
            .query(filters)
            .query(&[("select", "*"), ("limit", "1")])
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = Self::check(table, resp).await?.json().await?;
        Ok(!rows.is_empty())
    }

    /// Native upsert of `body` (object or array) on `on_conflict`.
    async fn merge<B: Serialize + ?Sized>(&self, table: &str, on_conflict: &str, body: &B) -> Result<()> {
        // ---
        let resp = self
            .request(Method::POST, table)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(body)
            .send()
            .await?;
        Self::check(table, resp).await?;
        Ok(())
    }

    async fn insert<B: Serialize + ?Sized>(&self, table: &str, body: &B) -> Result<()> {
        // ---
        let resp = self
            .request(Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;
        Self::check(table, resp).await?;
        Ok(())
    }

    async fn upsert_keyed<B: Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: &str,
        key: &[(&str, String)],
        body: &B,
    ) -> Result<UpsertAction> {
        // ---
        let existed = self.exists(table, key).await?;
        self.merge(table, on_conflict, body).await?;
        Ok(if existed {
            UpsertAction::Updated
        } else {
            UpsertAction::Inserted
        })
    }

    async fn fetch_sensors(&self, status_filter: &str) -> Result<Vec<Sensor>> {
        // ---
        let records: Vec<SensorRecord> = self
            .select_all(
                "sensor_metadata",
                &[
                    ("select", SENSOR_SELECT.to_string()),
                    ("is_active", "eq.true".to_string()),
                    ("status", status_filter.to_string()),
                    ("order", "sensor_name.asc".to_string()),
                ],
            )
            .await?;
        Ok(sensors_from_rows(records.into_iter().map(SensorRow::from).collect()))
    }
}

#[async_trait]
impl SensorStore for RestStore {
    async fn get_active_sensors(&self) -> Result<Vec<Sensor>> {
        self.fetch_sensors("in.(online,warning)").await
    }

    async fn get_offline_sensors(&self) -> Result<Vec<Sensor>> {
        self.fetch_sensors("eq.offline").await
    }

    async fn upsert_sensor_data(&self, reading: &RawReading) -> Result<UpsertAction> {
        // ---
        self.upsert_keyed(
            "people_counting_raw",
            "sensor_id,timestamp",
            &[
                ("sensor_id", eq(reading.sensor_id)),
                ("timestamp", eq(ts(reading.timestamp))),
            ],
            reading,
        )
        .await
    }

    async fn upsert_regional_data(&self, readings: &[RegionalReading]) -> Result<usize> {
        // ---
        if readings.is_empty() {
            return Ok(0);
        }
        self.merge("regional_counting_raw", "sensor_id,timestamp", readings)
            .await?;
        Ok(readings.len())
    }

    async fn update_sensor_health(&self, sensor_id: Uuid, u: &CircuitUpdate) -> Result<()> {
        // ---
        let patch = CircuitPatch {
            status: u.status.as_str(),
            consecutive_failures: u.consecutive_failures,
            offline_since: u.offline_since,
            recovery_attempts: u.recovery_attempts,
            circuit_state: u.circuit_state.as_str(),
            last_successful_check: u.last_successful_check,
            last_failed_check: u.last_failed_check,
            updated_at: Utc::now(),
        };
        let resp = self
            .request(Method::PATCH, "sensor_metadata")
            .query(&[("sensor_id", eq(sensor_id))])
            .header("Prefer", "return=minimal")
            .json(&patch)
            .send()
            .await?;
        Self::check("sensor_metadata", resp).await?;
        Ok(())
    }

    async fn create_alert(&self, alert: &NewAlert) -> Result<()> {
        self.insert("alerts", alert).await
    }

    async fn log_sensor_health(&self, entry: &HealthLogEntry) -> Result<()> {
        self.insert("sensor_health_log", entry).await
    }

    async fn get_stores(&self) -> Result<Vec<Store>> {
        // ---
        self.select_all(
            "stores",
            &[
                ("select", "id,name,organization_id,timezone".to_string()),
                ("order", "name.asc".to_string()),
            ],
        )
        .await
    }

    async fn get_raw_readings(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawReading>> {
        // ---
        self.select_all(
            "people_counting_raw",
            &[
                ("select", "sensor_id,store_id,timestamp,end_time,line1_in,line1_out,line2_in,line2_out,line3_in,line3_out,line4_in,line4_out".to_string()),
                ("store_id", eq(store_id)),
                ("timestamp", format!("gte.{}", ts(from))),
                ("timestamp", format!("lt.{}", ts(to))),
                ("order", "timestamp.asc".to_string()),
            ],
        )
        .await
    }

    async fn get_regional_readings(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RegionalReading>> {
        // ---
        self.select_all(
            "regional_counting_raw",
            &[
                ("select", "sensor_id,store_id,timestamp,end_time,region1_count,region2_count,region3_count,region4_count,avg_dwell_seconds".to_string()),
                ("store_id", eq(store_id)),
                ("timestamp", format!("gte.{}", ts(from))),
                ("timestamp", format!("lt.{}", ts(to))),
                ("order", "timestamp.asc".to_string()),
            ],
        )
        .await
    }

    async fn upsert_hourly(&self, row: &HourlyAnalytics) -> Result<UpsertAction> {
        // ---
        self.upsert_keyed(
            "hourly_analytics",
            "store_id,date,hour",
            &[
                ("store_id", eq(row.store_id)),
                ("date", eq(row.date)),
                ("hour", eq(row.hour)),
            ],
            row,
        )
        .await
    }

    async fn get_hourly(&self, store_id: Uuid, date: NaiveDate) -> Result<Vec<HourlyAnalytics>> {
        // ---
        self.select_all(
            "hourly_analytics",
            &[
                ("store_id", eq(store_id)),
                ("date", eq(date)),
                ("order", "hour.asc".to_string()),
            ],
        )
        .await
    }

    async fn upsert_daily(&self, row: &DailyAnalytics) -> Result<UpsertAction> {
        // ---
        self.upsert_keyed(
            "daily_analytics",
            "store_id,date",
            &[("store_id", eq(row.store_id)), ("date", eq(row.date))],
            row,
        )
        .await
    }
}
