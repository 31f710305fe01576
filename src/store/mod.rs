//! Warehouse repository: the only way the pipeline reads or writes tables.
//!
//! The trait is the gateway the jobs depend on; backends live in sibling
//! modules and are picked once at startup from [`StoreConfig`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::models::{
    CircuitUpdate, DailyAnalytics, HealthLogEntry, HourlyAnalytics, NewAlert, RawReading,
    RegionalReading, Sensor, Store, UpsertAction,
};

mod memory;
mod postgres;
mod rest;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use rest::RestStore;

// ---

#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Active sensors with `status` online or warning, joined with store and organization.
    async fn get_active_sensors(&self) -> Result<Vec<Sensor>>;

    /// Active sensors currently marked offline (circuit recovery candidates).
    async fn get_offline_sensors(&self) -> Result<Vec<Sensor>>;

    /// Insert-or-update one raw reading keyed by (`sensor_id`, `timestamp`).
    async fn upsert_sensor_data(&self, reading: &RawReading) -> Result<UpsertAction>;

    /// Insert-or-update regional readings keyed by (`sensor_id`, `timestamp`).
    /// Returns the number of rows written.
    async fn upsert_regional_data(&self, readings: &[RegionalReading]) -> Result<usize>;

    /// Partial update of the circuit-breaker columns.
    async fn update_sensor_health(&self, sensor_id: Uuid, update: &CircuitUpdate) -> Result<()>;

    async fn create_alert(&self, alert: &NewAlert) -> Result<()>;

    async fn log_sensor_health(&self, entry: &HealthLogEntry) -> Result<()>;

    async fn get_stores(&self) -> Result<Vec<Store>>;

    /// Raw readings of a store with `from <= timestamp < to`, ordered by timestamp.
    async fn get_raw_readings(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawReading>>;

    /// Regional readings of a store with `from <= timestamp < to`, ordered by timestamp.
    async fn get_regional_readings(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RegionalReading>>;

    /// Overwrite the hourly row keyed by (`store_id`, `date`, `hour`).
    async fn upsert_hourly(&self, row: &HourlyAnalytics) -> Result<UpsertAction>;

    /// Hourly rows of a store for one local date, ordered by hour.
    async fn get_hourly(&self, store_id: Uuid, date: NaiveDate) -> Result<Vec<HourlyAnalytics>>;

    /// Overwrite the daily row keyed by (`store_id`, `date`).
    async fn upsert_daily(&self, row: &DailyAnalytics) -> Result<UpsertAction>;
}

/// Build the backend named by the configuration.
pub async fn connect(config: &StoreConfig) -> anyhow::Result<Arc<dyn SensorStore>> {
    // ---
    match config {
        StoreConfig::Postgres { db_url, pool_max } => {
            let store = PgStore::connect(db_url, *pool_max).await?;
            Ok(Arc::new(store))
        }
        StoreConfig::Rest {
            base_url,
            service_key,
        } => Ok(Arc::new(RestStore::new(base_url.clone(), service_key.clone()))),
    }
}

/// Convert rows into sensors, dropping (and logging) rows that do not parse.
fn sensors_from_rows(rows: Vec<crate::models::SensorRow>) -> Vec<Sensor> {
    // ---
    rows.into_iter()
        .filter_map(|row| {
            let name = row.sensor_name.clone();
            match Sensor::try_from(row) {
                Ok(sensor) => Some(sensor),
                Err(e) => {
                    tracing::warn!(sensor = %name, error = %e, "Skipping sensor with invalid metadata");
                    None
                }
            }
        })
        .collect()
}
