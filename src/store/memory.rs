//! In-process store with the same identity keys as the warehouse tables.
//!
//! Used by the test suites and for dry runs; every upsert goes through a
//! keyed map so duplicate-row bugs show up here exactly as they would in
//! Postgres.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{
    CircuitUpdate, DailyAnalytics, HealthLogEntry, HourlyAnalytics, NewAlert, RawReading,
    RegionalReading, Sensor, SensorStatus, Store, UpsertAction,
};

use super::SensorStore;

// ---

#[derive(Default)]
struct Tables {
    sensors: BTreeMap<Uuid, Sensor>,
    stores: BTreeMap<Uuid, Store>,
    raw: BTreeMap<(Uuid, DateTime<Utc>), RawReading>,
    regional: BTreeMap<(Uuid, DateTime<Utc>), RegionalReading>,
    hourly: BTreeMap<(Uuid, NaiveDate, i32), HourlyAnalytics>,
    daily: BTreeMap<(Uuid, NaiveDate), DailyAnalytics>,
    alerts: Vec<NewAlert>,
    health_log: Vec<HealthLogEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_health_log: AtomicBool,
    fail_raw_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A panicking test thread must not hide the data from the others.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_store(&self, store: Store) {
        self.tables().stores.insert(store.id, store);
    }

    pub fn add_sensor(&self, sensor: Sensor) {
        self.tables().sensors.insert(sensor.sensor_id, sensor);
    }

    /// Make every `log_sensor_health` call fail.
    pub fn fail_health_log(&self, fail: bool) {
        self.fail_health_log.store(fail, Ordering::SeqCst);
    }

    /// Make every raw/regional write fail.
    pub fn fail_raw_writes(&self, fail: bool) {
        self.fail_raw_writes.store(fail, Ordering::SeqCst);
    }

    pub fn sensor(&self, sensor_id: Uuid) -> Option<Sensor> {
        self.tables().sensors.get(&sensor_id).cloned()
    }

    pub fn raw_readings(&self) -> Vec<RawReading> {
        self.tables().raw.values().cloned().collect()
    }

    pub fn regional_readings(&self) -> Vec<RegionalReading> {
        self.tables().regional.values().cloned().collect()
    }

    pub fn hourly_rows(&self) -> Vec<HourlyAnalytics> {
        self.tables().hourly.values().cloned().collect()
    }

    pub fn daily_rows(&self) -> Vec<DailyAnalytics> {
        self.tables().daily.values().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<NewAlert> {
        self.tables().alerts.clone()
    }

    pub fn health_log(&self) -> Vec<HealthLogEntry> {
        self.tables().health_log.clone()
    }

    fn check_raw_writes(&self) -> Result<()> {
        if self.fail_raw_writes.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidRow("raw writes disabled".to_string()));
        }
        Ok(())
    }
}

/// Shared by the keyed maps: insert or overwrite, reporting which happened.
fn upsert<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V) -> UpsertAction {
    match map.insert(key, value) {
        Some(_) => UpsertAction::Updated,
        None => UpsertAction::Inserted,
    }
}

#[async_trait]
impl SensorStore for MemoryStore {
    async fn get_active_sensors(&self) -> Result<Vec<Sensor>> {
        Ok(self
            .tables()
            .sensors
            .values()
            .filter(|s| s.is_active && s.status != SensorStatus::Offline)
            .cloned()
            .collect())
    }

    async fn get_offline_sensors(&self) -> Result<Vec<Sensor>> {
        Ok(self
            .tables()
            .sensors
            .values()
            .filter(|s| s.is_active && s.status == SensorStatus::Offline)
            .cloned()
            .collect())
    }

    async fn upsert_sensor_data(&self, reading: &RawReading) -> Result<UpsertAction> {
        self.check_raw_writes()?;
        let key = (reading.sensor_id, reading.timestamp);
        Ok(upsert(&mut self.tables().raw, key, reading.clone()))
    }

    async fn upsert_regional_data(&self, readings: &[RegionalReading]) -> Result<usize> {
        self.check_raw_writes()?;
        let mut tables = self.tables();
        for reading in readings {
            let key = (reading.sensor_id, reading.timestamp);
            upsert(&mut tables.regional, key, reading.clone());
        }
        Ok(readings.len())
    }

    async fn update_sensor_health(&self, sensor_id: Uuid, update: &CircuitUpdate) -> Result<()> {
        let mut tables = self.tables();
        let sensor = tables
            .sensors
            .get_mut(&sensor_id)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown sensor {sensor_id}")))?;
        sensor.apply(update);
        Ok(())
    }

    async fn create_alert(&self, alert: &NewAlert) -> Result<()> {
        self.tables().alerts.push(alert.clone());
        Ok(())
    }

    async fn log_sensor_health(&self, entry: &HealthLogEntry) -> Result<()> {
        if self.fail_health_log.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidRow("health log unavailable".to_string()));
        }
        self.tables().health_log.push(entry.clone());
        Ok(())
    }

    async fn get_stores(&self) -> Result<Vec<Store>> {
        Ok(self.tables().stores.values().cloned().collect())
    }

    async fn get_raw_readings(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawReading>> {
        let mut rows: Vec<RawReading> = self
            .tables()
            .raw
            .values()
            .filter(|r| r.store_id == store_id && r.timestamp >= from && r.timestamp < to)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    async fn get_regional_readings(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RegionalReading>> {
        let mut rows: Vec<RegionalReading> = self
            .tables()
            .regional
            .values()
            .filter(|r| r.store_id == store_id && r.timestamp >= from && r.timestamp < to)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    async fn upsert_hourly(&self, row: &HourlyAnalytics) -> Result<UpsertAction> {
        let key = (row.store_id, row.date, row.hour);
        Ok(upsert(&mut self.tables().hourly, key, row.clone()))
    }

    async fn get_hourly(&self, store_id: Uuid, date: NaiveDate) -> Result<Vec<HourlyAnalytics>> {
        // BTreeMap order already sorts by hour within (store, date).
        Ok(self
            .tables()
            .hourly
            .values()
            .filter(|r| r.store_id == store_id && r.date == date)
            .cloned()
            .collect())
    }

    async fn upsert_daily(&self, row: &DailyAnalytics) -> Result<UpsertAction> {
        let key = (row.store_id, row.date);
        Ok(upsert(&mut self.tables().daily, key, row.clone()))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn create_test_reading(sensor_id: Uuid, store_id: Uuid, line1_in: i64) -> RawReading {
        // ---
        let ts = Utc.with_ymd_and_hms(2025, 7, 22, 10, 0, 0).unwrap();
        RawReading {
            sensor_id,
            store_id,
            timestamp: ts,
            end_time: ts + chrono::Duration::hours(1),
            line1_in,
            line1_out: 0,
            line2_in: 0,
            line2_out: 0,
            line3_in: 0,
            line3_out: 0,
            line4_in: 0,
            line4_out: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_sensor_data_is_idempotent() {
        // ---
        let store = MemoryStore::new();
        let reading = create_test_reading(Uuid::new_v4(), Uuid::new_v4(), 12);

        let first = store.upsert_sensor_data(&reading).await.unwrap();
        let second = store.upsert_sensor_data(&reading).await.unwrap();

        assert_eq!(first, UpsertAction::Inserted);
        assert_eq!(second, UpsertAction::Updated);
        assert_eq!(store.raw_readings().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_counts() {
        // ---
        let store = MemoryStore::new();
        let (sensor_id, store_id) = (Uuid::new_v4(), Uuid::new_v4());

        store
            .upsert_sensor_data(&create_test_reading(sensor_id, store_id, 12))
            .await
            .unwrap();
        store
            .upsert_sensor_data(&create_test_reading(sensor_id, store_id, 30))
            .await
            .unwrap();

        let rows = store.raw_readings();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].line1_in, 30);
    }

    #[tokio::test]
    async fn test_raw_range_is_half_open() {
        // ---
        let store = MemoryStore::new();
        let (sensor_id, store_id) = (Uuid::new_v4(), Uuid::new_v4());
        let reading = create_test_reading(sensor_id, store_id, 1);
        store.upsert_sensor_data(&reading).await.unwrap();

        let hit = store
            .get_raw_readings(store_id, reading.timestamp, reading.end_time)
            .await
            .unwrap();
        let miss = store
            .get_raw_readings(
                store_id,
                reading.timestamp - chrono::Duration::hours(1),
                reading.timestamp,
            )
            .await
            .unwrap();

        assert_eq!(hit.len(), 1);
        assert!(miss.is_empty());
    }
}
