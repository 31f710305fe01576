//! Direct Postgres backend (`DATABASE_URL`), built on a `sqlx` pool.
//!
//! Every write is a single `INSERT … ON CONFLICT … DO UPDATE` against the
//! table's identity constraint, so concurrent runs cannot create duplicate
//! rows. `RETURNING (xmax = 0)` tells an insert apart from an update.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    CircuitUpdate, DailyAnalytics, HealthLogEntry, HourlyAnalytics, NewAlert, RawReading,
    RegionalReading, Sensor, SensorRow, Store, UpsertAction,
};

use super::{sensors_from_rows, SensorStore};

// ---

const SENSOR_SELECT: &str = r#"
    SELECT sm.sensor_id,
           sm.sensor_name,
           sm.sensor_type,
           sm.sensor_ip,
           sm.sensor_port,
           sm.store_id,
           st.name AS store_name,
           COALESCE(sm.organization_id, st.organization_id) AS organization_id,
           o.name AS organization_name,
           COALESCE(sm.timezone, st.timezone) AS timezone,
           sm.is_active,
           sm.status,
           sm.consecutive_failures,
           sm.offline_since,
           sm.recovery_attempts,
           sm.circuit_state,
           sm.last_successful_check,
           sm.last_failed_check
      FROM sensor_metadata sm
      LEFT JOIN stores st ON st.id = sm.store_id
      LEFT JOIN organizations o ON o.id = COALESCE(sm.organization_id, st.organization_id)
     WHERE sm.is_active
       AND sm.status = ANY($1)
     ORDER BY sm.sensor_name
"#;

const RAW_COLUMNS: &[&str] = &[
    "sensor_id",
    "store_id",
    "\"timestamp\"",
    "end_time",
    "line1_in",
    "line1_out",
    "line2_in",
    "line2_out",
    "line3_in",
    "line3_out",
    "line4_in",
    "line4_out",
];

const REGIONAL_COLUMNS: &[&str] = &[
    "sensor_id",
    "store_id",
    "\"timestamp\"",
    "end_time",
    "region1_count",
    "region2_count",
    "region3_count",
    "region4_count",
    "avg_dwell_seconds",
];

const HOURLY_COLUMNS: &[&str] = &[
    "store_id",
    "date",
    "hour",
    "start_time",
    "end_time",
    "store_entries",
    "store_exits",
    "passerby_count",
    "passerby_in",
    "passerby_out",
    "capture_rate",
    "line1_in",
    "line1_out",
    "line2_in",
    "line2_out",
    "line3_in",
    "line3_out",
    "entry_line1_pct",
    "entry_line2_pct",
    "entry_line3_pct",
    "exit_line1_pct",
    "exit_line2_pct",
    "exit_line3_pct",
    "zone1_peak_occupancy",
    "zone2_peak_occupancy",
    "zone3_peak_occupancy",
    "zone4_peak_occupancy",
    "avg_dwell_seconds",
    "is_business_hours",
    "sample_count",
];

const DAILY_COLUMNS: &[&str] = &[
    "store_id",
    "date",
    "total_entries",
    "total_exits",
    "total_passerby",
    "capture_rate",
    "peak_hour",
    "peak_hour_entries",
    "peak_exit_hour",
    "peak_exit_count",
    "peak_traffic_hour",
    "peak_traffic_count",
    "peak_passerby_hour",
    "peak_passerby_count",
    "business_hours_entries",
    "after_hours_entries",
    "entry_line1_pct",
    "entry_line2_pct",
    "entry_line3_pct",
    "exit_line1_pct",
    "exit_line2_pct",
    "exit_line3_pct",
    "zone1_peak_occupancy",
    "zone1_peak_hour",
    "zone2_peak_occupancy",
    "zone2_peak_hour",
    "zone3_peak_occupancy",
    "zone3_peak_hour",
    "zone4_peak_occupancy",
    "zone4_peak_hour",
    "avg_dwell_seconds",
    "hours_with_data",
];

/// Build `INSERT … ON CONFLICT (keys) DO UPDATE SET … RETURNING (xmax = 0)`.
///
/// Every non-key column is overwritten on conflict.
fn upsert_sql(table: &str, columns: &[&str], keys: &[&str]) -> String {
    // ---
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !keys.contains(*c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .chain(std::iter::once("updated_at = NOW()".to_string()))
        .collect();

    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted",
        columns.join(", "),
        placeholders.join(", "),
        keys.join(", "),
        updates.join(", "),
    )
}

fn action(inserted: bool) -> UpsertAction {
    if inserted {
        UpsertAction::Inserted
    } else {
        UpsertAction::Updated
    }
}

pub struct PgStore {
    pool: PgPool,
    raw_upsert: String,
    regional_upsert: String,
    hourly_upsert: String,
    daily_upsert: String,
}

impl PgStore {
    /// Open a pool against `db_url`.
    pub async fn connect(db_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        // ---
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

        tracing::info!("Successfully connected to database");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        // ---
        let reading_key = &["sensor_id", "\"timestamp\""];
        Self {
            pool,
            raw_upsert: upsert_sql("people_counting_raw", RAW_COLUMNS, reading_key),
            regional_upsert: upsert_sql("regional_counting_raw", REGIONAL_COLUMNS, reading_key),
            hourly_upsert: upsert_sql("hourly_analytics", HOURLY_COLUMNS, &["store_id", "date", "hour"]),
            daily_upsert: upsert_sql("daily_analytics", DAILY_COLUMNS, &["store_id", "date"]),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_sensors(&self, statuses: &[&str]) -> Result<Vec<Sensor>> {
        // ---
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        let rows: Vec<SensorRow> = sqlx::query_as(SENSOR_SELECT)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await?;
        Ok(sensors_from_rows(rows))
    }
}

#[async_trait]
impl SensorStore for PgStore {
    async fn get_active_sensors(&self) -> Result<Vec<Sensor>> {
        self.fetch_sensors(&["online", "warning"]).await
    }

    async fn get_offline_sensors(&self) -> Result<Vec<Sensor>> {
        self.fetch_sensors(&["offline"]).await
    }

    async fn upsert_sensor_data(&self, r: &RawReading) -> Result<UpsertAction> {
        // ---
        let inserted: bool = sqlx::query_scalar(&self.raw_upsert)
            .bind(r.sensor_id)
            .bind(r.store_id)
            .bind(r.timestamp)
            .bind(r.end_time)
            .bind(r.line1_in)
            .bind(r.line1_out)
            .bind(r.line2_in)
            .bind(r.line2_out)
            .bind(r.line3_in)
            .bind(r.line3_out)
            .bind(r.line4_in)
            .bind(r.line4_out)
            .fetch_one(&self.pool)
            .await?;
        Ok(action(inserted))
    }

    async fn upsert_regional_data(&self, readings: &[RegionalReading]) -> Result<usize> {
        // ---
        let mut tx = self.pool.begin().await?;
        for r in readings {
            sqlx::query(&self.regional_upsert)
                .bind(r.sensor_id)
                .bind(r.store_id)
                .bind(r.timestamp)
                .bind(r.end_time)
                .bind(r.region1_count)
                .bind(r.region2_count)
                .bind(r.region3_count)
                .bind(r.region4_count)
                .bind(r.avg_dwell_seconds)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(readings.len())
    }

    async fn update_sensor_health(&self, sensor_id: Uuid, u: &CircuitUpdate) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            UPDATE sensor_metadata
               SET status = $2,
                   consecutive_failures = $3,
                   offline_since = $4,
                   recovery_attempts = $5,
                   circuit_state = $6,
                   last_successful_check = COALESCE($7, last_successful_check),
                   last_failed_check = COALESCE($8, last_failed_check),
                   updated_at = NOW()
             WHERE sensor_id = $1
            "#,
        )
        .bind(sensor_id)
        .bind(u.status.as_str())
        .bind(u.consecutive_failures as i32)
        .bind(u.offline_since)
        .bind(u.recovery_attempts as i32)
        .bind(u.circuit_state.as_str())
        .bind(u.last_successful_check)
        .bind(u.last_failed_check)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_alert(&self, a: &NewAlert) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, organization_id, store_id, sensor_id, alert_type,
                severity, title, message, metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(a.id)
        .bind(a.organization_id)
        .bind(a.store_id)
        .bind(a.sensor_id)
        .bind(&a.alert_type)
        .bind(a.severity.as_str())
        .bind(&a.title)
        .bind(&a.message)
        .bind(a.metadata.clone())
        .bind(a.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_sensor_health(&self, e: &HealthLogEntry) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO sensor_health_log (
                sensor_id, status, response_time_ms, readings_count, error_message, checked_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(e.sensor_id)
        .bind(e.status.as_str())
        .bind(e.response_time_ms)
        .bind(e.readings_count)
        .bind(e.error_message.as_deref())
        .bind(e.checked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_stores(&self) -> Result<Vec<Store>> {
        // ---
        let stores = sqlx::query_as::<_, Store>(
            "SELECT id, name, organization_id, timezone FROM stores ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(stores)
    }

    async fn get_raw_readings(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawReading>> {
        // ---
        let rows = sqlx::query_as::<_, RawReading>(&format!(
            "SELECT {} FROM people_counting_raw \
             WHERE store_id = $1 AND \"timestamp\" >= $2 AND \"timestamp\" < $3 \
             ORDER BY \"timestamp\"",
            RAW_COLUMNS.join(", ")
        ))
        .bind(store_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_regional_readings(
        &self,
        store_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RegionalReading>> {
        // ---
        let rows = sqlx::query_as::<_, RegionalReading>(&format!(
            "SELECT {} FROM regional_counting_raw \
             WHERE store_id = $1 AND \"timestamp\" >= $2 AND \"timestamp\" < $3 \
             ORDER BY \"timestamp\"",
            REGIONAL_COLUMNS.join(", ")
        ))
        .bind(store_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_hourly(&self, h: &HourlyAnalytics) -> Result<UpsertAction> {
        // ---
        let inserted: bool = sqlx::query_scalar(&self.hourly_upsert)
            .bind(h.store_id)
            .bind(h.date)
            .bind(h.hour)
            .bind(h.start_time)
            .bind(h.end_time)
            .bind(h.store_entries)
            .bind(h.store_exits)
            .bind(h.passerby_count)
            .bind(h.passerby_in)
            .bind(h.passerby_out)
            .bind(h.capture_rate)
            .bind(h.line1_in)
            .bind(h.line1_out)
            .bind(h.line2_in)
            .bind(h.line2_out)
            .bind(h.line3_in)
            .bind(h.line3_out)
            .bind(h.entry_line1_pct)
            .bind(h.entry_line2_pct)
            .bind(h.entry_line3_pct)
            .bind(h.exit_line1_pct)
            .bind(h.exit_line2_pct)
            .bind(h.exit_line3_pct)
            .bind(h.zone1_peak_occupancy)
            .bind(h.zone2_peak_occupancy)
            .bind(h.zone3_peak_occupancy)
            .bind(h.zone4_peak_occupancy)
            .bind(h.avg_dwell_seconds)
            .bind(h.is_business_hours)
            .bind(h.sample_count)
            .fetch_one(&self.pool)
            .await?;
        Ok(action(inserted))
    }

    async fn get_hourly(&self, store_id: Uuid, date: NaiveDate) -> Result<Vec<HourlyAnalytics>> {
        // ---
        let rows = sqlx::query_as::<_, HourlyAnalytics>(&format!(
            "SELECT {} FROM hourly_analytics WHERE store_id = $1 AND date = $2 ORDER BY hour",
            HOURLY_COLUMNS.join(", ")
        ))
        .bind(store_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_daily(&self, d: &DailyAnalytics) -> Result<UpsertAction> {
        // ---
        let inserted: bool = sqlx::query_scalar(&self.daily_upsert)
            .bind(d.store_id)
            .bind(d.date)
            .bind(d.total_entries)
            .bind(d.total_exits)
            .bind(d.total_passerby)
            .bind(d.capture_rate)
            .bind(d.peak_hour)
            .bind(d.peak_hour_entries)
            .bind(d.peak_exit_hour)
            .bind(d.peak_exit_count)
            .bind(d.peak_traffic_hour)
            .bind(d.peak_traffic_count)
            .bind(d.peak_passerby_hour)
            .bind(d.peak_passerby_count)
            .bind(d.business_hours_entries)
            .bind(d.after_hours_entries)
            .bind(d.entry_line1_pct)
            .bind(d.entry_line2_pct)
            .bind(d.entry_line3_pct)
            .bind(d.exit_line1_pct)
            .bind(d.exit_line2_pct)
            .bind(d.exit_line3_pct)
            .bind(d.zone1_peak_occupancy)
            .bind(d.zone1_peak_hour)
            .bind(d.zone2_peak_occupancy)
            .bind(d.zone2_peak_hour)
            .bind(d.zone3_peak_occupancy)
            .bind(d.zone3_peak_hour)
            .bind(d.zone4_peak_occupancy)
            .bind(d.zone4_peak_hour)
            .bind(d.avg_dwell_seconds)
            .bind(d.hours_with_data)
            .fetch_one(&self.pool)
            .await?;
        Ok(action(inserted))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_upsert_sql_for_composite_key() {
        // ---
        let sql = upsert_sql(
            "daily_analytics",
            &["store_id", "date", "total_entries"],
            &["store_id", "date"],
        );
        assert_eq!(
            sql,
            "INSERT INTO daily_analytics (store_id, date, total_entries) VALUES ($1, $2, $3) \
             ON CONFLICT (store_id, date) DO UPDATE SET total_entries = EXCLUDED.total_entries, \
             updated_at = NOW() RETURNING (xmax = 0) AS inserted"
        );
    }

    #[test]
    fn test_placeholder_counts_match_columns() {
        // ---
        assert_eq!(HOURLY_COLUMNS.len(), 30);
        assert_eq!(DAILY_COLUMNS.len(), 32);
        let sql = upsert_sql("hourly_analytics", HOURLY_COLUMNS, &["store_id", "date", "hour"]);
        assert!(sql.contains("$30)"));
        assert!(!sql.contains("$31"));
        assert!(sql.contains("ON CONFLICT (store_id, date, hour)"));
        assert!(!sql.contains("hour = EXCLUDED.hour"));
    }

    #[test]
    fn test_raw_upsert_targets_reading_identity() {
        // ---
        let sql = upsert_sql("people_counting_raw", RAW_COLUMNS, &["sensor_id", "\"timestamp\""]);
        assert!(sql.contains("ON CONFLICT (sensor_id, \"timestamp\")"));
        assert!(sql.contains("line4_out = EXCLUDED.line4_out"));
        assert!(!sql.contains("sensor_id = EXCLUDED"));
    }
}
