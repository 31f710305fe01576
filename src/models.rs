//! Data models for the foot-traffic pipeline.
//!
//! Row structs mirror the warehouse tables one-to-one so both store backends
//! (sqlx rows and PostgREST JSON) can share them. Domain enums are parsed out
//! of the flat text columns at the edge.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

// ---

/// Number of counting lines a people counter reports.
pub const LINE_COUNT: usize = 4;

/// Lines 1..=3 face the store entrance; line 4 counts sidewalk passerby.
pub const STORE_LINES: usize = 3;

/// Number of occupancy regions a regional counter reports.
pub const ZONE_COUNT: usize = 4;

/// Vendor family of a sensor, which decides credentials and endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    // ---
    MilesightPeopleCounter,
    Omnia,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::MilesightPeopleCounter => "milesight_people_counter",
            SensorType::Omnia => "omnia",
        }
    }

    /// Whether the sensor also serves the regional occupancy log.
    pub fn has_regional_counts(&self) -> bool {
        matches!(self, SensorType::Omnia)
    }
}

impl std::str::FromStr for SensorType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "milesight_people_counter" | "milesight" => Ok(SensorType::MilesightPeopleCounter),
            "omnia" => Ok(SensorType::Omnia),
            other => Err(StoreError::InvalidRow(format!("unknown sensor_type '{other}'"))),
        }
    }
}

/// Health status shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    // ---
    Online,
    Warning,
    Offline,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Online => "online",
            SensorStatus::Warning => "warning",
            SensorStatus::Offline => "offline",
        }
    }
}

impl std::str::FromStr for SensorStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(SensorStatus::Online),
            "warning" => Ok(SensorStatus::Warning),
            "offline" => Ok(SensorStatus::Offline),
            other => Err(StoreError::InvalidRow(format!("unknown status '{other}'"))),
        }
    }
}

/// Flat `circuit_state` column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    // ---
    Closed,
    Open,
    HalfOpen,
}

impl CircuitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitPhase::Closed => "CLOSED",
            CircuitPhase::Open => "OPEN",
            CircuitPhase::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::str::FromStr for CircuitPhase {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLOSED" => Ok(CircuitPhase::Closed),
            "OPEN" => Ok(CircuitPhase::Open),
            "HALF_OPEN" => Ok(CircuitPhase::HalfOpen),
            other => Err(StoreError::InvalidRow(format!("unknown circuit_state '{other}'"))),
        }
    }
}

/// `sensor_metadata` joined with its store and organization, as stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorRow {
    // ---
    pub sensor_id: Uuid,
    pub sensor_name: String,
    pub sensor_type: String,
    pub sensor_ip: String,
    pub sensor_port: i32,
    pub store_id: Uuid,
    pub store_name: Option<String>,
    pub organization_id: Option<Uuid>,
    pub organization_name: Option<String>,
    pub timezone: Option<String>,
    pub is_active: bool,
    pub status: String,
    pub consecutive_failures: i32,
    pub offline_since: Option<DateTime<Utc>>,
    pub recovery_attempts: i32,
    pub circuit_state: Option<String>,
    pub last_successful_check: Option<DateTime<Utc>>,
    pub last_failed_check: Option<DateTime<Utc>>,
}

/// A sensor with its text columns parsed into domain types.
#[derive(Debug, Clone)]
pub struct Sensor {
    // ---
    pub sensor_id: Uuid,
    pub sensor_name: String,
    pub sensor_type: SensorType,
    pub ip_address: String,
    pub port: u16,
    pub store_id: Uuid,
    pub store_name: Option<String>,
    pub organization_id: Option<Uuid>,
    pub organization_name: Option<String>,
    pub timezone: Tz,
    pub is_active: bool,
    pub status: SensorStatus,
    pub consecutive_failures: u32,
    pub offline_since: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    pub circuit_state: CircuitPhase,
    pub last_successful_check: Option<DateTime<Utc>>,
    pub last_failed_check: Option<DateTime<Utc>>,
}

impl TryFrom<SensorRow> for Sensor {
    type Error = StoreError;

    fn try_from(row: SensorRow) -> Result<Self, Self::Error> {
        // ---
        let port = u16::try_from(row.sensor_port).map_err(|_| {
            StoreError::InvalidRow(format!(
                "sensor {} has invalid port {}",
                row.sensor_name, row.sensor_port
            ))
        })?;

        Ok(Sensor {
            sensor_id: row.sensor_id,
            sensor_type: row.sensor_type.parse()?,
            ip_address: row.sensor_ip,
            port,
            store_id: row.store_id,
            store_name: row.store_name,
            organization_id: row.organization_id,
            organization_name: row.organization_name,
            timezone: parse_timezone(row.timezone.as_deref()),
            is_active: row.is_active,
            status: row.status.parse()?,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            offline_since: row.offline_since,
            recovery_attempts: row.recovery_attempts.max(0) as u32,
            circuit_state: match row.circuit_state.as_deref() {
                Some(s) => s.parse()?,
                None => CircuitPhase::Closed,
            },
            last_successful_check: row.last_successful_check,
            last_failed_check: row.last_failed_check,
            sensor_name: row.sensor_name,
        })
    }
}

/// Resolve an IANA zone name, falling back to UTC for missing or unknown names.
pub fn parse_timezone(name: Option<&str>) -> Tz {
    // ---
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) => n.parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!(timezone = n, "Unknown timezone, falling back to UTC");
            Tz::UTC
        }),
        None => Tz::UTC,
    }
}

/// A store and the timezone its analytics are bucketed in.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Store {
    // ---
    pub id: Uuid,
    pub name: String,
    pub organization_id: Option<Uuid>,
    pub timezone: Option<String>,
}

impl Store {
    pub fn tz(&self) -> Tz {
        parse_timezone(self.timezone.as_deref())
    }
}

/// One `people_counting_raw` row: per-line counts for one report interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawReading {
    // ---
    pub sensor_id: Uuid,
    pub store_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub line1_in: i64,
    pub line1_out: i64,
    pub line2_in: i64,
    pub line2_out: i64,
    pub line3_in: i64,
    pub line3_out: i64,
    pub line4_in: i64,
    pub line4_out: i64,
}

impl RawReading {
    /// Inbound counts for lines 1..=4.
    pub fn lines_in(&self) -> [i64; LINE_COUNT] {
        [self.line1_in, self.line2_in, self.line3_in, self.line4_in]
    }

    /// Outbound counts for lines 1..=4.
    pub fn lines_out(&self) -> [i64; LINE_COUNT] {
        [self.line1_out, self.line2_out, self.line3_out, self.line4_out]
    }

    /// People entering the store (entrance lines only).
    pub fn store_entries(&self) -> i64 {
        self.lines_in()[..STORE_LINES].iter().sum()
    }

    /// People leaving the store (entrance lines only).
    pub fn store_exits(&self) -> i64 {
        self.lines_out()[..STORE_LINES].iter().sum()
    }

    /// People walking past, both directions of the passerby line.
    pub fn passerby(&self) -> i64 {
        self.line4_in + self.line4_out
    }
}

/// One `regional_counting_raw` row: occupancy snapshot per region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegionalReading {
    // ---
    pub sensor_id: Uuid,
    pub store_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub region1_count: i64,
    pub region2_count: i64,
    pub region3_count: i64,
    pub region4_count: i64,
    pub avg_dwell_seconds: Option<f64>,
}

impl RegionalReading {
    pub fn regions(&self) -> [i64; ZONE_COUNT] {
        [
            self.region1_count,
            self.region2_count,
            self.region3_count,
            self.region4_count,
        ]
    }

    pub fn total_occupancy(&self) -> i64 {
        self.regions().iter().sum()
    }
}

/// Whether an upsert created a new row or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    // ---
    Inserted,
    Updated,
}

/// New values for every circuit-breaker column of one sensor.
///
/// The `last_*_check` fields are only written when present so a success
/// does not erase the last failure time and vice versa.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitUpdate {
    // ---
    pub status: SensorStatus,
    pub consecutive_failures: u32,
    pub offline_since: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    pub circuit_state: CircuitPhase,
    pub last_successful_check: Option<DateTime<Utc>>,
    pub last_failed_check: Option<DateTime<Utc>>,
}

impl Sensor {
    /// Apply an update in place (used by stores that keep sensors in memory).
    pub fn apply(&mut self, update: &CircuitUpdate) {
        // ---
        self.status = update.status;
        self.consecutive_failures = update.consecutive_failures;
        self.offline_since = update.offline_since;
        self.recovery_attempts = update.recovery_attempts;
        self.circuit_state = update.circuit_state;
        if update.last_successful_check.is_some() {
            self.last_successful_check = update.last_successful_check;
        }
        if update.last_failed_check.is_some() {
            self.last_failed_check = update.last_failed_check;
        }
    }
}

/// Alert severity as stored in `alerts.severity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    // ---
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// An `alerts` row. Written by the pipeline, never read back.
#[derive(Debug, Clone, Serialize)]
pub struct NewAlert {
    // ---
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub store_id: Uuid,
    pub sensor_id: Uuid,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A `sensor_health_log` row.
#[derive(Debug, Clone, Serialize)]
pub struct HealthLogEntry {
    // ---
    pub sensor_id: Uuid,
    pub status: SensorStatus,
    pub response_time_ms: Option<i64>,
    pub readings_count: i64,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// One `hourly_analytics` row, keyed by (`store_id`, `date`, `hour`) in
/// store-local time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HourlyAnalytics {
    // ---
    pub store_id: Uuid,
    pub date: NaiveDate,
    pub hour: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub store_entries: i64,
    pub store_exits: i64,
    pub passerby_count: i64,
    pub passerby_in: i64,
    pub passerby_out: i64,
    pub capture_rate: Option<f64>,
    pub line1_in: i64,
    pub line1_out: i64,
    pub line2_in: i64,
    pub line2_out: i64,
    pub line3_in: i64,
    pub line3_out: i64,
    pub entry_line1_pct: Option<f64>,
    pub entry_line2_pct: Option<f64>,
    pub entry_line3_pct: Option<f64>,
    pub exit_line1_pct: Option<f64>,
    pub exit_line2_pct: Option<f64>,
    pub exit_line3_pct: Option<f64>,
    pub zone1_peak_occupancy: Option<i64>,
    pub zone2_peak_occupancy: Option<i64>,
    pub zone3_peak_occupancy: Option<i64>,
    pub zone4_peak_occupancy: Option<i64>,
    pub avg_dwell_seconds: Option<f64>,
    pub is_business_hours: bool,
    pub sample_count: i32,
}

impl HourlyAnalytics {
    pub fn lines_in(&self) -> [i64; STORE_LINES] {
        [self.line1_in, self.line2_in, self.line3_in]
    }

    pub fn lines_out(&self) -> [i64; STORE_LINES] {
        [self.line1_out, self.line2_out, self.line3_out]
    }

    pub fn zone_peaks(&self) -> [Option<i64>; ZONE_COUNT] {
        [
            self.zone1_peak_occupancy,
            self.zone2_peak_occupancy,
            self.zone3_peak_occupancy,
            self.zone4_peak_occupancy,
        ]
    }
}

/// One `daily_analytics` row, keyed by (`store_id`, `date`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyAnalytics {
    // ---
    pub store_id: Uuid,
    pub date: NaiveDate,
    pub total_entries: i64,
    pub total_exits: i64,
    pub total_passerby: i64,
    pub capture_rate: Option<f64>,
    pub peak_hour: Option<i32>,
    pub peak_hour_entries: i64,
    pub peak_exit_hour: Option<i32>,
    pub peak_exit_count: i64,
    pub peak_traffic_hour: Option<i32>,
    pub peak_traffic_count: i64,
    pub peak_passerby_hour: Option<i32>,
    pub peak_passerby_count: i64,
    pub business_hours_entries: i64,
    pub after_hours_entries: i64,
    pub entry_line1_pct: Option<f64>,
    pub entry_line2_pct: Option<f64>,
    pub entry_line3_pct: Option<f64>,
    pub exit_line1_pct: Option<f64>,
    pub exit_line2_pct: Option<f64>,
    pub exit_line3_pct: Option<f64>,
    pub zone1_peak_occupancy: Option<i64>,
    pub zone1_peak_hour: Option<i32>,
    pub zone2_peak_occupancy: Option<i64>,
    pub zone2_peak_hour: Option<i32>,
    pub zone3_peak_occupancy: Option<i64>,
    pub zone3_peak_hour: Option<i32>,
    pub zone4_peak_occupancy: Option<i64>,
    pub zone4_peak_hour: Option<i32>,
    pub avg_dwell_seconds: Option<f64>,
    pub hours_with_data: i32,
}
