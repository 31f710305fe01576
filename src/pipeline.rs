//! The collection job: poll every eligible sensor once and persist its readings.
//!
//! Per sensor the steps are strictly sequential: fetch, parse, write, update
//! the circuit breaker, log health. Sensors run concurrently through the
//! [`ParallelCollector`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::circuit::CircuitBreaker;
use crate::collector::ParallelCollector;
use crate::config::Config;
use crate::error::SensorError;
use crate::models::{
    CircuitPhase, HealthLogEntry, RawReading, RegionalReading, Sensor, SensorStatus, UpsertAction,
};
use crate::retry::{RetryError, RetryHandler};
use crate::sensor::{
    parse_people_counting, parse_regional, CollectionWindow, Endpoint, LocalClock, SensorClient,
};
use crate::store::SensorStore;

// ---

/// Totals of one collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    // ---
    /// Sensors considered (active plus offline recovery candidates).
    pub sensors: usize,
    /// Sensors the breaker kept closed off this run.
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Raw rows newly inserted / overwritten.
    pub inserted: usize,
    pub updated: usize,
    /// Regional rows written.
    pub regional: usize,
}

/// What one sensor produced.
#[derive(Debug, Default)]
struct SensorReport {
    inserted: usize,
    updated: usize,
    regional: usize,
}

/// Readings pulled from one sensor, already converted to UTC.
struct Collected {
    raw: Vec<RawReading>,
    regional: Vec<RegionalReading>,
    elapsed: Duration,
}

pub struct Pipeline {
    store: Arc<dyn SensorStore>,
    client: SensorClient,
    breaker: CircuitBreaker,
    collector: ParallelCollector,
    lookback_hours: u32,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn SensorStore>,
        client: SensorClient,
        breaker: CircuitBreaker,
        collector: ParallelCollector,
        lookback_hours: u32,
    ) -> Self {
        Self {
            store,
            client,
            breaker,
            collector,
            lookback_hours,
        }
    }

    /// Wire a pipeline from configuration. Fails fast without sensor credentials.
    pub fn from_config(config: &Config, store: Arc<dyn SensorStore>) -> Result<Self> {
        // ---
        let auth = config.require_sensor_auth()?.clone();
        let client = SensorClient::new(
            auth,
            config.sensor_timeout,
            RetryHandler::new(config.retry.clone()),
        )
        .context("Failed to build sensor HTTP client")?;

        Ok(Self::new(
            store,
            client,
            CircuitBreaker::new(config.circuit.clone()),
            ParallelCollector::new(config.collector.clone()),
            config.lookback_hours,
        ))
    }

    /// Run one collection pass as of `now`.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<CollectionSummary> {
        // ---
        let mut sensors = self
            .store
            .get_active_sensors()
            .await
            .context("Failed to load active sensors")?;
        let offline = self
            .store
            .get_offline_sensors()
            .await
            .context("Failed to load offline sensors")?;

        let mut seen: HashSet<_> = sensors.iter().map(|s| s.sensor_id).collect();
        sensors.extend(offline.into_iter().filter(|s| seen.insert(s.sensor_id)));

        let mut summary = CollectionSummary {
            sensors: sensors.len(),
            ..CollectionSummary::default()
        };
        tracing::info!(sensors = sensors.len(), "Starting collection run");

        let mut work = Vec::with_capacity(sensors.len());
        for mut sensor in sensors {
            let decision = self.breaker.should_process(&sensor, now);
            if !decision.should_process {
                tracing::info!(sensor = %sensor.sensor_name, reason = %decision.reason, "Skipping sensor");
                summary.skipped += 1;
                continue;
            }

            if decision.state == CircuitPhase::HalfOpen {
                tracing::info!(sensor = %sensor.sensor_name, reason = %decision.reason, "Probing sensor");
                if let Err(e) = self.breaker.mark_trial(self.store.as_ref(), &mut sensor).await {
                    tracing::error!(sensor = %sensor.sensor_name, error = %e, "Failed to mark trial");
                }
            }
            work.push((sensor, decision.max_attempts));
        }

        let outcomes = self
            .collector
            .run(work, |(sensor, max_attempts)| {
                self.collect_sensor(sensor, max_attempts, now)
            })
            .await;

        for outcome in outcomes {
            let (sensor, _) = &outcome.item;
            match outcome.result {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.inserted += report.inserted;
                    summary.updated += report.updated;
                    summary.regional += report.regional;
                }
                Err(e) => {
                    tracing::error!(sensor = %sensor.sensor_name, error = %format!("{e:#}"), "Sensor collection failed");
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            sensors = summary.sensors,
            skipped = summary.skipped,
            succeeded = summary.succeeded,
            failed = summary.failed,
            inserted = summary.inserted,
            updated = summary.updated,
            regional = summary.regional,
            "Collection run finished"
        );
        Ok(summary)
    }

    async fn collect_sensor(
        &self,
        sensor: Sensor,
        max_attempts: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<SensorReport> {
        // ---
        let store = self.store.as_ref();

        let collected = match self.fetch_and_parse(&sensor, max_attempts, now).await {
            Ok(c) => c,
            Err(e) => {
                let message = e.to_string();
                let status = match self.breaker.record_failure(store, &sensor, &message, now).await {
                    Ok(transition) => transition.update.status,
                    Err(persist) => {
                        tracing::error!(sensor = %sensor.sensor_name, error = %persist, "Failed to persist circuit state");
                        sensor.status
                    }
                };
                self.log_health(&sensor, status, None, 0, Some(message), now)
                    .await;
                return Err(anyhow!(e).context(format!("fetch from {} failed", sensor.sensor_name)));
            }
        };

        // The sensor answered, so the breaker closes even if the write below fails.
        if let Err(e) = self.breaker.record_success(store, &sensor, now).await {
            tracing::error!(sensor = %sensor.sensor_name, error = %e, "Failed to persist circuit state");
        }

        let written = self.write(&collected).await;
        let response_ms = Some(collected.elapsed.as_millis() as i64);
        let readings = collected.raw.len() as i64;

        match written {
            Ok(report) => {
                tracing::info!(
                    sensor = %sensor.sensor_name,
                    inserted = report.inserted,
                    updated = report.updated,
                    regional = report.regional,
                    "Sensor collected"
                );
                self.log_health(&sensor, SensorStatus::Online, response_ms, readings, None, now)
                    .await;
                Ok(report)
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.log_health(
                    &sensor,
                    SensorStatus::Online,
                    response_ms,
                    readings,
                    Some(message),
                    now,
                )
                .await;
                Err(e.context(format!("writing readings of {} failed", sensor.sensor_name)))
            }
        }
    }

    async fn fetch_and_parse(
        &self,
        sensor: &Sensor,
        max_attempts: Option<u32>,
        now: DateTime<Utc>,
    ) -> std::result::Result<Collected, RetryError<SensorError>> {
        // ---
        let window = CollectionWindow::ending_at(now, sensor.timezone, self.lookback_hours);
        let local_now = now.with_timezone(&sensor.timezone).naive_local();

        let people = self
            .client
            .fetch(sensor, Endpoint::PeopleCounting, &window, max_attempts)
            .await?;
        let parsed = parse_people_counting(&people.body, local_now);
        if parsed.rows.is_empty() && parsed.skipped > 0 {
            return Err(RetryError::Fatal(SensorError::Payload(format!(
                "none of {} people-counting rows could be parsed",
                parsed.skipped
            ))));
        }

        let mut clock = LocalClock::new(sensor.timezone);
        let raw: Vec<RawReading> = parsed
            .rows
            .iter()
            .filter_map(|row| {
                let reading = row.to_reading(sensor, &mut clock);
                if reading.is_none() {
                    tracing::warn!(sensor = %sensor.sensor_name, start = %row.start, "Skipping row in a DST gap");
                }
                reading
            })
            .collect();

        let mut regional = Vec::new();
        let mut elapsed = people.elapsed;
        if sensor.sensor_type.has_regional_counts() {
            // Occupancy is secondary data: a failed export does not fail the sensor.
            match self
                .client
                .fetch(sensor, Endpoint::RegionalCounting, &window, max_attempts)
                .await
            {
                Ok(fetched) => {
                    elapsed += fetched.elapsed;
                    let mut clock = LocalClock::new(sensor.timezone);
                    regional = parse_regional(&fetched.body, local_now)
                        .rows
                        .iter()
                        .filter_map(|row| row.to_reading(sensor, &mut clock))
                        .collect();
                }
                Err(e) => {
                    tracing::warn!(sensor = %sensor.sensor_name, error = %e, "Regional export failed");
                }
            }
        }

        tracing::debug!(
            sensor = %sensor.sensor_name,
            raw = raw.len(),
            regional = regional.len(),
            skipped = parsed.skipped,
            future = parsed.future,
            "Parsed sensor exports"
        );

        Ok(Collected {
            raw,
            regional,
            elapsed,
        })
    }

    async fn write(&self, collected: &Collected) -> Result<SensorReport> {
        // ---
        let mut report = SensorReport::default();
        for reading in &collected.raw {
            match self.store.upsert_sensor_data(reading).await? {
                UpsertAction::Inserted => report.inserted += 1,
                UpsertAction::Updated => report.updated += 1,
            }
        }
        if !collected.regional.is_empty() {
            report.regional = self.store.upsert_regional_data(&collected.regional).await?;
        }
        Ok(report)
    }

    /// Best-effort health log entry.
    async fn log_health(
        &self,
        sensor: &Sensor,
        status: SensorStatus,
        response_time_ms: Option<i64>,
        readings_count: i64,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) {
        // ---
        let entry = HealthLogEntry {
            sensor_id: sensor.sensor_id,
            status,
            response_time_ms,
            readings_count,
            error_message,
            checked_at: now,
        };
        if let Err(e) = self.store.log_sensor_health(&entry).await {
            tracing::warn!(sensor = %sensor.sensor_name, error = %e, "Failed to write health log");
        }
    }
}
