//! Hourly rollup: raw and regional readings grouped by store-local hour.
//!
//! Each store's day is read as one UTC range and re-bucketed by local
//! wall-clock hour; a repeated fall-back hour lands in the same bucket.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, NaiveTime, Timelike};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::error;
use crate::models::{HourlyAnalytics, RawReading, RegionalReading, Store, UpsertAction};
use crate::sensor::parse::local_to_utc;
use crate::store::SensorStore;

use super::fold::{is_business_hour, TrafficFold, TrafficSample};
use super::{local_day_bounds, AggregationSummary, RunDate};

// ---

/// Folds raw and regional readings into `hourly_analytics`.
pub struct HourlyAggregator {
    store: Arc<dyn SensorStore>,
}

impl HourlyAggregator {
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        Self { store }
    }

    /// Recompute every store's hourly rows for its store-local target date.
    pub async fn run(&self, target: RunDate) -> Result<AggregationSummary> {
        // ---
        let stores = self
            .store
            .get_stores()
            .await
            .context("Failed to load stores for hourly aggregation")?;
        let mut summary = AggregationSummary::new("hourly", target.fixed(), stores.len());

        for store in &stores {
            let date = target.hourly(store.tz());
            match self.aggregate_store(store, date).await {
                Ok(actions) => {
                    tracing::debug!(store = %store.name, %date, hours = actions.len(), "Hourly rows written");
                    summary.record(&actions);
                }
                Err(e) => {
                    tracing::error!(store = %store.name, error = %e, "Hourly aggregation failed");
                    summary.failed += 1;
                }
            }
        }

        summary.log();
        Ok(summary)
    }

    /// Rebuild one store's hourly rows; returns one action per hour written.
    pub async fn aggregate_store(
        &self,
        store: &Store,
        date: NaiveDate,
    ) -> error::Result<Vec<UpsertAction>> {
        // ---
        let tz = store.tz();
        let (from, to) = local_day_bounds(date, tz);

        let raw = self.store.get_raw_readings(store.id, from, to).await?;
        let regional = self.store.get_regional_readings(store.id, from, to).await?;

        let mut actions = Vec::new();
        for row in build_hourly_rows(store.id, date, tz, &raw, &regional) {
            actions.push(self.store.upsert_hourly(&row).await?);
        }
        Ok(actions)
    }
}

/// Group readings by store-local hour of `date` and fold each hour into a row.
pub fn build_hourly_rows(
    store_id: Uuid,
    date: NaiveDate,
    tz: Tz,
    raw: &[RawReading],
    regional: &[RegionalReading],
) -> Vec<HourlyAnalytics> {
    // ---
    let mut hours: BTreeMap<u32, TrafficFold> = BTreeMap::new();

    for reading in raw {
        let local = reading.timestamp.with_timezone(&tz);
        if local.date_naive() != date {
            continue;
        }
        hours
            .entry(local.hour())
            .or_default()
            .add_traffic(local.hour(), &TrafficSample::from(reading));
    }

    for reading in regional {
        let local = reading.timestamp.with_timezone(&tz);
        if local.date_naive() != date {
            continue;
        }
        let fold = hours.entry(local.hour()).or_default();
        fold.add_occupancy(local.hour(), &reading.regions().map(Some));
        if let Some(dwell) = reading.avg_dwell_seconds {
            fold.add_dwell(dwell, reading.total_occupancy().max(0) as f64);
        }
    }

    let (day_start, _) = local_day_bounds(date, tz);
    hours
        .into_iter()
        .map(|(hour, fold)| {
            let local_start = date.and_time(NaiveTime::MIN) + Duration::hours(i64::from(hour));
            let start_time = local_to_utc(tz, local_start)
                .unwrap_or(day_start + Duration::hours(i64::from(hour)));
            hourly_row(store_id, date, hour, start_time, &fold)
        })
        .collect()
}

fn hourly_row(
    store_id: Uuid,
    date: NaiveDate,
    hour: u32,
    start_time: chrono::DateTime<chrono::Utc>,
    fold: &TrafficFold,
) -> HourlyAnalytics {
    // ---
    let [entry_line1_pct, entry_line2_pct, entry_line3_pct] = fold.entry_line_pct();
    let [exit_line1_pct, exit_line2_pct, exit_line3_pct] = fold.exit_line_pct();
    let [zone1_peak_occupancy, zone2_peak_occupancy, zone3_peak_occupancy, zone4_peak_occupancy] =
        fold.zone_peak_values();

    HourlyAnalytics {
        store_id,
        date,
        hour: hour as i32,
        start_time,
        end_time: start_time + Duration::hours(1),
        store_entries: fold.entries,
        store_exits: fold.exits,
        passerby_count: fold.passerby(),
        passerby_in: fold.passerby_in,
        passerby_out: fold.passerby_out,
        capture_rate: fold.capture_rate(),
        line1_in: fold.lines_in[0],
        line1_out: fold.lines_out[0],
        line2_in: fold.lines_in[1],
        line2_out: fold.lines_out[1],
        line3_in: fold.lines_in[2],
        line3_out: fold.lines_out[2],
        entry_line1_pct,
        entry_line2_pct,
        entry_line3_pct,
        exit_line1_pct,
        exit_line2_pct,
        exit_line3_pct,
        zone1_peak_occupancy,
        zone2_peak_occupancy,
        zone3_peak_occupancy,
        zone4_peak_occupancy,
        avg_dwell_seconds: fold.avg_dwell_seconds(),
        is_business_hours: is_business_hour(hour),
        sample_count: fold.samples as i32,
    }
}
