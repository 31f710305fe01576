//! Daily rollup: one store's `hourly_analytics` rows folded into its day.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error;
use crate::models::{DailyAnalytics, HourlyAnalytics, Store, UpsertAction};
use crate::store::SensorStore;

use super::fold::{TrafficFold, TrafficSample};
use super::{AggregationSummary, RunDate};

// ---

/// Folds a day's `hourly_analytics` rows into `daily_analytics`.
pub struct DailyAggregator {
    store: Arc<dyn SensorStore>,
}

impl DailyAggregator {
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        Self { store }
    }

    /// Recompute every store's daily row for its store-local target date.
    /// Stores without hourly rows are skipped.
    pub async fn run(&self, target: RunDate) -> Result<AggregationSummary> {
        // ---
        let stores = self
            .store
            .get_stores()
            .await
            .context("Failed to load stores for daily aggregation")?;
        let mut summary = AggregationSummary::new("daily", target.fixed(), stores.len());

        for store in &stores {
            let date = target.daily(store.tz());
            match self.aggregate_store(store, date).await {
                Ok(Some(action)) => summary.record(&[action]),
                Ok(None) => {
                    tracing::debug!(store = %store.name, %date, "No hourly rows, skipping");
                    summary.record(&[]);
                }
                Err(e) => {
                    tracing::error!(store = %store.name, error = %e, "Daily aggregation failed");
                    summary.failed += 1;
                }
            }
        }

        summary.log();
        Ok(summary)
    }

    pub async fn aggregate_store(
        &self,
        store: &Store,
        date: NaiveDate,
    ) -> error::Result<Option<UpsertAction>> {
        // ---
        let hourly = self.store.get_hourly(store.id, date).await?;
        match build_daily_row(store.id, date, &hourly) {
            Some(row) => Ok(Some(self.store.upsert_daily(&row).await?)),
            None => Ok(None),
        }
    }
}

/// Fold hourly rows into the day's row; `None` when there are no rows.
pub fn build_daily_row(
    store_id: Uuid,
    date: NaiveDate,
    hourly: &[HourlyAnalytics],
) -> Option<DailyAnalytics> {
    // ---
    if hourly.is_empty() {
        return None;
    }

    let mut ordered: Vec<&HourlyAnalytics> = hourly.iter().collect();
    ordered.sort_by_key(|h| h.hour);

    let mut fold = TrafficFold::new();
    for h in &ordered {
        let hour = h.hour.clamp(0, 23) as u32;
        fold.add_traffic(hour, &TrafficSample::from(*h));
        fold.add_occupancy(hour, &h.zone_peaks());
        if let Some(dwell) = h.avg_dwell_seconds {
            fold.add_dwell(dwell, h.store_entries.max(0) as f64);
        }
    }

    let [entry_line1_pct, entry_line2_pct, entry_line3_pct] = fold.entry_line_pct();
    let [exit_line1_pct, exit_line2_pct, exit_line3_pct] = fold.exit_line_pct();
    let [zone1, zone2, zone3, zone4] = fold.zone_peaks;

    Some(DailyAnalytics {
        store_id,
        date,
        total_entries: fold.entries,
        total_exits: fold.exits,
        total_passerby: fold.passerby(),
        capture_rate: fold.capture_rate(),
        peak_hour: fold.peak_entries.hour_i32(),
        peak_hour_entries: fold.peak_entries.value,
        peak_exit_hour: fold.peak_exits.hour_i32(),
        peak_exit_count: fold.peak_exits.value,
        peak_traffic_hour: fold.peak_traffic.hour_i32(),
        peak_traffic_count: fold.peak_traffic.value,
        peak_passerby_hour: fold.peak_passerby.hour_i32(),
        peak_passerby_count: fold.peak_passerby.value,
        business_hours_entries: fold.business_hours_entries,
        after_hours_entries: fold.after_hours_entries,
        entry_line1_pct,
        entry_line2_pct,
        entry_line3_pct,
        exit_line1_pct,
        exit_line2_pct,
        exit_line3_pct,
        zone1_peak_occupancy: zone1.value_if_seen(),
        zone1_peak_hour: zone1.hour_i32(),
        zone2_peak_occupancy: zone2.value_if_seen(),
        zone2_peak_hour: zone2.hour_i32(),
        zone3_peak_occupancy: zone3.value_if_seen(),
        zone3_peak_hour: zone3.hour_i32(),
        zone4_peak_occupancy: zone4.value_if_seen(),
        zone4_peak_hour: zone4.hour_i32(),
        avg_dwell_seconds: fold.avg_dwell_seconds(),
        hours_with_data: ordered.len() as i32,
    })
}
