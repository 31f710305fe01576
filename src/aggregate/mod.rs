//! Hourly and daily rollups of the raw sensor tables.
//!
//! Both levels recompute their rows from scratch and overwrite them, so a
//! re-run for the same date converges on the same result.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::models::UpsertAction;
use crate::sensor::parse::local_to_utc;

mod daily;
pub mod fold;
mod hourly;

pub use daily::{build_daily_row, DailyAggregator};
pub use fold::{PeakTracker, TrafficFold, TrafficSample};
pub use hourly::{build_hourly_rows, HourlyAggregator};

// ---

/// Which store-local date a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDate {
    /// The same calendar date for every store.
    Fixed(NaiveDate),
    /// Each store's default date, resolved in its own timezone at this instant.
    StoreLocal(DateTime<Utc>),
}

impl RunDate {
    /// `date` when given, otherwise each store's default as of `now`.
    pub fn or_default(date: Option<NaiveDate>, now: DateTime<Utc>) -> Self {
        date.map_or(RunDate::StoreLocal(now), RunDate::Fixed)
    }

    pub fn fixed(&self) -> Option<NaiveDate> {
        match self {
            RunDate::Fixed(date) => Some(*date),
            RunDate::StoreLocal(_) => None,
        }
    }

    pub(crate) fn hourly(&self, tz: Tz) -> NaiveDate {
        match self {
            RunDate::Fixed(date) => *date,
            RunDate::StoreLocal(now) => default_hourly_date(*now, tz),
        }
    }

    pub(crate) fn daily(&self, tz: Tz) -> NaiveDate {
        match self {
            RunDate::Fixed(date) => *date,
            RunDate::StoreLocal(now) => default_daily_date(*now, tz),
        }
    }
}

/// Outcome of one aggregation run over every store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationSummary {
    // ---
    pub level: &'static str,
    /// `None` when each store ran on its own local default date.
    pub date: Option<NaiveDate>,
    pub stores: usize,
    /// Stores whose rows were written.
    pub processed: usize,
    /// Stores with no input for the date.
    pub skipped: usize,
    pub failed: usize,
    pub inserted: usize,
    pub updated: usize,
}

impl AggregationSummary {
    fn new(level: &'static str, date: Option<NaiveDate>, stores: usize) -> Self {
        Self {
            level,
            date,
            stores,
            processed: 0,
            skipped: 0,
            failed: 0,
            inserted: 0,
            updated: 0,
        }
    }

    fn record(&mut self, actions: &[UpsertAction]) {
        // ---
        if actions.is_empty() {
            self.skipped += 1;
            return;
        }
        self.processed += 1;
        for action in actions {
            match action {
                UpsertAction::Inserted => self.inserted += 1,
                UpsertAction::Updated => self.updated += 1,
            }
        }
    }

    fn log(&self) {
        tracing::info!(
            level = self.level,
            date = ?self.date,
            stores = self.stores,
            processed = self.processed,
            skipped = self.skipped,
            failed = self.failed,
            inserted = self.inserted,
            updated = self.updated,
            "Aggregation finished"
        );
    }
}

/// Date the hourly job targets when none is given: the store's current local date.
pub fn default_hourly_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Date the daily job targets when none is given: the store's previous local date.
pub fn default_daily_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    let today = default_hourly_date(now, tz);
    today.pred_opt().unwrap_or(today)
}

/// UTC instants bounding the store-local calendar day `[start, end)`.
pub fn local_day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    // ---
    let start_of = |d: NaiveDate| {
        let midnight = d.and_time(NaiveTime::MIN);
        // A DST change at midnight moves the first local instant to 01:00.
        local_to_utc(tz, midnight)
            .or_else(|| local_to_utc(tz, midnight + Duration::hours(1)))
            .unwrap_or_else(|| midnight.and_utc())
    };
    let next = date.succ_opt().unwrap_or(date);
    (start_of(date), start_of(next))
}
