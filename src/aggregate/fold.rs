//! The traffic accumulator shared by the hourly and daily rollups.

use serde::Serialize;

use crate::models::{HourlyAnalytics, RawReading, STORE_LINES, ZONE_COUNT};

// ---

/// Store-local business hours: `BUSINESS_OPEN <= hour < BUSINESS_CLOSE`.
pub const BUSINESS_OPEN: u32 = 9;
pub const BUSINESS_CLOSE: u32 = 21;

pub fn is_business_hour(hour: u32) -> bool {
    (BUSINESS_OPEN..BUSINESS_CLOSE).contains(&hour)
}

/// Running maximum with the hour it was seen. The first hour wins ties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PeakTracker {
    // ---
    pub hour: Option<u32>,
    pub value: i64,
}

impl PeakTracker {
    pub fn offer(&mut self, hour: u32, value: i64) {
        // ---
        if self.hour.is_none() || value > self.value {
            self.hour = Some(hour);
            self.value = value;
        }
    }

    pub fn hour_i32(&self) -> Option<i32> {
        self.hour.map(|h| h as i32)
    }

    pub fn value_if_seen(&self) -> Option<i64> {
        self.hour.map(|_| self.value)
    }
}

/// Line counts of one interval: the store-entrance lines plus the passerby line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficSample {
    // ---
    pub lines_in: [i64; STORE_LINES],
    pub lines_out: [i64; STORE_LINES],
    pub passerby_in: i64,
    pub passerby_out: i64,
}

impl TrafficSample {
    pub fn entries(&self) -> i64 {
        self.lines_in.iter().sum()
    }

    pub fn exits(&self) -> i64 {
        self.lines_out.iter().sum()
    }

    pub fn passerby(&self) -> i64 {
        self.passerby_in + self.passerby_out
    }
}

impl From<&RawReading> for TrafficSample {
    fn from(r: &RawReading) -> Self {
        Self {
            lines_in: [r.line1_in, r.line2_in, r.line3_in],
            lines_out: [r.line1_out, r.line2_out, r.line3_out],
            passerby_in: r.line4_in,
            passerby_out: r.line4_out,
        }
    }
}

impl From<&HourlyAnalytics> for TrafficSample {
    fn from(h: &HourlyAnalytics) -> Self {
        Self {
            lines_in: h.lines_in(),
            lines_out: h.lines_out(),
            passerby_in: h.passerby_in,
            passerby_out: h.passerby_out,
        }
    }
}

/// Sums, peaks and weighted means over a run of samples.
///
/// Ratios are taken over the summed counts, so every percentage is weighted
/// by the traffic behind it and empty hours cannot skew the result.
#[derive(Debug, Clone, Default)]
pub struct TrafficFold {
    // ---
    pub entries: i64,
    pub exits: i64,
    pub passerby_in: i64,
    pub passerby_out: i64,
    pub lines_in: [i64; STORE_LINES],
    pub lines_out: [i64; STORE_LINES],
    pub business_hours_entries: i64,
    pub after_hours_entries: i64,
    pub peak_entries: PeakTracker,
    pub peak_exits: PeakTracker,
    pub peak_traffic: PeakTracker,
    pub peak_passerby: PeakTracker,
    pub zone_peaks: [PeakTracker; ZONE_COUNT],
    pub samples: usize,
    dwell_sum: f64,
    dwell_weight: f64,
}

impl TrafficFold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one traffic sample observed in store-local `hour`.
    pub fn add_traffic(&mut self, hour: u32, sample: &TrafficSample) {
        // ---
        let entries = sample.entries();
        let exits = sample.exits();

        self.entries += entries;
        self.exits += exits;
        self.passerby_in += sample.passerby_in;
        self.passerby_out += sample.passerby_out;
        for line in 0..STORE_LINES {
            self.lines_in[line] += sample.lines_in[line];
            self.lines_out[line] += sample.lines_out[line];
        }

        if is_business_hour(hour) {
            self.business_hours_entries += entries;
        } else {
            self.after_hours_entries += entries;
        }

        self.peak_entries.offer(hour, entries);
        self.peak_exits.offer(hour, exits);
        self.peak_traffic.offer(hour, entries + exits);
        self.peak_passerby.offer(hour, sample.passerby());
        self.samples += 1;
    }

    /// Offer per-zone occupancy seen in `hour`; `None` zones are ignored.
    pub fn add_occupancy(&mut self, hour: u32, zones: &[Option<i64>; ZONE_COUNT]) {
        // ---
        for (tracker, value) in self.zone_peaks.iter_mut().zip(zones) {
            if let Some(v) = value {
                tracker.offer(hour, *v);
            }
        }
    }

    /// Add a dwell observation with its weight (occupancy or traffic behind it).
    pub fn add_dwell(&mut self, seconds: f64, weight: f64) {
        // ---
        if seconds.is_finite() && weight > 0.0 {
            self.dwell_sum += seconds * weight;
            self.dwell_weight += weight;
        }
    }

    pub fn passerby(&self) -> i64 {
        self.passerby_in + self.passerby_out
    }

    /// Entries as a percentage of passerby; `None` without passerby traffic.
    pub fn capture_rate(&self) -> Option<f64> {
        percent(self.entries, self.passerby())
    }

    /// Share of entries per entrance line.
    pub fn entry_line_pct(&self) -> [Option<f64>; STORE_LINES] {
        self.lines_in.map(|n| percent(n, self.entries))
    }

    /// Share of exits per entrance line.
    pub fn exit_line_pct(&self) -> [Option<f64>; STORE_LINES] {
        self.lines_out.map(|n| percent(n, self.exits))
    }

    pub fn avg_dwell_seconds(&self) -> Option<f64> {
        (self.dwell_weight > 0.0).then(|| round2(self.dwell_sum / self.dwell_weight))
    }

    pub fn zone_peak_values(&self) -> [Option<i64>; ZONE_COUNT] {
        self.zone_peaks.map(|t| t.value_if_seen())
    }
}

fn percent(part: i64, whole: i64) -> Option<f64> {
    (whole > 0).then(|| round2(part as f64 / whole as f64 * 100.0))
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
