//! Vendor CSV parsing for people-counting and regional-counting logs.
//!
//! Row-level problems never fail the payload: short rows, unparsable
//! timestamps or counts are skipped with a warning and the rest continues.

use std::collections::HashSet;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::models::{RawReading, RegionalReading, Sensor, LINE_COUNT, ZONE_COUNT};

// ---

/// `start, end, (in, out, sum) × 4 lines, total in, total out, total sum`.
pub const PEOPLE_COUNTING_MIN_COLUMNS: usize = 17;

/// `start, end, region1..region4`, optionally followed by per-region dwell.
pub const REGIONAL_MIN_COLUMNS: usize = 6;

const REGIONAL_DWELL_OFFSET: usize = 6;

/// Accepted layouts once `/` has been replaced by `-`.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d-%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// One people-counting interval in sensor-local time.
#[derive(Debug, Clone, PartialEq)]
pub struct PeopleCountRow {
    // ---
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub lines_in: [i64; LINE_COUNT],
    pub lines_out: [i64; LINE_COUNT],
}

/// One regional occupancy snapshot in sensor-local time.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionalRow {
    // ---
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub regions: [i64; ZONE_COUNT],
    pub dwell_seconds: [Option<f64>; ZONE_COUNT],
}

/// Parsed rows plus what was dropped on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    // ---
    pub rows: Vec<T>,
    /// Malformed rows (short, bad timestamp, bad number).
    pub skipped: usize,
    /// Rows starting after the collection time.
    pub future: usize,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            skipped: 0,
            future: 0,
        }
    }
}

/// Parse a vendor timestamp (`YYYY/MM/DD-HH:MM:SS` and friends) as naive local time.
pub fn parse_vendor_timestamp(raw: &str) -> Option<NaiveDateTime> {
    // ---
    let normalized = raw.trim().replace('/', "-");
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
}

/// Format a naive local time the way the sensors expect in `time_start`/`time_end`.
pub fn format_vendor_timestamp(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%d-%H:%M:%S").to_string()
}

/// Resolve sensor-local time to UTC; `None` inside a DST gap.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    // ---
    tz.from_local_datetime(&local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// Resolves one payload's interval starts to UTC, in row order.
///
/// A fall-back hour shows the same wall-clock start twice: the first
/// occurrence maps to the earlier instant, any repeat to the later one.
/// The end is the resolved start plus the row's local length.
#[derive(Debug)]
pub struct LocalClock {
    tz: Tz,
    seen_ambiguous: HashSet<NaiveDateTime>,
}

impl LocalClock {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            seen_ambiguous: HashSet::new(),
        }
    }

    /// `None` when `start` falls in a DST gap.
    pub fn interval(
        &mut self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        // ---
        let start_utc = match self.tz.from_local_datetime(&start) {
            LocalResult::Single(t) => t.with_timezone(&Utc),
            LocalResult::Ambiguous(earlier, later) => {
                if self.seen_ambiguous.insert(start) {
                    earlier.with_timezone(&Utc)
                } else {
                    later.with_timezone(&Utc)
                }
            }
            LocalResult::None => return None,
        };
        Some((start_utc, start_utc + (end - start)))
    }
}

fn count(field: &str) -> Option<i64> {
    if field.is_empty() {
        return Some(0);
    }
    field.parse::<f64>().ok().map(|v| v.round() as i64)
}

fn dwell(field: Option<&str>) -> Option<f64> {
    field
        .filter(|f| !f.is_empty())
        .and_then(|f| f.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Walk data rows (header discarded), handing each sufficiently wide row to `row_fn`.
fn parse_rows<T>(
    payload: &str,
    min_columns: usize,
    now: NaiveDateTime,
    kind: &str,
    row_fn: impl Fn(&csv::StringRecord) -> Option<T>,
    start_of: impl Fn(&T) -> NaiveDateTime,
) -> Parsed<T> {
    // ---
    let mut parsed = Parsed::default();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(payload.as_bytes());

    for (i, record) in reader.records().enumerate() {
        let line = i + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(kind, line, error = %e, "Skipping unreadable CSV row");
                parsed.skipped += 1;
                continue;
            }
        };

        if record.len() < min_columns {
            tracing::warn!(
                kind,
                line,
                columns = record.len(),
                min_columns,
                "Skipping CSV row with too few columns"
            );
            parsed.skipped += 1;
            continue;
        }

        match row_fn(&record) {
            Some(row) if start_of(&row) > now => {
                tracing::debug!(kind, line, "Dropping row from the future");
                parsed.future += 1;
            }
            Some(row) => parsed.rows.push(row),
            None => {
                tracing::warn!(kind, line, row = ?record, "Skipping malformed CSV row");
                parsed.skipped += 1;
            }
        }
    }

    parsed
}

/// Parse a `vcalogcsv` payload. `now` is the collection time in sensor-local time.
pub fn parse_people_counting(payload: &str, now: NaiveDateTime) -> Parsed<PeopleCountRow> {
    // ---
    parse_rows(
        payload,
        PEOPLE_COUNTING_MIN_COLUMNS,
        now,
        "people_counting",
        |r| {
            let start = parse_vendor_timestamp(r.get(0)?)?;
            let end = parse_vendor_timestamp(r.get(1)?)?;
            let mut lines_in = [0; LINE_COUNT];
            let mut lines_out = [0; LINE_COUNT];
            for line in 0..LINE_COUNT {
                lines_in[line] = count(r.get(2 + line * 3)?)?;
                lines_out[line] = count(r.get(3 + line * 3)?)?;
            }
            Some(PeopleCountRow {
                start,
                end,
                lines_in,
                lines_out,
            })
        },
        |row| row.start,
    )
}

/// Parse a `regionalcountlogcsv` payload. `now` is the collection time in sensor-local time.
pub fn parse_regional(payload: &str, now: NaiveDateTime) -> Parsed<RegionalRow> {
    // ---
    parse_rows(
        payload,
        REGIONAL_MIN_COLUMNS,
        now,
        "regional",
        |r| {
            let start = parse_vendor_timestamp(r.get(0)?)?;
            let end = parse_vendor_timestamp(r.get(1)?)?;
            let mut regions = [0; ZONE_COUNT];
            let mut dwell_seconds = [None; ZONE_COUNT];
            for zone in 0..ZONE_COUNT {
                regions[zone] = count(r.get(2 + zone)?)?;
                dwell_seconds[zone] = dwell(r.get(REGIONAL_DWELL_OFFSET + zone));
            }
            Some(RegionalRow {
                start,
                end,
                regions,
                dwell_seconds,
            })
        },
        |row| row.start,
    )
}

impl PeopleCountRow {
    /// Attach the row to its sensor and move it to UTC through the payload's clock.
    pub fn to_reading(&self, sensor: &Sensor, clock: &mut LocalClock) -> Option<RawReading> {
        // ---
        let (timestamp, end_time) = clock.interval(self.start, self.end)?;
        let [line1_in, line2_in, line3_in, line4_in] = self.lines_in;
        let [line1_out, line2_out, line3_out, line4_out] = self.lines_out;

        Some(RawReading {
            sensor_id: sensor.sensor_id,
            store_id: sensor.store_id,
            timestamp,
            end_time,
            line1_in,
            line1_out,
            line2_in,
            line2_out,
            line3_in,
            line3_out,
            line4_in,
            line4_out,
        })
    }
}

impl RegionalRow {
    /// Occupancy-weighted mean of the per-region dwell times.
    pub fn avg_dwell_seconds(&self) -> Option<f64> {
        // ---
        let (sum, weight) = self
            .regions
            .iter()
            .zip(self.dwell_seconds.iter())
            .filter_map(|(count, dwell)| dwell.map(|d| (d, (*count).max(0) as f64)))
            .fold((0.0, 0.0), |(s, w), (d, c)| (s + d * c, w + c));

        (weight > 0.0).then(|| sum / weight)
    }

    /// Attach the row to its sensor and move it to UTC through the payload's clock.
    pub fn to_reading(&self, sensor: &Sensor, clock: &mut LocalClock) -> Option<RegionalReading> {
        // ---
        let (timestamp, end_time) = clock.interval(self.start, self.end)?;
        let [region1_count, region2_count, region3_count, region4_count] = self.regions;
        Some(RegionalReading {
            sensor_id: sensor.sensor_id,
            store_id: sensor.store_id,
            timestamp,
            end_time,
            region1_count,
            region2_count,
            region3_count,
            region4_count,
            avg_dwell_seconds: self.avg_dwell_seconds(),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{NaiveDate, Timelike};
    use uuid::Uuid;

    use crate::models::{CircuitPhase, SensorStatus, SensorType};

    const HEADER: &str = "StartTime,EndTime,Line1 In,Line1 Out,Line1 Sum,Line2 In,Line2 Out,Line2 Sum,\
Line3 In,Line3 Out,Line3 Sum,Line4 In,Line4 Out,Line4 Sum,Total In,Total Out,Total Sum";

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, 22)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap()
    }

    #[test]
    fn test_timestamp_slashes_become_dashes() {
        // ---
        let raw = "2025/07/22 10:00:00";
        let expected =
            NaiveDateTime::parse_from_str(&raw.replace('/', "-"), "%Y-%m-%d %H:%M:%S").unwrap();

        let payload = format!(
            "{HEADER}\n{raw},2025/07/22 11:00:00,100,90,190,50,40,90,10,5,15,300,280,580,460,415,875\n"
        );
        let parsed = parse_people_counting(&payload, now());

        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].start, expected);
        assert_eq!(parsed.rows[0].end.hour(), 11);
        assert_eq!(parsed.rows[0].lines_in, [100, 50, 10, 300]);
        assert_eq!(parsed.rows[0].lines_out, [90, 40, 5, 280]);
    }

    #[test]
    fn test_vendor_dash_separated_timestamp() {
        // ---
        let t = parse_vendor_timestamp("2025/07/22-10:15:00").unwrap();
        assert_eq!(t.minute(), 15);
        assert_eq!(format_vendor_timestamp(t), "2025-07-22-10:15:00");
        assert!(parse_vendor_timestamp("22.07.2025 10:15").is_none());
    }

    #[test]
    fn test_future_rows_are_dropped() {
        // ---
        let payload = format!(
            "{HEADER}\n\
             2025/07/22 12:00:00,2025/07/22 13:00:00,1,1,2,1,1,2,1,1,2,1,1,2,4,4,8\n\
             2025/07/22 13:00:00,2025/07/22 14:00:00,1,1,2,1,1,2,1,1,2,1,1,2,4,4,8\n"
        );
        let parsed = parse_people_counting(&payload, now());

        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.future, 1);
        assert_eq!(parsed.rows[0].start.hour(), 12);
    }

    #[test]
    fn test_short_and_malformed_rows_are_skipped() {
        // ---
        let payload = format!(
            "{HEADER}\n\
             2025/07/22 09:00:00,2025/07/22 10:00:00,1,2,3\n\
             not-a-date,2025/07/22 10:00:00,1,1,2,1,1,2,1,1,2,1,1,2,4,4,8\n\
             2025/07/22 10:00:00,2025/07/22 11:00:00,x,1,2,1,1,2,1,1,2,1,1,2,4,4,8\n\
             2025/07/22 11:00:00,2025/07/22 12:00:00, 7 ,1,8,1,1,2,1,1,2,1,1,2,9,4,13\n"
        );
        let parsed = parse_people_counting(&payload, now());

        assert_eq!(parsed.skipped, 3);
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].lines_in[0], 7);
    }

    #[test]
    fn test_header_only_payload() {
        // ---
        let parsed = parse_people_counting(HEADER, now());
        assert!(parsed.rows.is_empty());
        assert_eq!(parsed.skipped, 0);
    }

    #[test]
    fn test_regional_rows_with_dwell() {
        // ---
        let payload = "StartTime,EndTime,Region1,Region2,Region3,Region4,Dwell1,Dwell2,Dwell3,Dwell4\n\
                       2025/07/22 10:00:00,2025/07/22 10:05:00,3,1,0,0,120,60,,\n\
                       2025/07/22 10:05:00,2025/07/22 10:10:00,2,2,1,0\n\
                       2025/07/22 10:10:00,2025/07/22 10:15:00,2,2\n";
        let parsed = parse_regional(payload, now());

        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.rows[0].regions, [3, 1, 0, 0]);
        // (120 * 3 + 60 * 1) / 4
        assert_eq!(parsed.rows[0].avg_dwell_seconds(), Some(105.0));
        assert_eq!(parsed.rows[1].avg_dwell_seconds(), None);
    }

    #[test]
    fn test_local_to_utc_handles_dst_gap() {
        // ---
        let tz = chrono_tz::Europe::Lisbon;
        // Summer time: Lisbon is UTC+1.
        let summer = NaiveDate::from_ymd_opt(2025, 7, 22)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(local_to_utc(tz, summer).unwrap().hour(), 9);

        // 2025-03-30 01:30 does not exist in Lisbon.
        let gap = NaiveDate::from_ymd_opt(2025, 3, 30)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        assert!(local_to_utc(tz, gap).is_none());
    }

    fn create_test_sensor(tz: Tz) -> Sensor {
        // ---
        Sensor {
            sensor_id: Uuid::new_v4(),
            sensor_name: "OML01".to_string(),
            sensor_type: SensorType::Omnia,
            ip_address: "10.0.0.5".to_string(),
            port: 80,
            store_id: Uuid::new_v4(),
            store_name: None,
            organization_id: None,
            organization_name: None,
            timezone: tz,
            is_active: true,
            status: SensorStatus::Online,
            consecutive_failures: 0,
            offline_since: None,
            recovery_attempts: 0,
            circuit_state: CircuitPhase::Closed,
            last_successful_check: None,
            last_failed_check: None,
        }
    }

    #[test]
    fn test_repeated_fall_back_hour_keeps_both_intervals() {
        // ---
        // Lisbon leaves summer time at 02:00 on 2025-10-26, so 01:00-02:00 happens twice.
        let payload = format!(
            "{HEADER}\n\
             2025/10/26 00:00:00,2025/10/26 01:00:00,1,0,1,0,0,0,0,0,0,0,0,0,1,0,1\n\
             2025/10/26 01:00:00,2025/10/26 02:00:00,2,0,2,0,0,0,0,0,0,0,0,0,2,0,2\n\
             2025/10/26 01:00:00,2025/10/26 02:00:00,3,0,3,0,0,0,0,0,0,0,0,0,3,0,3\n\
             2025/10/26 02:00:00,2025/10/26 03:00:00,4,0,4,0,0,0,0,0,0,0,0,0,4,0,4\n"
        );
        let local_now = NaiveDate::from_ymd_opt(2025, 10, 26)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let parsed = parse_people_counting(&payload, local_now);
        assert_eq!(parsed.rows.len(), 4);

        let sensor = create_test_sensor(chrono_tz::Europe::Lisbon);
        let mut clock = LocalClock::new(sensor.timezone);
        let readings: Vec<RawReading> = parsed
            .rows
            .iter()
            .map(|row| row.to_reading(&sensor, &mut clock).unwrap())
            .collect();

        let utc = |d, h| Utc.with_ymd_and_hms(2025, 10, d, h, 0, 0).unwrap();
        let starts: Vec<_> = readings.iter().map(|r| r.timestamp).collect();
        assert_eq!(starts, vec![utc(25, 23), utc(26, 0), utc(26, 1), utc(26, 2)]);

        let ends: Vec<_> = readings.iter().map(|r| r.end_time).collect();
        assert_eq!(ends, vec![utc(26, 0), utc(26, 1), utc(26, 2), utc(26, 3)]);
        assert_eq!(readings[1].line1_in, 2);
        assert_eq!(readings[2].line1_in, 3);
    }

    #[test]
    fn test_clock_skips_spring_forward_gap() {
        // ---
        let mut clock = LocalClock::new(chrono_tz::Europe::Lisbon);
        let at = |h| {
            NaiveDate::from_ymd_opt(2025, 3, 30)
                .unwrap()
                .and_hms_opt(h, 30, 0)
                .unwrap()
        };
        assert!(clock.interval(at(1), at(2)).is_none());
        let (start, end) = clock.interval(at(2), at(3)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 30, 1, 30, 0).unwrap());
        assert_eq!(end - start, chrono::Duration::hours(1));
    }
}
