//! Core domain model for the datadesk chart sync pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "datadesk-core";

/// One raw row as returned by a tabular source. Any field may be absent or null.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Canonical month labels used by every year-matrix chart.
pub const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

pub fn field_str<'a>(record: &'a RawRecord, name: &str) -> Option<&'a str> {
    match record.get(name) {
        Some(serde_json::Value::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Numeric view of a field. Sources deliver numbers both as JSON numbers and
/// as decimal strings; anything unparseable is missing, never zero.
pub fn field_f64(record: &RawRecord, name: &str) -> Option<f64> {
    let value = match record.get(name) {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

/// Timestamps arrive as `2025-01-02T03:04:05.000` (floating, no zone) or as a
/// bare date; fractional seconds are tolerated and dropped.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    let without_fraction = trimmed.split('.').next().unwrap_or(trimmed);
    NaiveDateTime::parse_from_str(without_fraction, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(without_fraction, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Parse a `yyyymm` month key into the first day of that month.
pub fn parse_month_key(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.len() != 6 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = trimmed[..4].parse().ok()?;
    let month: u32 = trimmed[4..].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Canonical display row for a point map. Coordinates are guaranteed present,
/// finite, and within plausible geographic bounds by the reshaper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointRow {
    pub latitude: f64,
    pub longitude: f64,
    pub status: String,
    pub address: String,
    pub reported_at: String,
    pub hours_ago: Option<f64>,
    pub category: String,
    pub subcategory: String,
    pub detail: String,
    pub neighborhood: String,
    pub district: String,
    /// Values for the job's extra display columns, in declaration order.
    pub extras: Vec<String>,
}

/// Month-by-year pivot: one column per observed year (ascending), twelve
/// cells per column keyed by `MONTH_LABELS`. Missing cells are gaps, not zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearMatrix {
    columns: Vec<YearColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearColumn {
    pub year: i32,
    pub values: [Option<f64>; 12],
}

impl YearMatrix {
    /// Build from sparse cells keyed by (year, zero-based month index).
    /// Out-of-range month indexes are ignored.
    pub fn from_cells(cells: &BTreeMap<(i32, usize), f64>) -> Self {
        let mut columns: Vec<YearColumn> = Vec::new();
        for (&(year, month), &value) in cells {
            if month >= 12 {
                continue;
            }
            if columns.last().map(|c| c.year) != Some(year) {
                columns.push(YearColumn {
                    year,
                    values: [None; 12],
                });
            }
            let column = columns.last_mut().expect("column pushed above");
            column.values[month] = Some(value);
        }
        Self { columns }
    }

    pub fn columns(&self) -> &[YearColumn] {
        &self.columns
    }

    pub fn years(&self) -> Vec<i32> {
        self.columns.iter().map(|c| c.year).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Persisted per-source-family fingerprint. Written only after a fully
/// successful fetch + publish cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceState {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_ingested: Option<DateTime<Utc>>,
}

/// Change-detection headers from a remote metadata probe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// How a job's retrieval window is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum WindowPolicy {
    /// The most recent day with data, `[day 00:00, next day 00:00)`.
    LatestCompleteDay,
    /// `[anchor - days, anchor]`, date-granular; future anchors clamp to now.
    TrailingDays { days: u32 },
    /// `[epoch, last day of the last complete month]`.
    MonthlySince { epoch: NaiveDate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub end_inclusive: bool,
    /// The day a human would call "the" date of this window; drives
    /// description text.
    pub anchor: NaiveDate,
}

impl WindowPolicy {
    pub fn resolve(&self, latest: Option<NaiveDateTime>, now: NaiveDateTime) -> FetchWindow {
        match *self {
            WindowPolicy::LatestCompleteDay => {
                let day = latest
                    .map(|t| t.date())
                    .unwrap_or_else(|| now.date() - Days::new(1));
                FetchWindow {
                    start: day.and_time(NaiveTime::MIN),
                    end: (day + Days::new(1)).and_time(NaiveTime::MIN),
                    end_inclusive: false,
                    anchor: day,
                }
            }
            WindowPolicy::TrailingDays { days } => {
                let mut anchor = latest.map(|t| t.date()).unwrap_or_else(|| now.date());
                if anchor > now.date() {
                    anchor = now.date();
                }
                FetchWindow {
                    start: (anchor - Days::new(u64::from(days))).and_time(NaiveTime::MIN),
                    end: anchor.and_time(end_of_day()),
                    end_inclusive: true,
                    anchor,
                }
            }
            WindowPolicy::MonthlySince { epoch } => {
                let first_of_month = now
                    .date()
                    .with_day(1)
                    .expect("day 1 exists in every month");
                let end = first_of_month - Days::new(1);
                FetchWindow {
                    start: epoch.and_time(NaiveTime::MIN),
                    end: end.and_time(end_of_day()),
                    end_inclusive: true,
                    anchor: end,
                }
            }
        }
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).expect("valid clock time")
}

// --- AP-style text formatting -----------------------------------------------

const AP_MONTHS: [&str; 12] = [
    "Jan.", "Feb.", "March", "April", "May", "June", "July", "Aug.", "Sept.", "Oct.", "Nov.",
    "Dec.",
];

/// "Jan. 2, 2025" / "March 15, 2025": abbreviated months carry a period,
/// short month names do not, and days have no leading zero.
pub fn ap_date(date: NaiveDate) -> String {
    format!(
        "{} {}, {}",
        AP_MONTHS[date.month0() as usize],
        date.day(),
        date.year()
    )
}

/// AP time: 12-hour clock, lowercase "a.m."/"p.m.", minutes omitted when
/// zero, with "noon" and "midnight" special-cased.
pub fn ap_time(time: NaiveTime) -> String {
    let (hour, minute) = (time.hour(), time.minute());
    match (hour, minute) {
        (0, 0) => "midnight".to_string(),
        (12, 0) => "noon".to_string(),
        _ => {
            let meridiem = if hour < 12 { "a.m." } else { "p.m." };
            let hour_12 = match hour % 12 {
                0 => 12,
                h => h,
            };
            if minute == 0 {
                format!("{hour_12} {meridiem}")
            } else {
                format!("{hour_12}:{minute:02} {meridiem}")
            }
        }
    }
}

pub fn ap_datetime(at: NaiveDateTime) -> String {
    format!("{}, {}", ap_date(at.date()), ap_time(at.time()))
}

/// "Jan. 2 - Jan. 9, 2025"; year stated once when both ends share it.
pub fn ap_date_range(start: NaiveDate, end: NaiveDate) -> String {
    if start.year() == end.year() {
        format!(
            "{} {} - {}",
            AP_MONTHS[start.month0() as usize],
            start.day(),
            ap_date(end)
        )
    } else {
        format!("{} - {}", ap_date(start), ap_date(end))
    }
}

/// Underscores become spaces; the first letter is capitalized and the rest
/// lowered ("human_waste_or_urine" -> "Human waste or urine").
pub fn sentence_case(raw: &str) -> String {
    let spaced = raw.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => spaced,
    }
}

/// Per-word capitalization ("mission district" -> "Mission District").
pub fn title_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut at_word_start = true;
    for ch in raw.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(ch);
            at_word_start = true;
        }
    }
    out
}

const STREET_SUFFIXES: [&str; 9] = ["St", "Ave", "Blvd", "Rd", "Dr", "Ln", "Ct", "Pl", "Hwy"];

/// Keep only the street part of a full address (before the first comma),
/// title-case it, and re-uppercase common street suffix abbreviations.
pub fn street_address(raw: &str) -> String {
    let street = raw.split(',').next().unwrap_or(raw).trim();
    let cased = title_case(street);
    cased
        .split_whitespace()
        .map(|word| {
            let bare = word.trim_end_matches('.');
            if STREET_SUFFIXES.contains(&bare) {
                bare.to_uppercase()
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
