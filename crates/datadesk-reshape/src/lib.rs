//! Deterministic reshaping of raw source records into chart-ready tables.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use datadesk_core::{
    ap_datetime, field_f64, field_str, parse_timestamp, sentence_case, street_address, title_case,
    PointRow, RawRecord, YearMatrix, MONTH_LABELS,
};
use serde::Deserialize;

pub const CRATE_NAME: &str = "datadesk-reshape";

const MISSING_LABEL: &str = "N/A";

/// Field mapping from one dataset's column names onto the canonical point
/// row, plus per-category default values for fields the source leaves blank.
#[derive(Debug, Clone, Deserialize)]
pub struct PointSpec {
    /// Separate numeric coordinate columns...
    #[serde(default)]
    pub latitude_field: String,
    #[serde(default)]
    pub longitude_field: String,
    /// ...or a single GeoJSON-style point column (`{"coordinates": [lon, lat]}`).
    #[serde(default)]
    pub location_field: Option<String>,
    pub status_field: String,
    /// Address columns, joined with spaces; several sources split the street
    /// address across number/name/suffix columns.
    pub address_fields: Vec<String>,
    pub datetime_field: String,
    pub category_field: String,
    #[serde(default)]
    pub subcategory_field: Option<String>,
    #[serde(default)]
    pub detail_field: Option<String>,
    pub neighborhood_field: String,
    pub district_field: String,
    #[serde(default)]
    pub extra_fields: Vec<ExtraField>,
    #[serde(default)]
    pub defaults: Vec<FieldDefault>,
}

/// An additional source column carried through to the published table.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtraField {
    /// Column name in the published table.
    pub column: String,
    /// Column name at the source.
    pub field: String,
}

/// Substitute value for a blank source field, optionally scoped to one
/// category (e.g. an empty encampment detail becomes "Encampment reported").
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDefault {
    pub field: String,
    pub value: String,
    #[serde(default)]
    pub when_category: Option<String>,
}

impl PointSpec {
    fn default_for(&self, field: &str, category: &str) -> Option<&str> {
        self.defaults
            .iter()
            .find(|d| {
                d.field == field
                    && d.when_category
                        .as_deref()
                        .map_or(true, |wanted| wanted == category)
            })
            .map(|d| d.value.as_str())
    }

    fn raw_or_default<'a>(&'a self, record: &'a RawRecord, field: &str, category: &str) -> String {
        let raw = field_str(record, field).unwrap_or("");
        if raw.trim().is_empty() || raw == "Not Available" {
            if let Some(value) = self.default_for(field, category) {
                return value.to_string();
            }
        }
        raw.to_string()
    }
}

/// Reshape raw records into the canonical point table. Rows whose
/// coordinates are missing, non-numeric, or outside plausible geographic
/// bounds are dropped; source order is preserved.
pub fn point_table(
    records: &[RawRecord],
    spec: &PointSpec,
    window_end: NaiveDateTime,
) -> Vec<PointRow> {
    records
        .iter()
        .filter_map(|record| point_row(record, spec, window_end))
        .collect()
}

fn geo_point(record: &RawRecord, field: &str) -> Option<(f64, f64)> {
    let coordinates = record.get(field)?.get("coordinates")?.as_array()?;
    let longitude = coordinates.first()?.as_f64()?;
    let latitude = coordinates.get(1)?.as_f64()?;
    Some((latitude, longitude))
}

fn point_row(record: &RawRecord, spec: &PointSpec, window_end: NaiveDateTime) -> Option<PointRow> {
    let (latitude, longitude) = match &spec.location_field {
        Some(field) => geo_point(record, field)?,
        None => (
            field_f64(record, &spec.latitude_field)?,
            field_f64(record, &spec.longitude_field)?,
        ),
    };
    if !latitude.is_finite() || !longitude.is_finite() {
        return None;
    }
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }

    let category_raw = field_str(record, &spec.category_field).unwrap_or("");
    let reported = field_str(record, &spec.datetime_field).and_then(parse_timestamp);
    let reported_at = reported.map(ap_datetime).unwrap_or_default();
    let hours_ago = reported.map(|at| {
        let hours = (window_end - at).num_seconds() as f64 / 3600.0;
        (hours * 10.0).round() / 10.0
    });

    let subcategory = spec
        .subcategory_field
        .as_deref()
        .map(|f| sentence_case(&spec.raw_or_default(record, f, category_raw)))
        .unwrap_or_default();
    let detail = spec
        .detail_field
        .as_deref()
        .map(|f| sentence_case(&spec.raw_or_default(record, f, category_raw)))
        .unwrap_or_default();

    let text_or_missing = |field: &str| {
        let value = spec.raw_or_default(record, field, category_raw);
        if value.trim().is_empty() {
            MISSING_LABEL.to_string()
        } else {
            value
        }
    };

    let extras = spec
        .extra_fields
        .iter()
        .map(|extra| spec.raw_or_default(record, &extra.field, category_raw))
        .collect();

    let address_raw = spec
        .address_fields
        .iter()
        .map(|field| spec.raw_or_default(record, field, category_raw))
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Some(PointRow {
        latitude,
        longitude,
        status: text_or_missing(&spec.status_field),
        address: street_address(&address_raw),
        reported_at,
        hours_ago,
        category: text_or_missing(&spec.category_field),
        subcategory,
        detail,
        neighborhood: title_case(&text_or_missing(&spec.neighborhood_field)),
        district: text_or_missing(&spec.district_field),
        extras,
    })
}

/// Pivot grouped (month, year, count) records into a year matrix. Records
/// with unparseable keys are skipped; missing cells stay gaps.
pub fn year_matrix_from_counts(records: &[RawRecord]) -> YearMatrix {
    let mut cells = BTreeMap::new();
    for record in records {
        let month = match field_f64(record, "month") {
            Some(m) if (1.0..=12.0).contains(&m) => m as usize - 1,
            _ => continue,
        };
        let year = match field_f64(record, "year") {
            Some(y) => y as i32,
            None => continue,
        };
        if let Some(count) = field_f64(record, "count") {
            cells.insert((year, month), count);
        }
    }
    YearMatrix::from_cells(&cells)
}

/// Pivot a monthly (date, value) series into a year matrix; `None` values
/// stay gaps.
pub fn year_matrix_from_series(series: &[(NaiveDate, Option<f64>)]) -> YearMatrix {
    let mut cells = BTreeMap::new();
    for (date, value) in series {
        if let Some(value) = value {
            cells.insert((date.year(), date.month0() as usize), *value);
        }
    }
    YearMatrix::from_cells(&cells)
}

/// Extract a dated metric series from bulk records carrying a `yyyymm` month
/// key column. Output is sorted by month; unparseable values become gaps.
pub fn metric_series(
    records: &[RawRecord],
    month_field: &str,
    value_field: &str,
) -> Vec<(NaiveDate, Option<f64>)> {
    let mut series: Vec<(NaiveDate, Option<f64>)> = records
        .iter()
        .filter_map(|record| {
            let month = field_str(record, month_field)
                .and_then(datadesk_core::parse_month_key)?;
            Some((month, field_f64(record, value_field)))
        })
        .collect();
    series.sort_by_key(|(date, _)| *date);
    series
}

/// Trailing 12-entry rolling mean over the non-missing values in each
/// window (minimum one observation); all-missing windows stay gaps.
pub fn rolling_mean_12(values: &[Option<f64>]) -> Vec<Option<f64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let start = i.saturating_sub(11);
            let window = &values[start..=i];
            let present: Vec<f64> = window.iter().flatten().copied().collect();
            if present.is_empty() {
                None
            } else {
                Some(present.iter().sum::<f64>() / present.len() as f64)
            }
        })
        .collect()
}

fn format_cell(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn write_csv(header: &[String], rows: Vec<Vec<String>>) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header).expect("csv write to memory");
    for row in rows {
        writer.write_record(&row).expect("csv write to memory");
    }
    let bytes = writer.into_inner().expect("csv flush to memory");
    String::from_utf8(bytes).expect("csv output is utf-8")
}

/// Render a point table as delimited text with a header row. The coordinate
/// columns are named exactly `latitude`/`longitude`, which the map renderer
/// requires.
pub fn point_csv(rows: &[PointRow], spec: &PointSpec) -> String {
    let mut header: Vec<String> = [
        "latitude",
        "longitude",
        "status",
        "address",
        "reported_at",
        "hours_ago",
        "category",
        "subcategory",
        "detail",
        "neighborhood",
        "district",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    header.extend(spec.extra_fields.iter().map(|e| e.column.clone()));

    let body = rows
        .iter()
        .map(|row| {
            let mut out = vec![
                row.latitude.to_string(),
                row.longitude.to_string(),
                row.status.clone(),
                row.address.clone(),
                row.reported_at.clone(),
                row.hours_ago.map(|h| format!("{h:.1}")).unwrap_or_default(),
                row.category.clone(),
                row.subcategory.clone(),
                row.detail.clone(),
                row.neighborhood.clone(),
                row.district.clone(),
            ];
            out.extend(row.extras.iter().cloned());
            out
        })
        .collect();
    write_csv(&header, body)
}

/// Render a year matrix as delimited text: always exactly twelve data rows,
/// one per canonical month label, empty cells for gaps.
pub fn matrix_csv(matrix: &YearMatrix) -> String {
    let mut header = vec!["month".to_string()];
    header.extend(matrix.years().iter().map(|y| y.to_string()));

    let body = (0..12)
        .map(|month| {
            let mut row = vec![MONTH_LABELS[month].to_string()];
            for column in matrix.columns() {
                row.push(column.values[month].map(format_cell).unwrap_or_default());
            }
            row
        })
        .collect();
    write_csv(&header, body)
}

/// Render a metric series with its rolling mean as `date,value,value_rolling_12m`.
pub fn series_csv(series: &[(NaiveDate, Option<f64>)]) -> String {
    let rolling = rolling_mean_12(&series.iter().map(|(_, v)| *v).collect::<Vec<_>>());
    let header = vec![
        "date".to_string(),
        "value".to_string(),
        "value_rolling_12m".to_string(),
    ];
    let body = series
        .iter()
        .zip(rolling)
        .map(|((date, value), mean)| {
            vec![
                date.format("%Y-%m-%d").to_string(),
                value.map(format_cell).unwrap_or_default(),
                mean.map(|m| format!("{m:.2}")).unwrap_or_default(),
            ]
        })
        .collect();
    write_csv(&header, body)
}
