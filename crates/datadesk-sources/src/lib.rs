//! Remote tabular source clients: SODA-style paged query API + bulk CSV files.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use datadesk_core::{
    parse_timestamp, FetchWindow, RawRecord, SourceHeaders, WindowPolicy,
};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "datadesk-sources";

/// Fixed page size for offset pagination against the query API.
pub const PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

fn status_error(status: StatusCode, url: &str) -> SourceError {
    SourceError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

/// A SoQL query against one dataset. Rendered as a single `$query` string;
/// SELECT has no FROM clause in this dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Soql {
    pub select: Vec<String>,
    pub where_parts: Vec<String>,
    pub group_by: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Soql {
    pub fn select(columns: &[&str]) -> Self {
        Self {
            select: columns.iter().map(|c| c.to_string()).collect(),
            where_parts: Vec::new(),
            group_by: None,
            order_by: None,
            limit: None,
            offset: None,
        }
    }

    pub fn and_where(mut self, predicate: impl Into<String>) -> Self {
        let predicate = predicate.into();
        if !predicate.trim().is_empty() {
            self.where_parts.push(predicate);
        }
        self
    }

    pub fn group_by(mut self, clause: impl Into<String>) -> Self {
        self.group_by = Some(clause.into());
        self
    }

    pub fn order_by(mut self, clause: impl Into<String>) -> Self {
        self.order_by = Some(clause.into());
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("SELECT {}", self.select.join(", "));
        if !self.where_parts.is_empty() {
            let joined = self
                .where_parts
                .iter()
                .map(|p| format!("({p})"))
                .collect::<Vec<_>>()
                .join(" AND ");
            out.push_str(&format!(" WHERE {joined}"));
        }
        if let Some(group) = &self.group_by {
            out.push_str(&format!(" GROUP BY {group}"));
        }
        if let Some(order) = &self.order_by {
            out.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(limit) = self.limit {
            out.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            out.push_str(&format!(" OFFSET {offset}"));
        }
        out
    }
}

/// Seam over the paged tabular query service so the pipeline can run against
/// an in-memory fake in tests.
#[async_trait]
pub trait TabularSource: Send + Sync {
    /// Change-detection headers for a dataset. Callers treat failures as
    /// "headers unavailable" and proceed (fail-open).
    async fn headers(&self, dataset: &str) -> Result<SourceHeaders, SourceError>;

    /// `COUNT(*)` under an arbitrary predicate.
    async fn count(&self, dataset: &str, predicate: &str) -> Result<u64, SourceError>;

    /// Most recent value of `date_field` under the predicate, if any.
    async fn latest(
        &self,
        dataset: &str,
        date_field: &str,
        predicate: &str,
    ) -> Result<Option<NaiveDateTime>, SourceError>;

    async fn rows(&self, dataset: &str, query: &Soql) -> Result<Vec<RawRecord>, SourceError>;
}

/// Client for a Socrata-style SODA endpoint (`/resource/{dataset}.json`).
#[derive(Debug, Clone)]
pub struct SodaClient {
    base_url: String,
    app_token: Option<String>,
    client: reqwest::Client,
}

impl SodaClient {
    pub fn new(
        base_url: impl Into<String>,
        app_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_token,
            client,
        })
    }

    fn resource_url(&self, dataset: &str) -> String {
        format!("{}/resource/{}.json", self.base_url, dataset)
    }

    fn apply_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.app_token {
            Some(token) => request.header("X-App-Token", token),
            None => request,
        }
    }

    async fn run(&self, dataset: &str, soql: &str) -> Result<Vec<RawRecord>, SourceError> {
        let url = self.resource_url(dataset);
        let response = self
            .apply_token(self.client.get(&url).query(&[("$query", soql)]))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &url));
        }
        let records: Vec<RawRecord> = response.json().await?;
        Ok(records)
    }
}

#[async_trait]
impl TabularSource for SodaClient {
    async fn headers(&self, dataset: &str) -> Result<SourceHeaders, SourceError> {
        let url = self.resource_url(dataset);
        let response = self
            .apply_token(self.client.head(&url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &url));
        }
        Ok(headers_of(response.headers()))
    }

    async fn count(&self, dataset: &str, predicate: &str) -> Result<u64, SourceError> {
        let query = Soql::select(&["COUNT(*) AS count"])
            .and_where(predicate)
            .render();
        let records = self.run(dataset, &query).await?;
        let first = records
            .first()
            .ok_or_else(|| SourceError::Malformed("empty count response".into()))?;
        datadesk_core::field_f64(first, "count")
            .map(|v| v as u64)
            .ok_or_else(|| SourceError::Malformed("count column missing".into()))
    }

    async fn latest(
        &self,
        dataset: &str,
        date_field: &str,
        predicate: &str,
    ) -> Result<Option<NaiveDateTime>, SourceError> {
        let query = Soql::select(&[date_field])
            .and_where(predicate)
            .and_where(format!("{date_field} IS NOT NULL"))
            .order_by(format!("{date_field} DESC"))
            .page(1, 0)
            .render();
        let records = self.run(dataset, &query).await?;
        Ok(records
            .first()
            .and_then(|r| datadesk_core::field_str(r, date_field))
            .and_then(parse_timestamp))
    }

    async fn rows(&self, dataset: &str, query: &Soql) -> Result<Vec<RawRecord>, SourceError> {
        self.run(dataset, &query.render()).await
    }
}

fn headers_of(headers: &reqwest::header::HeaderMap) -> SourceHeaders {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };
    SourceHeaders {
        etag: get("etag"),
        last_modified: get("last-modified"),
    }
}

/// What one job asks of the query service.
#[derive(Debug, Clone, Deserialize)]
pub struct QuerySpec {
    pub dataset: String,
    /// Projected columns for point queries; grouped queries build their own.
    #[serde(default)]
    pub select: Vec<String>,
    /// Source-side boolean predicate identifying the record category.
    pub filter: String,
    pub date_field: String,
    /// Columns that must be non-null at the source (coordinates, dates).
    #[serde(default)]
    pub not_null: Vec<String>,
    #[serde(flatten)]
    pub window: WindowPolicy,
}

impl QuerySpec {
    fn range_predicates(&self, window: &FetchWindow) -> Vec<String> {
        let fmt = |t: &NaiveDateTime| t.format("%Y-%m-%dT%H:%M:%S").to_string();
        let upper = if window.end_inclusive { "<=" } else { "<" };
        vec![
            format!("{} >= '{}'", self.date_field, fmt(&window.start)),
            format!("{} {} '{}'", self.date_field, upper, fmt(&window.end)),
        ]
    }

    fn windowed_predicate(&self, window: &FetchWindow) -> String {
        let mut parts = vec![format!("({})", self.filter)];
        parts.extend(self.range_predicates(window));
        parts.join(" AND ")
    }
}

/// Result of one windowed retrieval. `complete` is false when pagination was
/// aborted by an error and `rows` holds a partial result.
#[derive(Debug, Clone)]
pub struct WindowFetch {
    pub rows: Vec<RawRecord>,
    pub window: FetchWindow,
    pub windowed_count: Option<u64>,
    /// All-time count under the filter alone; probed only when the window
    /// came back empty, to tell a bad filter from a quiet day.
    pub all_time_count: Option<u64>,
    pub complete: bool,
}

impl WindowFetch {
    /// True when emptiness is backed by a count probe showing the filter
    /// does match rows outside the window.
    pub fn genuinely_empty(&self) -> bool {
        self.rows.is_empty() && self.complete && self.all_time_count.is_some_and(|c| c > 0)
    }
}

/// Probe the window anchor, count expected volume, then page through the
/// window until exhausted. Page errors abort pagination and surface the
/// partial result; probe errors fall back rather than failing the job.
pub async fn fetch_window(
    source: &dyn TabularSource,
    spec: &QuerySpec,
    now: NaiveDateTime,
) -> Result<WindowFetch, SourceError> {
    let latest = match source.latest(&spec.dataset, &spec.date_field, &spec.filter).await {
        Ok(latest) => latest,
        Err(err) => {
            warn!(dataset = %spec.dataset, error = %err, "latest-date probe failed; using fallback window");
            None
        }
    };
    let window = spec.window.resolve(latest, now);

    let windowed_count = match source
        .count(&spec.dataset, &spec.windowed_predicate(&window))
        .await
    {
        Ok(count) => {
            info!(dataset = %spec.dataset, count, "windowed count probe");
            Some(count)
        }
        Err(err) => {
            warn!(dataset = %spec.dataset, error = %err, "count probe failed");
            None
        }
    };

    let all_time_count = if windowed_count == Some(0) {
        match source.count(&spec.dataset, &spec.filter).await {
            Ok(count) => {
                if count == 0 {
                    warn!(
                        dataset = %spec.dataset,
                        filter = %spec.filter,
                        "filter matches no rows at all; likely a configuration error"
                    );
                }
                Some(count)
            }
            Err(err) => {
                warn!(dataset = %spec.dataset, error = %err, "all-time count probe failed");
                None
            }
        }
    } else {
        None
    };

    let mut base = Soql::select(
        &spec.select.iter().map(String::as_str).collect::<Vec<_>>(),
    )
    .and_where(format!("({})", spec.filter));
    for predicate in spec.range_predicates(&window) {
        base = base.and_where(predicate);
    }
    for column in &spec.not_null {
        base = base.and_where(format!("{column} IS NOT NULL"));
    }
    let base = base.order_by(format!("{} DESC", spec.date_field));

    let mut rows = Vec::new();
    let mut offset = 0usize;
    let mut complete = true;
    loop {
        let query = base.clone().page(PAGE_SIZE, offset);
        match source.rows(&spec.dataset, &query).await {
            Ok(page) => {
                let fetched = page.len();
                rows.extend(page);
                if fetched < PAGE_SIZE {
                    break;
                }
                offset += PAGE_SIZE;
            }
            Err(err) => {
                error!(
                    dataset = %spec.dataset,
                    offset,
                    error = %err,
                    "page fetch failed; keeping partial result"
                );
                complete = false;
                break;
            }
        }
    }

    info!(dataset = %spec.dataset, rows = rows.len(), complete, "windowed fetch finished");
    Ok(WindowFetch {
        rows,
        window,
        windowed_count,
        all_time_count,
        complete,
    })
}

/// Grouped (month, year, count) retrieval for year-over-year charts. The
/// grouped result is small, so this is a single un-paginated query.
pub async fn fetch_month_counts(
    source: &dyn TabularSource,
    spec: &QuerySpec,
    now: NaiveDateTime,
) -> Result<(Vec<RawRecord>, FetchWindow), SourceError> {
    let latest = match source.latest(&spec.dataset, &spec.date_field, &spec.filter).await {
        Ok(latest) => latest,
        Err(err) => {
            warn!(dataset = %spec.dataset, error = %err, "latest-date probe failed; using fallback window");
            None
        }
    };
    let window = spec.window.resolve(latest, now);

    let month_expr = format!("date_extract_m({}) AS month", spec.date_field);
    let year_expr = format!("date_extract_y({}) AS year", spec.date_field);
    let mut query = Soql::select(&[month_expr.as_str(), year_expr.as_str(), "COUNT(*) AS count"])
        .and_where(format!("({})", spec.filter));
    for predicate in spec.range_predicates(&window) {
        query = query.and_where(predicate);
    }
    let query = query
        .group_by("year, month")
        .order_by("year ASC, month ASC")
        .page(PAGE_SIZE, 0);

    let rows = source.rows(&spec.dataset, &query).await?;
    Ok((rows, window))
}

/// Bulk CSV file over HTTP (monthly research datasets). Change detection via
/// ETag/Last-Modified; the whole file is downloaded and decoded in memory.
#[derive(Debug, Clone)]
pub struct BulkCsvSource {
    url: String,
    client: reqwest::Client,
    probe_timeout: Duration,
    download_timeout: Duration,
}

impl BulkCsvSource {
    pub fn new(
        url: impl Into<String>,
        probe_timeout: Duration,
        download_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().gzip(true).build()?;
        Ok(Self {
            url: url.into(),
            client,
            probe_timeout,
            download_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// HEAD probe for change-detection headers, falling back to a GET when
    /// the host rejects HEAD.
    pub async fn headers(&self) -> Result<SourceHeaders, SourceError> {
        let head = self
            .client
            .head(&self.url)
            .timeout(self.probe_timeout)
            .send()
            .await;
        match head {
            Ok(response) if response.status().is_success() => {
                Ok(headers_of(response.headers()))
            }
            other => {
                if let Err(err) = other {
                    warn!(url = %self.url, error = %err, "HEAD probe failed; falling back to GET");
                }
                let response = self
                    .client
                    .get(&self.url)
                    .timeout(self.download_timeout)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(status_error(status, &self.url));
                }
                Ok(headers_of(response.headers()))
            }
        }
    }

    pub async fn download(&self) -> Result<Vec<u8>, SourceError> {
        info!(url = %self.url, "downloading bulk CSV");
        let response = self
            .client
            .get(&self.url)
            .timeout(self.download_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &self.url));
        }
        let bytes = response.bytes().await?;
        info!(url = %self.url, bytes = bytes.len(), "bulk CSV downloaded");
        Ok(bytes.to_vec())
    }
}

/// Decode a CSV document into raw records, one string value per header.
pub fn decode_csv_records(bytes: &[u8]) -> Result<Vec<RawRecord>, SourceError> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| SourceError::Malformed(e.to_string()))?
        .clone();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| SourceError::Malformed(e.to_string()))?;
        let mut record = RawRecord::new();
        for (name, value) in headers.iter().zip(row.iter()) {
            record.insert(
                name.to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
        records.push(record);
    }
    Ok(records)
}

/// Keep only records whose `column` equals `value` (string comparison, the
/// CSV decode keeps everything as text).
pub fn filter_eq(records: Vec<RawRecord>, column: &str, value: &str) -> Vec<RawRecord> {
    records
        .into_iter()
        .filter(|r| datadesk_core::field_str(r, column) == Some(value))
        .collect()
}
