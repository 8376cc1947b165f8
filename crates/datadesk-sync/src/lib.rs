//! Sync pipeline orchestration: job registry, change detection, and the
//! detect -> fetch -> reshape -> publish -> persist cycle per configured chart.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use datadesk_charts::{
    default_point_map_visualize, line_chart_axes, line_chart_visualize, point_map_mapping,
    publish_table, ChartService, ChartTemplate, DatawrapperClient, MapBounds, MetadataPatch,
    VisualizePolicy, DEFAULT_API_BASE,
};
use datadesk_core::{
    ap_date, ap_date_range, FetchWindow, SourceHeaders, SourceState,
};
use datadesk_reshape::{
    matrix_csv, metric_series, point_csv, point_table, series_csv, year_matrix_from_counts,
    year_matrix_from_series, PointSpec,
};
use datadesk_sources::{
    decode_csv_records, fetch_month_counts, fetch_window, filter_eq, BulkCsvSource, QuerySpec,
    SodaClient, TabularSource,
};
use datadesk_storage::{ProcessedStore, StateStore};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "datadesk-sync";

const BYLINE: &str = "San Francisco Examiner";

/// Process-level settings; per-chart configuration lives in the registry.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub soda_base_url: String,
    pub soda_app_token: Option<String>,
    pub chart_api_base: String,
    pub chart_api_token: String,
    pub registry_path: PathBuf,
    pub data_dir: PathBuf,
    pub probe_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            soda_base_url: std::env::var("DATADESK_SODA_URL")
                .unwrap_or_else(|_| "https://data.sfgov.org".to_string()),
            soda_app_token: std::env::var("DATASF_APP_TOKEN").ok(),
            chart_api_base: std::env::var("DATAWRAPPER_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            chart_api_token: std::env::var("DATAWRAPPER_API_KEY").unwrap_or_default(),
            registry_path: std::env::var("DATADESK_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            data_dir: std::env::var("DATADESK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            probe_timeout_secs: env_u64("DATADESK_PROBE_TIMEOUT_SECS", 10),
            query_timeout_secs: env_u64("DATADESK_QUERY_TIMEOUT_SECS", 30),
            download_timeout_secs: env_u64("DATADESK_DOWNLOAD_TIMEOUT_SECS", 300),
            scheduler_enabled: std::env::var("DATADESK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Declarative job registry: dozens of near-identical chart configurations
/// as data, one record per published chart.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRegistry {
    pub jobs: Vec<JobConfig>,
}

impl JobRegistry {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

fn default_true() -> bool {
    true
}

fn default_basemap() -> String {
    "usa-sanfran-analysis-neighborhood".to_string()
}

fn default_bounds() -> MapBounds {
    MapBounds {
        lat1: 37.71,
        lat2: 37.84,
        lon1: -122.51,
        lon2: -122.36,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub state_family: String,
    pub source_name: String,
    pub source_url: String,
    #[serde(flatten)]
    pub kind: JobKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// One day's (or week's) located events on a point map.
    PointMap {
        chart_id: String,
        query: QuerySpec,
        point: PointSpec,
        description_template: String,
        #[serde(default)]
        tooltip_template: Option<String>,
        /// Chart whose visual design is fanned out to this one.
        #[serde(default)]
        template_source: Option<String>,
        #[serde(default = "default_bounds")]
        bounds: MapBounds,
        #[serde(default = "default_basemap")]
        basemap: String,
        /// Fallback marker color for statuses outside the default palette.
        #[serde(default)]
        marker_color: Option<String>,
    },
    /// Year-over-year monthly counts as a line chart.
    MonthMatrix {
        chart_id: String,
        query: QuerySpec,
        description_template: String,
        y_axis_label: String,
    },
    /// Bulk-CSV metric family: one download, one chart per metric column.
    MetricLines {
        url: String,
        filter_column: String,
        filter_value: String,
        month_field: String,
        /// Charts only show months from here on; the archive keeps everything.
        #[serde(default)]
        chart_start: Option<NaiveDate>,
        metrics: Vec<MetricChart>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricChart {
    pub name: String,
    pub chart_id: String,
    pub value_field: String,
    pub y_axis_label: String,
    pub intro: String,
}

/// Skip a run iff the stored fingerprint matches the remote one, preferring
/// ETag and falling back to Last-Modified. Anything missing means "changed".
pub fn should_skip(state: &SourceState, headers: &SourceHeaders) -> bool {
    if let (Some(stored), Some(remote)) = (&state.etag, &headers.etag) {
        return stored == remote;
    }
    if let (Some(stored), Some(remote)) = (&state.last_modified, &headers.last_modified) {
        return stored == remote;
    }
    false
}

fn format_count(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn render_description(template: &str, count: usize, window: &FetchWindow) -> String {
    template
        .replace("{count}", &format_count(count))
        .replace("{date}", &ap_date(window.anchor))
        .replace(
            "{date_range}",
            &ap_date_range(window.start.date(), window.anchor),
        )
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| !matches!(o.status, JobStatus::Failed { .. }))
    }

    pub fn render_text(&self) -> String {
        let mut lines = vec![format!("run {}", self.run_id)];
        for outcome in &self.outcomes {
            let status = match &outcome.status {
                JobStatus::Published { url, rows } => format!("published {rows} rows -> {url}"),
                JobStatus::Unchanged => "skipped (no new data)".to_string(),
                JobStatus::Empty => "skipped (empty window)".to_string(),
                JobStatus::Failed { error } => format!("FAILED: {error}"),
            };
            lines.push(format!("  {}: {}", outcome.job, status));
        }
        let succeeded = self
            .outcomes
            .iter()
            .filter(|o| !matches!(o.status, JobStatus::Failed { .. }))
            .count();
        lines.push(format!(
            "{succeeded}/{} jobs succeeded",
            self.outcomes.len()
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Published { url: String, rows: usize },
    Unchanged,
    Empty,
    Failed { error: String },
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: JobRegistry,
    source: Arc<dyn TabularSource>,
    charts: Arc<dyn ChartService>,
    state: StateStore,
    processed: ProcessedStore,
}

impl SyncPipeline {
    /// Wire the live clients from process configuration.
    pub fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let registry = JobRegistry::load(&config.registry_path)?;
        let source = SodaClient::new(
            config.soda_base_url.clone(),
            config.soda_app_token.clone(),
            Duration::from_secs(config.query_timeout_secs),
        )
        .context("building tabular source client")?;
        let charts = DatawrapperClient::new(
            config.chart_api_base.clone(),
            config.chart_api_token.clone(),
            Duration::from_secs(config.query_timeout_secs),
        )
        .context("building chart service client")?;
        Ok(Self::new(config, registry, Arc::new(source), Arc::new(charts)))
    }

    /// Dependency-injected constructor; tests pass fakes for both services.
    pub fn new(
        config: SyncConfig,
        registry: JobRegistry,
        source: Arc<dyn TabularSource>,
        charts: Arc<dyn ChartService>,
    ) -> Self {
        let state = StateStore::new(config.data_dir.join("state"));
        let processed = ProcessedStore::new(config.data_dir.join("processed"));
        Self {
            config,
            registry,
            source,
            charts,
            state,
            processed,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn charts(&self) -> &Arc<dyn ChartService> {
        &self.charts
    }

    /// Process every enabled job, one at a time, isolating failures per job.
    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_selected(None).await
    }

    /// Process a single job by registry name.
    pub async fn run_only(&self, name: &str) -> Result<RunSummary> {
        if self.registry.job(name).is_none() {
            return Err(anyhow!("no job named {name} in the registry"));
        }
        self.run_selected(Some(name)).await
    }

    async fn run_selected(&self, only: Option<&str>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut templates: BTreeMap<String, ChartTemplate> = BTreeMap::new();
        let mut outcomes = Vec::new();

        for job in &self.registry.jobs {
            if let Some(only) = only {
                if job.name != only {
                    continue;
                }
            } else if !job.enabled {
                info!(job = %job.name, "job disabled; skipping");
                continue;
            }

            let status = match self.run_job(job, &mut templates).await {
                Ok(status) => status,
                Err(err) => {
                    error!(job = %job.name, error = format!("{err:#}"), "job failed");
                    JobStatus::Failed {
                        error: format!("{err:#}"),
                    }
                }
            };
            outcomes.push(JobOutcome {
                job: job.name.clone(),
                status,
            });
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(run_id = %run_id, ok = summary.all_succeeded(), "sync run finished");
        Ok(summary)
    }

    async fn run_job(
        &self,
        job: &JobConfig,
        templates: &mut BTreeMap<String, ChartTemplate>,
    ) -> Result<JobStatus> {
        info!(job = %job.name, "starting job");
        match &job.kind {
            JobKind::PointMap {
                chart_id,
                query,
                point,
                description_template,
                tooltip_template,
                template_source,
                bounds,
                basemap,
                marker_color,
            } => {
                self.run_point_map(
                    job,
                    chart_id,
                    query,
                    point,
                    description_template,
                    tooltip_template.as_deref(),
                    template_source.as_deref(),
                    *bounds,
                    basemap,
                    marker_color.as_deref(),
                    templates,
                )
                .await
            }
            JobKind::MonthMatrix {
                chart_id,
                query,
                description_template,
                y_axis_label,
            } => {
                self.run_month_matrix(job, chart_id, query, description_template, y_axis_label)
                    .await
            }
            JobKind::MetricLines {
                url,
                filter_column,
                filter_value,
                month_field,
                chart_start,
                metrics,
            } => {
                self.run_metric_lines(
                    job,
                    url,
                    filter_column,
                    filter_value,
                    month_field,
                    *chart_start,
                    metrics,
                )
                .await
            }
        }
    }

    /// Header probe that never fails a job: unavailable headers mean "assume
    /// changed" and fetch unconditionally.
    async fn probe_headers(&self, dataset: &str) -> SourceHeaders {
        match self.source.headers(dataset).await {
            Ok(headers) => headers,
            Err(err) => {
                warn!(dataset, error = %err, "header probe failed; proceeding without change detection");
                SourceHeaders::default()
            }
        }
    }

    async fn advance_state(&self, family: &str, headers: &SourceHeaders) -> Result<()> {
        let state = SourceState {
            etag: headers.etag.clone(),
            last_modified: headers.last_modified.clone(),
            last_ingested: Some(Utc::now()),
        };
        self.state.save(family, &state).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_point_map(
        &self,
        job: &JobConfig,
        chart_id: &str,
        query: &QuerySpec,
        point: &PointSpec,
        description_template: &str,
        tooltip_template: Option<&str>,
        template_source: Option<&str>,
        bounds: MapBounds,
        basemap: &str,
        marker_color: Option<&str>,
        templates: &mut BTreeMap<String, ChartTemplate>,
    ) -> Result<JobStatus> {
        let headers = self.probe_headers(&query.dataset).await;
        let state = self.state.load(&job.state_family).await;
        if should_skip(&state, &headers) {
            info!(job = %job.name, "remote fingerprint unchanged; skipping");
            return Ok(JobStatus::Unchanged);
        }

        let now = Utc::now().naive_utc();
        let fetched = fetch_window(self.source.as_ref(), query, now)
            .await
            .context("windowed fetch")?;

        let rows = point_table(&fetched.rows, point, fetched.window.end);
        if rows.is_empty() {
            if fetched.genuinely_empty() {
                self.advance_state(&job.state_family, &headers).await?;
                info!(job = %job.name, "no rows in window; state advanced");
            } else {
                warn!(job = %job.name, "no publishable rows; leaving state untouched");
            }
            return Ok(JobStatus::Empty);
        }

        let csv = point_csv(&rows, point);
        let description = render_description(description_template, rows.len(), &fetched.window);
        let patch = MetadataPatch {
            source_name: job.source_name.clone(),
            source_url: job.source_url.clone(),
            intro: description.clone(),
            byline: BYLINE.to_string(),
            annotate_note: format!("Data updated on {}", ap_date(Utc::now().date_naive())),
            tooltip: tooltip_template.map(str::to_string),
            visualize: VisualizePolicy::Preserve {
                default: default_point_map_visualize(bounds, basemap, marker_color),
            },
            mapping: Some(point_map_mapping()),
        };

        let url = publish_table(self.charts.as_ref(), chart_id, &csv, &patch)
            .await
            .context("publishing point map")?;

        if let Some(source_id) = template_source {
            if source_id != chart_id {
                if let Some(template) = self
                    .template_for(source_id, templates)
                    .await
                {
                    template
                        .apply(
                            self.charts.as_ref(),
                            chart_id,
                            Some(&description),
                            tooltip_template,
                        )
                        .await
                        .context("applying chart template")?;
                }
            }
        }

        self.processed
            .write_delimited(&job.state_family, &job.name, &csv)
            .await?;
        self.processed
            .snapshot_points(&job.state_family, &rows)
            .await?;
        self.advance_state(&job.state_family, &headers).await?;

        Ok(JobStatus::Published {
            url,
            rows: rows.len(),
        })
    }

    /// Capture-once cache for template fan-out; a capture failure downgrades
    /// the run to per-chart default styling rather than failing the job.
    async fn template_for<'a>(
        &self,
        source_id: &str,
        templates: &'a mut BTreeMap<String, ChartTemplate>,
    ) -> Option<&'a ChartTemplate> {
        match templates.entry(source_id.to_string()) {
            Entry::Occupied(entry) => Some(entry.into_mut()),
            Entry::Vacant(entry) => {
                match ChartTemplate::capture(self.charts.as_ref(), source_id).await {
                    Ok(template) => Some(entry.insert(template)),
                    Err(err) => {
                        warn!(
                            source_id,
                            error = %err,
                            "template capture failed; keeping per-chart styling"
                        );
                        None
                    }
                }
            }
        }
    }

    async fn run_month_matrix(
        &self,
        job: &JobConfig,
        chart_id: &str,
        query: &QuerySpec,
        description_template: &str,
        y_axis_label: &str,
    ) -> Result<JobStatus> {
        let headers = self.probe_headers(&query.dataset).await;
        let state = self.state.load(&job.state_family).await;
        if should_skip(&state, &headers) {
            info!(job = %job.name, "remote fingerprint unchanged; skipping");
            return Ok(JobStatus::Unchanged);
        }

        let now = Utc::now().naive_utc();
        let (records, window) = fetch_month_counts(self.source.as_ref(), query, now)
            .await
            .context("monthly count fetch")?;
        let matrix = year_matrix_from_counts(&records);
        if matrix.is_empty() {
            warn!(job = %job.name, "no monthly counts; leaving state untouched");
            return Ok(JobStatus::Empty);
        }

        let csv = matrix_csv(&matrix);
        let patch = MetadataPatch {
            source_name: job.source_name.clone(),
            source_url: job.source_url.clone(),
            intro: render_description(description_template, records.len(), &window),
            byline: BYLINE.to_string(),
            annotate_note: format!("Data updated on {}", ap_date(Utc::now().date_naive())),
            tooltip: None,
            visualize: VisualizePolicy::Replace {
                visualize: line_chart_visualize(&matrix.years()),
                axes: line_chart_axes(y_axis_label),
            },
            mapping: None,
        };

        let url = publish_table(self.charts.as_ref(), chart_id, &csv, &patch)
            .await
            .context("publishing month matrix")?;

        self.processed
            .write_delimited(&job.state_family, &job.name, &csv)
            .await?;
        self.processed
            .snapshot_matrix(&job.state_family, &matrix)
            .await?;
        self.advance_state(&job.state_family, &headers).await?;

        Ok(JobStatus::Published {
            url,
            rows: records.len(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_metric_lines(
        &self,
        job: &JobConfig,
        url: &str,
        filter_column: &str,
        filter_value: &str,
        month_field: &str,
        chart_start: Option<NaiveDate>,
        metrics: &[MetricChart],
    ) -> Result<JobStatus> {
        let bulk = BulkCsvSource::new(
            url,
            Duration::from_secs(self.config.probe_timeout_secs),
            Duration::from_secs(self.config.download_timeout_secs),
        )?;

        let headers = match bulk.headers().await {
            Ok(headers) => headers,
            Err(err) => {
                warn!(job = %job.name, error = %err, "header probe failed; proceeding without change detection");
                SourceHeaders::default()
            }
        };
        let state = self.state.load(&job.state_family).await;
        if should_skip(&state, &headers) {
            info!(job = %job.name, "no new data (fingerprint unchanged)");
            return Ok(JobStatus::Unchanged);
        }

        let bytes = bulk.download().await.context("bulk download")?;
        self.processed
            .archive_raw(&job.state_family, Utc::now(), "csv", &bytes)
            .await?;

        let records = decode_csv_records(&bytes).context("decoding bulk CSV")?;
        let filtered = filter_eq(records, filter_column, filter_value);
        if filtered.is_empty() {
            return Err(anyhow!(
                "no rows matched {filter_column} = {filter_value} in bulk dataset"
            ));
        }

        let mut published = 0usize;
        let mut last_url = String::new();
        let mut failures = Vec::new();
        for metric in metrics {
            match self
                .publish_metric(job, metric, &filtered, month_field, chart_start)
                .await
            {
                Ok(url) => {
                    published += 1;
                    last_url = url;
                }
                Err(err) => {
                    error!(job = %job.name, metric = %metric.name, error = format!("{err:#}"), "metric publish failed");
                    failures.push(format!("{}: {err:#}", metric.name));
                }
            }
        }

        if !failures.is_empty() {
            return Err(anyhow!(
                "{} of {} metric charts failed: {}",
                failures.len(),
                metrics.len(),
                failures.join("; ")
            ));
        }

        self.advance_state(&job.state_family, &headers).await?;
        Ok(JobStatus::Published {
            url: last_url,
            rows: published,
        })
    }

    async fn publish_metric(
        &self,
        job: &JobConfig,
        metric: &MetricChart,
        records: &[datadesk_core::RawRecord],
        month_field: &str,
        chart_start: Option<NaiveDate>,
    ) -> Result<String> {
        let series = metric_series(records, month_field, &metric.value_field);
        if series.is_empty() {
            return Err(anyhow!("metric column {} yielded no points", metric.value_field));
        }

        self.processed
            .write_delimited(&job.state_family, &metric.name, &series_csv(&series))
            .await?;

        let display: Vec<_> = match chart_start {
            Some(start) => series
                .iter()
                .filter(|(date, _)| *date >= start)
                .cloned()
                .collect(),
            None => series.clone(),
        };
        let matrix = year_matrix_from_series(&display);
        if matrix.is_empty() {
            return Err(anyhow!(
                "no chartable values for {} after {:?}",
                metric.name,
                chart_start
            ));
        }

        let patch = MetadataPatch {
            source_name: job.source_name.clone(),
            source_url: job.source_url.clone(),
            intro: metric.intro.clone(),
            byline: BYLINE.to_string(),
            annotate_note: format!("Data updated on {}", ap_date(Utc::now().date_naive())),
            tooltip: None,
            visualize: VisualizePolicy::Replace {
                visualize: line_chart_visualize(&matrix.years()),
                axes: line_chart_axes(&metric.y_axis_label),
            },
            mapping: None,
        };

        let url = publish_table(
            self.charts.as_ref(),
            &metric.chart_id,
            &matrix_csv(&matrix),
            &patch,
        )
        .await
        .context("publishing metric chart")?;

        self.processed
            .snapshot_matrix(&job.state_family, &matrix)
            .await?;
        Ok(url)
    }
}

/// Optional in-process scheduler; most deployments drive the CLI from cron
/// instead.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => {
                        info!(run_id = %summary.run_id, ok = summary.all_succeeded(), "scheduled sync finished");
                    }
                    Err(err) => error!(error = format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use datadesk_charts::{ChartError, ChartInfo};
    use datadesk_core::RawRecord;
    use datadesk_sources::{Soql, SourceError};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn state(etag: Option<&str>, last_modified: Option<&str>) -> SourceState {
        SourceState {
            etag: etag.map(str::to_string),
            last_modified: last_modified.map(str::to_string),
            last_ingested: None,
        }
    }

    fn headers(etag: Option<&str>, last_modified: Option<&str>) -> SourceHeaders {
        SourceHeaders {
            etag: etag.map(str::to_string),
            last_modified: last_modified.map(str::to_string),
        }
    }

    #[test]
    fn change_detector_truth_table() {
        assert!(should_skip(&state(Some("abc"), None), &headers(Some("abc"), None)));
        assert!(!should_skip(&state(Some("abc"), None), &headers(Some("xyz"), None)));
        assert!(!should_skip(&state(None, None), &headers(Some("abc"), Some("lm"))));
        assert!(!should_skip(&state(Some("abc"), None), &headers(None, None)));
        assert!(should_skip(&state(None, Some("lm")), &headers(None, Some("lm"))));
        // ETag wins when both sides carry one.
        assert!(should_skip(&state(Some("abc"), Some("old")), &headers(Some("abc"), Some("new"))));
    }

    #[test]
    fn counts_render_with_thousands_separators() {
        assert_eq!(format_count(2), "2");
        assert_eq!(format_count(1234), "1,234");
        assert_eq!(format_count(1234567), "1,234,567");
    }

    #[test]
    fn description_placeholders_fill_in() {
        let window = datadesk_core::WindowPolicy::LatestCompleteDay.resolve(
            Some(
                NaiveDate::from_ymd_opt(2025, 6, 3)
                    .expect("valid")
                    .and_hms_opt(12, 0, 0)
                    .expect("valid"),
            ),
            NaiveDate::from_ymd_opt(2025, 6, 5)
                .expect("valid")
                .and_hms_opt(8, 0, 0)
                .expect("valid"),
        );
        let text = render_description(
            "Showing {count} requests made to 311 on {date}.",
            2,
            &window,
        );
        assert_eq!(text, "Showing 2 requests made to 311 on June 3, 2025.");
    }

    #[test]
    fn registry_yaml_parses_all_job_kinds() {
        let yaml = r#"
jobs:
  - name: graffiti_map
    state_family: sf_311_graffiti
    source_name: DataSF
    source_url: https://datasf.org/opendata/
    kind: point_map
    chart_id: 0xtQT
    description_template: "These are the {count} instances of graffiti reported on {date}."
    tooltip_template: "<b>{{ detail }}</b>"
    template_source: nB5JE
    query:
      dataset: vw6y-z8j6
      select: [lat, long, requested_datetime]
      filter: "service_name LIKE 'Graffiti%'"
      date_field: requested_datetime
      not_null: [lat, long]
      policy: latest_complete_day
    point:
      latitude_field: lat
      longitude_field: long
      status_field: status_description
      address_fields: [address]
      datetime_field: requested_datetime
      category_field: service_name
      neighborhood_field: neighborhoods_sffind_boundaries
      district_field: supervisor_district
  - name: graffiti_monthly
    state_family: sf_311_graffiti_counts
    source_name: DataSF
    source_url: https://datasf.org/opendata/
    kind: month_matrix
    chart_id: aswDZ
    description_template: "Comparing monthly patterns across years"
    y_axis_label: Number of Reports
    query:
      dataset: vw6y-z8j6
      filter: "service_name LIKE 'Graffiti%'"
      date_field: requested_datetime
      policy: monthly_since
      epoch: 2020-01-01
  - name: rdc_inventory
    state_family: rdc_inventory
    source_name: Realtor.com (RDC) Metro Inventory
    source_url: https://www.realtor.com/research/data/
    kind: metric_lines
    url: https://econdata.example.com/metro_history.csv
    filter_column: cbsa_code
    filter_value: "41860"
    month_field: month_date_yyyymm
    chart_start: 2020-01-01
    metrics:
      - name: median_listing_price
        chart_id: xBni4
        value_field: median_listing_price
        y_axis_label: Median listing price (USD)
        intro: Monthly median listing price
"#;
        let registry: JobRegistry = serde_yaml::from_str(yaml).expect("parse registry");
        assert_eq!(registry.jobs.len(), 3);
        assert!(matches!(registry.jobs[0].kind, JobKind::PointMap { .. }));
        assert!(matches!(registry.jobs[1].kind, JobKind::MonthMatrix { .. }));
        assert!(matches!(registry.jobs[2].kind, JobKind::MetricLines { .. }));
        if let JobKind::PointMap { bounds, basemap, .. } = &registry.jobs[0].kind {
            assert_eq!(bounds.lat1, 37.71);
            assert_eq!(basemap, "usa-sanfran-analysis-neighborhood");
        }
    }

    // --- end-to-end pipeline over fakes -------------------------------------

    struct FakeTabular {
        rows: Vec<RawRecord>,
        grouped: Vec<RawRecord>,
        windowed_count: u64,
        all_time_count: u64,
        headers: SourceHeaders,
    }

    #[async_trait]
    impl TabularSource for FakeTabular {
        async fn headers(&self, _dataset: &str) -> Result<SourceHeaders, SourceError> {
            Ok(self.headers.clone())
        }

        async fn count(&self, _dataset: &str, predicate: &str) -> Result<u64, SourceError> {
            if predicate.contains(">=") {
                Ok(self.windowed_count)
            } else {
                Ok(self.all_time_count)
            }
        }

        async fn latest(
            &self,
            _dataset: &str,
            _date_field: &str,
            _predicate: &str,
        ) -> Result<Option<NaiveDateTime>, SourceError> {
            Ok(Some(
                NaiveDate::from_ymd_opt(2025, 6, 3)
                    .expect("valid")
                    .and_hms_opt(20, 0, 0)
                    .expect("valid"),
            ))
        }

        async fn rows(&self, _dataset: &str, query: &Soql) -> Result<Vec<RawRecord>, SourceError> {
            if query.group_by.is_some() {
                Ok(self.grouped.clone())
            } else if query.offset == Some(0) {
                Ok(self.rows.clone())
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[derive(Default)]
    struct RecordingCharts {
        csv: Mutex<Vec<(String, String)>>,
        metadata: Mutex<Vec<(String, serde_json::Value)>>,
        fail_chart: Option<String>,
    }

    #[async_trait]
    impl ChartService for RecordingCharts {
        async fn get_chart(&self, chart_id: &str) -> Result<ChartInfo, ChartError> {
            Ok(ChartInfo {
                metadata: json!({
                    "describe": { "title": format!("Title of {chart_id}") },
                }),
                public_url: Some(format!("https://charts.example/{chart_id}")),
            })
        }

        async fn update_metadata(
            &self,
            chart_id: &str,
            metadata: &serde_json::Value,
        ) -> Result<(), ChartError> {
            if self.fail_chart.as_deref() == Some(chart_id) {
                return Err(ChartError::HttpStatus {
                    status: 500,
                    url: format!("mock://{chart_id}"),
                });
            }
            self.metadata
                .lock()
                .expect("lock")
                .push((chart_id.to_string(), metadata.clone()));
            Ok(())
        }

        async fn replace_data(&self, chart_id: &str, csv: &str) -> Result<(), ChartError> {
            self.csv
                .lock()
                .expect("lock")
                .push((chart_id.to_string(), csv.to_string()));
            Ok(())
        }

        async fn publish(&self, _chart_id: &str) -> Result<(), ChartError> {
            Ok(())
        }
    }

    fn raw(fields: &[(&str, &str)]) -> RawRecord {
        let mut record = RawRecord::new();
        for (k, v) in fields {
            record.insert(k.to_string(), json!(v));
        }
        record
    }

    fn point_job_yaml() -> &'static str {
        r#"
jobs:
  - name: street_cleaning_map
    state_family: sf_311_street_cleaning
    source_name: DataSF
    source_url: https://datasf.org/opendata/
    kind: point_map
    chart_id: nB5JE
    description_template: "Showing {count} requests San Franciscans made to 311 on {date}."
    query:
      dataset: vw6y-z8j6
      select: [lat, long, requested_datetime, status_description, address]
      filter: "service_name = 'Street and Sidewalk Cleaning'"
      date_field: requested_datetime
      not_null: [lat, long]
      policy: latest_complete_day
    point:
      latitude_field: lat
      longitude_field: long
      status_field: status_description
      address_fields: [address]
      datetime_field: requested_datetime
      category_field: service_name
      neighborhood_field: neighborhoods_sffind_boundaries
      district_field: supervisor_district
"#
    }

    fn test_config(data_dir: &std::path::Path) -> SyncConfig {
        SyncConfig {
            soda_base_url: "https://data.sfgov.org".into(),
            soda_app_token: None,
            chart_api_base: "mock://".into(),
            chart_api_token: String::new(),
            registry_path: PathBuf::from("sources.yaml"),
            data_dir: data_dir.to_path_buf(),
            probe_timeout_secs: 1,
            query_timeout_secs: 1,
            download_timeout_secs: 1,
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".into(),
            sync_cron_2: "0 18 * * *".into(),
        }
    }

    #[tokio::test]
    async fn point_map_run_publishes_only_valid_rows() {
        let dir = tempdir().expect("tempdir");
        let registry: JobRegistry = serde_yaml::from_str(point_job_yaml()).expect("registry");
        let source = FakeTabular {
            rows: vec![
                raw(&[
                    ("lat", "37.77"),
                    ("long", "-122.41"),
                    ("requested_datetime", "2025-06-03T09:00:00.000"),
                    ("service_name", "Street and Sidewalk Cleaning"),
                ]),
                raw(&[
                    ("lat", "37.78"),
                    ("long", "-122.42"),
                    ("requested_datetime", "2025-06-03T10:00:00.000"),
                    ("service_name", "Street and Sidewalk Cleaning"),
                ]),
                raw(&[
                    ("lat", "37.79"),
                    ("requested_datetime", "2025-06-03T11:00:00.000"),
                    ("service_name", "Street and Sidewalk Cleaning"),
                ]),
            ],
            grouped: Vec::new(),
            windowed_count: 3,
            all_time_count: 100,
            headers: SourceHeaders::default(),
        };
        let charts = Arc::new(RecordingCharts::default());
        let pipeline = SyncPipeline::new(
            test_config(dir.path()),
            registry,
            Arc::new(source),
            charts.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert!(summary.all_succeeded());
        assert_eq!(summary.outcomes.len(), 1);
        match &summary.outcomes[0].status {
            JobStatus::Published { rows, url } => {
                assert_eq!(*rows, 2);
                assert_eq!(url, "https://charts.example/nB5JE");
            }
            other => panic!("unexpected status {other:?}"),
        }

        let uploads = charts.csv.lock().expect("lock");
        assert_eq!(uploads.len(), 1);
        let lines: Vec<&str> = uploads[0].1.trim_end().lines().collect();
        assert_eq!(lines.len(), 3); // header + two valid rows
        assert!(lines[0].starts_with("latitude,longitude,"));

        let metadata = charts.metadata.lock().expect("lock");
        let intro = metadata[0].1["describe"]["intro"].as_str().expect("intro");
        assert_eq!(intro, "Showing 2 requests San Franciscans made to 311 on June 3, 2025.");
        assert_eq!(
            metadata[0].1["describe"]["title"],
            json!("Title of nB5JE"),
        );

        // state advanced after the successful cycle
        let state = StateStore::new(dir.path().join("state"))
            .load("sf_311_street_cleaning")
            .await;
        assert!(state.last_ingested.is_some());
    }

    #[tokio::test]
    async fn genuine_empty_window_advances_state_without_publishing() {
        let dir = tempdir().expect("tempdir");
        let registry: JobRegistry = serde_yaml::from_str(point_job_yaml()).expect("registry");
        let source = FakeTabular {
            rows: Vec::new(),
            grouped: Vec::new(),
            windowed_count: 0,
            all_time_count: 5000,
            headers: headers(Some("\"tag-1\""), None),
        };
        let charts = Arc::new(RecordingCharts::default());
        let pipeline = SyncPipeline::new(
            test_config(dir.path()),
            registry,
            Arc::new(source),
            charts.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert!(matches!(summary.outcomes[0].status, JobStatus::Empty));
        assert!(charts.csv.lock().expect("lock").is_empty());

        let state = StateStore::new(dir.path().join("state"))
            .load("sf_311_street_cleaning")
            .await;
        assert_eq!(state.etag.as_deref(), Some("\"tag-1\""));
    }

    #[tokio::test]
    async fn dead_filter_leaves_state_untouched() {
        let dir = tempdir().expect("tempdir");
        let registry: JobRegistry = serde_yaml::from_str(point_job_yaml()).expect("registry");
        let source = FakeTabular {
            rows: Vec::new(),
            grouped: Vec::new(),
            windowed_count: 0,
            all_time_count: 0,
            headers: headers(Some("\"tag-1\""), None),
        };
        let pipeline = SyncPipeline::new(
            test_config(dir.path()),
            registry,
            Arc::new(source),
            Arc::new(RecordingCharts::default()),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert!(matches!(summary.outcomes[0].status, JobStatus::Empty));
        let state = StateStore::new(dir.path().join("state"))
            .load("sf_311_street_cleaning")
            .await;
        assert_eq!(state, SourceState::default());
    }

    #[tokio::test]
    async fn unchanged_fingerprint_skips_the_fetch() {
        let dir = tempdir().expect("tempdir");
        let registry: JobRegistry = serde_yaml::from_str(point_job_yaml()).expect("registry");
        let remote = headers(Some("\"tag-1\""), None);
        StateStore::new(dir.path().join("state"))
            .save(
                "sf_311_street_cleaning",
                &SourceState {
                    etag: Some("\"tag-1\"".into()),
                    last_modified: None,
                    last_ingested: Some(Utc::now()),
                },
            )
            .await
            .expect("seed state");

        let source = FakeTabular {
            rows: vec![raw(&[("lat", "37.77"), ("long", "-122.41")])],
            grouped: Vec::new(),
            windowed_count: 1,
            all_time_count: 1,
            headers: remote,
        };
        let charts = Arc::new(RecordingCharts::default());
        let pipeline = SyncPipeline::new(
            test_config(dir.path()),
            registry,
            Arc::new(source),
            charts.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert!(matches!(summary.outcomes[0].status, JobStatus::Unchanged));
        assert!(charts.csv.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn template_fanout_applies_after_publish() {
        let dir = tempdir().expect("tempdir");
        let yaml = r#"
jobs:
  - name: graffiti_map
    state_family: sf_311_graffiti
    source_name: DataSF
    source_url: https://datasf.org/opendata/
    kind: point_map
    chart_id: 0xtQT
    template_source: nB5JE
    description_template: "Showing {count} on {date}."
    tooltip_template: "<b>{{ detail }}</b>"
    query:
      dataset: vw6y-z8j6
      select: [lat, long]
      filter: "service_name LIKE 'Graffiti%'"
      date_field: requested_datetime
      policy: latest_complete_day
    point:
      latitude_field: lat
      longitude_field: long
      status_field: status_description
      address_fields: [address]
      datetime_field: requested_datetime
      category_field: service_name
      neighborhood_field: neighborhoods_sffind_boundaries
      district_field: supervisor_district
"#;
        let registry: JobRegistry = serde_yaml::from_str(yaml).expect("registry");
        let source = FakeTabular {
            rows: vec![raw(&[("lat", "37.77"), ("long", "-122.41")])],
            grouped: Vec::new(),
            windowed_count: 1,
            all_time_count: 10,
            headers: SourceHeaders::default(),
        };
        let charts = Arc::new(RecordingCharts::default());
        let pipeline = SyncPipeline::new(
            test_config(dir.path()),
            registry,
            Arc::new(source),
            charts.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert!(summary.all_succeeded());

        // one metadata write from the publish, one from the template apply
        let metadata = charts.metadata.lock().expect("lock");
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[0].0, "0xtQT");
        assert_eq!(metadata[1].0, "0xtQT");
        assert_eq!(
            metadata[1].1["visualize"]["tooltip"]["body"],
            json!("<b>{{ detail }}</b>"),
        );
    }

    #[tokio::test]
    async fn month_matrix_keeps_gap_months() {
        let dir = tempdir().expect("tempdir");
        let yaml = r#"
jobs:
  - name: street_cleaning_monthly
    state_family: sf_311_street_cleaning_counts
    source_name: DataSF
    source_url: https://datasf.org/opendata/
    kind: month_matrix
    chart_id: Fgte7
    description_template: "Comparing monthly patterns across years"
    y_axis_label: Number of Reports
    query:
      dataset: vw6y-z8j6
      filter: "service_name = 'Street and Sidewalk Cleaning'"
      date_field: requested_datetime
      policy: monthly_since
      epoch: 2020-01-01
"#;
        let registry: JobRegistry = serde_yaml::from_str(yaml).expect("registry");
        let source = FakeTabular {
            rows: Vec::new(),
            grouped: vec![
                raw(&[("month", "1"), ("year", "2023"), ("count", "10")]),
                raw(&[("month", "3"), ("year", "2023"), ("count", "5")]),
            ],
            windowed_count: 2,
            all_time_count: 2,
            headers: SourceHeaders::default(),
        };
        let charts = Arc::new(RecordingCharts::default());
        let pipeline = SyncPipeline::new(
            test_config(dir.path()),
            registry,
            Arc::new(source),
            charts.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert!(summary.all_succeeded());

        let uploads = charts.csv.lock().expect("lock");
        let lines: Vec<&str> = uploads[0].1.trim_end().lines().collect();
        assert_eq!(lines[0], "month,2023");
        assert_eq!(lines[1], "Jan,10");
        assert_eq!(lines[2], "Feb,");
        assert_eq!(lines[3], "Mar,5");
        assert_eq!(lines.len(), 13);

        let metadata = charts.metadata.lock().expect("lock");
        assert_eq!(metadata[0].1["visualize"]["type"], json!("d3-lines"));
        assert_eq!(
            metadata[0].1["axes"]["y"]["label"],
            json!("Number of Reports"),
        );
    }

    #[tokio::test]
    async fn one_failing_job_does_not_stop_the_rest() {
        let dir = tempdir().expect("tempdir");
        let yaml = r#"
jobs:
  - name: failing_map
    state_family: sf_311_failing
    source_name: DataSF
    source_url: https://datasf.org/opendata/
    kind: point_map
    chart_id: BAD01
    description_template: "Showing {count} on {date}."
    query:
      dataset: vw6y-z8j6
      select: [lat, long]
      filter: "service_name = 'X'"
      date_field: requested_datetime
      policy: latest_complete_day
    point:
      latitude_field: lat
      longitude_field: long
      status_field: status_description
      address_fields: [address]
      datetime_field: requested_datetime
      category_field: service_name
      neighborhood_field: neighborhoods_sffind_boundaries
      district_field: supervisor_district
  - name: healthy_map
    state_family: sf_311_healthy
    source_name: DataSF
    source_url: https://datasf.org/opendata/
    kind: point_map
    chart_id: GOOD1
    description_template: "Showing {count} on {date}."
    query:
      dataset: vw6y-z8j6
      select: [lat, long]
      filter: "service_name = 'Y'"
      date_field: requested_datetime
      policy: latest_complete_day
    point:
      latitude_field: lat
      longitude_field: long
      status_field: status_description
      address_fields: [address]
      datetime_field: requested_datetime
      category_field: service_name
      neighborhood_field: neighborhoods_sffind_boundaries
      district_field: supervisor_district
"#;
        let registry: JobRegistry = serde_yaml::from_str(yaml).expect("registry");
        let source = FakeTabular {
            rows: vec![raw(&[("lat", "37.77"), ("long", "-122.41")])],
            grouped: Vec::new(),
            windowed_count: 1,
            all_time_count: 10,
            headers: SourceHeaders::default(),
        };
        let charts = Arc::new(RecordingCharts {
            fail_chart: Some("BAD01".into()),
            ..Default::default()
        });
        let pipeline = SyncPipeline::new(
            test_config(dir.path()),
            registry,
            Arc::new(source),
            charts.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        assert!(!summary.all_succeeded());
        assert!(matches!(summary.outcomes[0].status, JobStatus::Failed { .. }));
        assert!(matches!(summary.outcomes[1].status, JobStatus::Published { .. }));

        // failing job must not advance its state
        let failed_state = StateStore::new(dir.path().join("state"))
            .load("sf_311_failing")
            .await;
        assert_eq!(failed_state, SourceState::default());
    }
}
