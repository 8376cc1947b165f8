//! Chart-hosting service client and the metadata merge engine.
//!
//! The merge is the one place this pipeline can silently destroy operator
//! work: published charts carry hand-tuned `visualize` styling that must
//! survive every data refresh. `apply_patch` therefore builds the new
//! metadata document *from* the live one and only ever overlays the keys a
//! job explicitly owns.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "datadesk-charts";

pub const DEFAULT_API_BASE: &str = "https://api.datawrapper.de/v3";

/// House palette, assigned to year lines newest-first.
pub const LINE_PALETTE: [&str; 6] = [
    "#cf4236", "#ffd74c", "#7e883f", "#80d0d8", "#e3cbac", "#CCC9c8",
];

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct ChartInfo {
    pub metadata: Value,
    pub public_url: Option<String>,
}

/// Operations the pipeline needs from the visualization service. Kept small
/// so tests can run against a recording mock.
#[async_trait]
pub trait ChartService: Send + Sync {
    async fn get_chart(&self, chart_id: &str) -> Result<ChartInfo, ChartError>;
    async fn update_metadata(&self, chart_id: &str, metadata: &Value) -> Result<(), ChartError>;
    async fn replace_data(&self, chart_id: &str, csv: &str) -> Result<(), ChartError>;
    async fn publish(&self, chart_id: &str) -> Result<(), ChartError>;
}

/// REST client for a Datawrapper-style chart API.
#[derive(Debug, Clone)]
pub struct DatawrapperClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl DatawrapperClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ChartError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    fn chart_url(&self, chart_id: &str, suffix: &str) -> String {
        format!("{}/charts/{}{}", self.base_url, chart_id, suffix)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ChartError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(ChartError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            })
        }
    }
}

#[async_trait]
impl ChartService for DatawrapperClient {
    async fn get_chart(&self, chart_id: &str) -> Result<ChartInfo, ChartError> {
        let url = self.chart_url(chart_id, "");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let body: Value = Self::check(response).await?.json().await?;
        Ok(ChartInfo {
            metadata: body.get("metadata").cloned().unwrap_or_else(|| json!({})),
            public_url: body
                .get("publicUrl")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn update_metadata(&self, chart_id: &str, metadata: &Value) -> Result<(), ChartError> {
        let url = self.chart_url(chart_id, "");
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "metadata": metadata }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn replace_data(&self, chart_id: &str, csv: &str) -> Result<(), ChartError> {
        let url = self.chart_url(chart_id, "/data");
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header("Content-Type", "text/csv; charset=utf-8")
            .body(csv.to_string())
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn publish(&self, chart_id: &str) -> Result<(), ChartError> {
        let url = self.chart_url(chart_id, "/publish");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Map extent for synthesized first-publish styling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    pub lat1: f64,
    pub lat2: f64,
    pub lon1: f64,
    pub lon2: f64,
}

/// How a job treats the chart's `visualize` block.
#[derive(Debug, Clone)]
pub enum VisualizePolicy {
    /// Carry the live block forward verbatim (operator-owned styling),
    /// synthesizing `default` only when no block exists yet.
    Preserve { default: Value },
    /// The block is derived from the data each run (year-line charts).
    Replace { visualize: Value, axes: Value },
}

/// The slice of metadata a job is allowed to refresh. Everything else,
/// the title above all, belongs to the operator and survives untouched.
#[derive(Debug, Clone)]
pub struct MetadataPatch {
    pub source_name: String,
    pub source_url: String,
    pub intro: String,
    pub byline: String,
    pub annotate_note: String,
    /// Tooltip body overlay; `None` leaves any existing tooltip alone.
    pub tooltip: Option<String>,
    pub visualize: VisualizePolicy,
    pub mapping: Option<Value>,
}

fn as_object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn tooltip_block(body: &str) -> Value {
    json!({
        "title": "",
        "body": body,
        "html": true,
        "style": "custom",
        "sticky": true,
        "enabled": true,
    })
}

/// Build the full metadata document to submit: the current document with the
/// job-owned keys refreshed. Idempotent by construction.
pub fn apply_patch(current: &Value, patch: &MetadataPatch) -> Value {
    let mut document = as_object(current);

    let mut describe = as_object(document.get("describe").unwrap_or(&Value::Null));
    describe.insert("source-name".into(), json!(patch.source_name));
    describe.insert("source-url".into(), json!(patch.source_url));
    describe.insert("intro".into(), json!(patch.intro));
    describe.insert("byline".into(), json!(patch.byline));
    document.insert("describe".into(), Value::Object(describe));

    let mut annotate = as_object(document.get("annotate").unwrap_or(&Value::Null));
    annotate.insert("notes".into(), json!(patch.annotate_note));
    document.insert("annotate".into(), Value::Object(annotate));

    match &patch.visualize {
        VisualizePolicy::Preserve { default } => {
            let existing = document
                .get("visualize")
                .and_then(Value::as_object)
                .filter(|block| !block.is_empty())
                .cloned();
            let mut visualize = match existing {
                Some(block) => block,
                None => as_object(default),
            };
            if let Some(body) = &patch.tooltip {
                visualize.insert("tooltip".into(), tooltip_block(body));
            }
            document.insert("visualize".into(), Value::Object(visualize));
        }
        VisualizePolicy::Replace { visualize, axes } => {
            document.insert("visualize".into(), visualize.clone());
            document.insert("axes".into(), axes.clone());
        }
    }

    if let Some(mapping) = &patch.mapping {
        document.entry("mapping").or_insert_with(|| mapping.clone());
    }

    Value::Object(document)
}

/// Synthesized styling for a first-ever point-map publish: point markers
/// colored by status, legend above the map. `marker_color` replaces the
/// fallback color for statuses outside the palette.
pub fn default_point_map_visualize(
    bounds: MapBounds,
    basemap: &str,
    marker_color: Option<&str>,
) -> Value {
    json!({
        "map": { "type": "points" },
        "general": {
            "height": 600,
            "miniMap": true,
            "zoomButtons": true,
            "scrollWheelZoom": true,
        },
        "zoom": { "min": 11, "max": 18, "default": 12 },
        "bounds": {
            "lat1": bounds.lat1,
            "lat2": bounds.lat2,
            "lon1": bounds.lon1,
            "lon2": bounds.lon2,
        },
        "color": {
            "column": "status",
            "palette": {
                "type": "categorical",
                "colors": {
                    "Open": "#ff4444",
                    "Closed": "#44ff44",
                    "In Progress": "#ffaa44",
                    "Duplicate": "#aaaaaa",
                    "other": marker_color.unwrap_or("#888888"),
                },
            },
        },
        "basemap": basemap,
        "legends": {
            "color": {
                "size": 170,
                "enabled": true,
                "position": "above",
                "orientation": "horizontal",
            },
        },
    })
}

pub fn point_map_mapping() -> Value {
    json!({
        "latitude": "latitude",
        "longitude": "longitude",
        "color": "status",
    })
}

/// Year-line styling derived from the matrix's year columns: house palette
/// assigned newest-first (so the newest year is always red), point symbols
/// on the newest year only, and missing months rendered as gaps.
pub fn line_chart_visualize(years: &[i32]) -> Value {
    let mut colors = Map::new();
    let mut lines = Map::new();
    for (i, year) in years.iter().rev().enumerate() {
        let color = LINE_PALETTE[i.min(LINE_PALETTE.len() - 1)];
        colors.insert(year.to_string(), json!(color));
        lines.insert(
            year.to_string(),
            json!({
                "stroke": "3px",
                "type": "line",
                "value-labels": false,
                "tooltip": true,
                "interpolation": "linear",
                "symbols": {
                    "enabled": i == 0,
                    "type": "circle",
                    "fill": color,
                    "stroke": color,
                    "size": 5,
                },
            }),
        );
    }
    json!({
        "type": "d3-lines",
        "interpolation": "linear",
        "custom-colors": colors,
        "lines": lines,
        "connect-null-values": false,
        "null-value-handling": "gap",
        "line-width": 3,
        "y-grid": "on",
        "y-grid-format": "0,0",
        "y-grid-labels": "auto",
        "y-grid-subdivide": true,
        "value-label-colors": true,
        "label-colors": true,
    })
}

pub fn line_chart_axes(y_label: &str) -> Value {
    json!({
        "y": { "min": 0, "label": y_label },
        "x": { "range": [0, 11], "ticks": "all", "grid": false },
    })
}

/// A captured visual design (`visualize`/`mapping`/`axes`) from one chart,
/// reusable across siblings that share a basemap and style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartTemplate {
    pub visualize: Value,
    pub mapping: Value,
    pub axes: Value,
}

impl ChartTemplate {
    pub async fn capture(
        service: &dyn ChartService,
        chart_id: &str,
    ) -> Result<Self, ChartError> {
        let chart = service.get_chart(chart_id).await?;
        let pick = |key: &str| chart.metadata.get(key).cloned().unwrap_or_else(|| json!({}));
        Ok(Self {
            visualize: pick("visualize"),
            mapping: pick("mapping"),
            axes: pick("axes"),
        })
    }

    /// Apply this design to a sibling chart, varying only the intro text and
    /// tooltip body. The sibling's `describe` block (title included) is
    /// preserved as-is.
    pub async fn apply(
        &self,
        service: &dyn ChartService,
        chart_id: &str,
        intro: Option<&str>,
        tooltip: Option<&str>,
    ) -> Result<(), ChartError> {
        let chart = service.get_chart(chart_id).await?;
        let mut describe = as_object(chart.metadata.get("describe").unwrap_or(&Value::Null));
        if let Some(intro) = intro {
            describe.insert("intro".into(), json!(intro));
        }

        let mut visualize = as_object(&self.visualize);
        if let Some(body) = tooltip {
            visualize.insert("tooltip".into(), tooltip_block(body));
        }

        let document = json!({
            "describe": Value::Object(describe),
            "visualize": Value::Object(visualize),
            "mapping": self.mapping,
            "axes": self.axes,
        });
        service.update_metadata(chart_id, &document).await?;
        info!(chart_id, "applied chart template");
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing chart template")?;
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Full publish cycle for one chart: fetch-merge-update metadata, replace
/// the data payload, publish, and return the public URL. Each call is
/// independently idempotent; a failure mid-sequence leaves the previously
/// published chart live.
pub async fn publish_table(
    service: &dyn ChartService,
    chart_id: &str,
    csv: &str,
    patch: &MetadataPatch,
) -> Result<String, ChartError> {
    let current = service.get_chart(chart_id).await?;
    let document = apply_patch(&current.metadata, patch);
    service.update_metadata(chart_id, &document).await?;
    service.replace_data(chart_id, csv).await?;
    service.publish(chart_id).await?;
    let refreshed = service.get_chart(chart_id).await?;
    let url = refreshed
        .public_url
        .unwrap_or_else(|| "unknown".to_string());
    info!(chart_id, url = %url, "chart published");
    Ok(url)
}
