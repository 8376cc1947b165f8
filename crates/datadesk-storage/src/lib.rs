//! Persisted pipeline state, processed outputs, and archival snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use datadesk_core::{PointRow, SourceState, YearMatrix, MONTH_LABELS};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;

pub const CRATE_NAME: &str = "datadesk-storage";

/// Write bytes via a temp file in the same directory plus rename, so readers
/// never observe a half-written file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("no file name in {}", path.display()))?
        .to_string_lossy()
        .to_string();
    let temp_path = parent.join(format!(".{file_name}.tmp"));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))?;
    Ok(())
}

/// One JSON state file per source family under the state root. Unreadable
/// state is recovered as "first run"; it is never fatal.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, family: &str) -> PathBuf {
        self.root.join(format!("{family}_state.json"))
    }

    pub async fn load(&self, family: &str) -> SourceState {
        let path = self.path_for(family);
        match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => state,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "unreadable state file; starting fresh"
                    );
                    SourceState::default()
                }
            },
            Err(_) => SourceState::default(),
        }
    }

    pub async fn save(&self, family: &str, state: &SourceState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(state).context("serializing source state")?;
        write_atomic(&self.path_for(family), &bytes).await
    }
}

/// Processed outputs per source family: delimited tables, timestamped raw
/// archive copies, and columnar snapshots with a manifest.
#[derive(Debug, Clone)]
pub struct ProcessedStore {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

impl ProcessedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn family_dir(&self, family: &str) -> PathBuf {
        self.root.join(family)
    }

    pub async fn write_delimited(
        &self,
        family: &str,
        name: &str,
        csv: &str,
    ) -> anyhow::Result<PathBuf> {
        let path = self.family_dir(family).join(format!("{name}.csv"));
        write_atomic(&path, csv.as_bytes()).await?;
        Ok(path)
    }

    /// Archive a raw download under `raw/` with a UTC timestamp in the name.
    pub async fn archive_raw(
        &self,
        family: &str,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let stamp = fetched_at.format("%Y%m%dT%H%M%SZ");
        let path = self
            .family_dir(family)
            .join("raw")
            .join(format!("{family}_{stamp}.{extension}"));
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    pub async fn snapshot_points(
        &self,
        family: &str,
        rows: &[PointRow],
    ) -> anyhow::Result<PathBuf> {
        let dir = self.family_dir(family).join("snapshots");
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{family}.parquet"));
        write_point_parquet(&path, rows)?;
        self.write_manifest(&dir, family, &path).await?;
        Ok(path)
    }

    pub async fn snapshot_matrix(
        &self,
        family: &str,
        matrix: &YearMatrix,
    ) -> anyhow::Result<PathBuf> {
        let dir = self.family_dir(family).join("snapshots");
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{family}.parquet"));
        write_matrix_parquet(&path, matrix)?;
        self.write_manifest(&dir, family, &path).await?;
        Ok(path)
    }

    async fn write_manifest(
        &self,
        dir: &Path,
        family: &str,
        snapshot_path: &Path,
    ) -> anyhow::Result<()> {
        let manifest = SnapshotManifest {
            schema_version: 1,
            files: vec![manifest_entry(family, dir, snapshot_path)?],
        };
        let bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        write_atomic(&dir.join("manifest.json"), &bytes).await
    }
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> anyhow::Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(base_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

fn write_parquet(path: &Path, batch: RecordBatch) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_point_parquet(path: &Path, rows: &[PointRow]) -> anyhow::Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("latitude", DataType::Float64, false),
        ArrowField::new("longitude", DataType::Float64, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("address", DataType::Utf8, false),
        ArrowField::new("reported_at", DataType::Utf8, false),
        ArrowField::new("hours_ago", DataType::Float64, true),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("subcategory", DataType::Utf8, false),
        ArrowField::new("detail", DataType::Utf8, false),
        ArrowField::new("neighborhood", DataType::Utf8, false),
        ArrowField::new("district", DataType::Utf8, false),
    ]));

    let strings = |pick: fn(&PointRow) -> &str| -> ArrayRef {
        Arc::new(StringArray::from(
            rows.iter().map(|r| Some(pick(r))).collect::<Vec<_>>(),
        ))
    };
    let latitudes: ArrayRef = Arc::new(Float64Array::from(
        rows.iter().map(|r| r.latitude).collect::<Vec<_>>(),
    ));
    let longitudes: ArrayRef = Arc::new(Float64Array::from(
        rows.iter().map(|r| r.longitude).collect::<Vec<_>>(),
    ));
    let hours_ago: ArrayRef = Arc::new(Float64Array::from(
        rows.iter().map(|r| r.hours_ago).collect::<Vec<_>>(),
    ));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            latitudes,
            longitudes,
            strings(|r| &r.status),
            strings(|r| &r.address),
            strings(|r| &r.reported_at),
            hours_ago,
            strings(|r| &r.category),
            strings(|r| &r.subcategory),
            strings(|r| &r.detail),
            strings(|r| &r.neighborhood),
            strings(|r| &r.district),
        ],
    )
    .context("building point snapshot record batch")?;
    write_parquet(path, batch)
}

fn write_matrix_parquet(path: &Path, matrix: &YearMatrix) -> anyhow::Result<()> {
    let mut fields = vec![ArrowField::new("month", DataType::Utf8, false)];
    for year in matrix.years() {
        fields.push(ArrowField::new(year.to_string(), DataType::Float64, true));
    }
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(
        MONTH_LABELS.iter().map(|m| Some(*m)).collect::<Vec<_>>(),
    ))];
    for column in matrix.columns() {
        columns.push(Arc::new(Float64Array::from(column.values.to_vec())));
    }

    let batch = RecordBatch::try_new(schema, columns)
        .context("building matrix snapshot record batch")?;
    write_parquet(path, batch)
}
