//! Durable import checkpoints.
//!
//! A checkpoint records how far a run got and what it counted along the
//! way. It is written only after a batch commits, and every write is
//! atomic, so after a crash the stored position never points past data
//! that was rolled back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ImportError;
use super::plan::PlanFingerprint;
use crate::repository::CheckpointRepository;

/// Weight of the previous rate in the throughput moving average.
const RATE_SMOOTHING: f64 = 0.7;

/// One entry of the bounded recent-error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Source offset of the failing record, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Natural key of the failing record, when it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ErrorEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            offset: None,
            key: None,
        }
    }

    pub fn at(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Progress checkpoint for one run key.
///
/// Serialized as camelCase JSON; unknown fields are ignored on load so
/// older and newer builds can read each other's checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Checkpoint {
    /// Index into the run's work order of the next record to process.
    pub position: u64,
    /// Partition (state) the position falls in, when partitioning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    pub total_imported: u64,
    pub total_skipped: u64,
    pub total_errors: u64,
    pub records_per_minute: f64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub errors: Vec<ErrorEntry>,
    /// The run reached the end of its work order.
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Size of the work order when the run started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
    /// The work order `position` indexes into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanFingerprint>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            position: 0,
            partition: None,
            total_imported: 0,
            total_skipped: 0,
            total_errors: 0,
            records_per_minute: 0.0,
            start_time: now,
            last_update: now,
            errors: Vec::new(),
            done: false,
            source: None,
            total_records: None,
            plan: None,
        }
    }
}

impl Checkpoint {
    /// Fold one batch's throughput into the moving average.
    ///
    /// The first batch seeds the average directly.
    pub fn update_rate(&mut self, batch_rate: f64) {
        if !batch_rate.is_finite() || batch_rate < 0.0 {
            return;
        }
        self.records_per_minute = if self.records_per_minute <= 0.0 {
            batch_rate
        } else {
            RATE_SMOOTHING * self.records_per_minute + (1.0 - RATE_SMOOTHING) * batch_rate
        };
    }

    /// Append errors, keeping only the most recent `max` entries.
    pub fn push_errors(&mut self, entries: impl IntoIterator<Item = ErrorEntry>, max: usize) {
        self.errors.extend(entries);
        if self.errors.len() > max {
            let excess = self.errors.len() - max;
            self.errors.drain(..excess);
        }
    }

    /// Records processed so far, whatever their outcome.
    pub fn processed(&self) -> u64 {
        self.total_imported + self.total_skipped + self.total_errors
    }

    /// Estimated minutes remaining at the current rate.
    pub fn eta_minutes(&self) -> Option<f64> {
        let total = self.total_records?;
        if self.records_per_minute <= 0.0 {
            return None;
        }
        Some(total.saturating_sub(self.position) as f64 / self.records_per_minute)
    }
}

/// Durable checkpoint storage.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load the checkpoint, or a fresh default when none exists.
    async fn load(&self) -> Result<Checkpoint, ImportError>;

    /// Atomically replace the stored checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ImportError>;

    /// Delete the checkpoint. Returns whether one existed.
    async fn clear(&self) -> Result<bool, ImportError>;

    /// Move a finished checkpoint aside so the run key starts fresh.
    async fn archive(&self) -> Result<(), ImportError>;

    /// Where the checkpoint lives, for messages.
    fn location(&self) -> String;
}

/// Where checkpoints are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// A JSON file per run key under the data directory.
    #[default]
    File,
    /// A row per run key in the target database.
    Database,
}

impl std::str::FromStr for CheckpointBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "database" | "db" => Ok(Self::Database),
            other => Err(format!(
                "unknown checkpoint backend '{other}' (expected file or database)"
            )),
        }
    }
}

fn archive_suffix() -> String {
    Utc::now().format("%Y%m%dT%H%M%S").to_string()
}

/// Checkpoint stored as a JSON file, replaced via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<run_key>.json`
    pub fn for_run(dir: &Path, run_key: &str) -> Self {
        Self::new(dir.join(format!("{run_key}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self) -> Result<Checkpoint, ImportError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map_err(|e| ImportError::CorruptCheckpoint {
            location: self.location(),
            message: e.to_string(),
        })
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ImportError> {
        use std::io::Write;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let content = serde_json::to_vec_pretty(checkpoint)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    async fn clear(&self) -> Result<bool, ImportError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn archive(&self) -> Result<(), ImportError> {
        if !self.path.exists() {
            return Ok(());
        }
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());
        let archived = self
            .path
            .with_file_name(format!("{stem}.{}.done.json", archive_suffix()));
        std::fs::rename(&self.path, &archived)?;
        tracing::info!("Archived checkpoint to {}", archived.display());
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Checkpoint stored as a row in the target database.
#[derive(Clone)]
pub struct DbProgressStore {
    repo: CheckpointRepository,
    run_key: String,
}

impl DbProgressStore {
    pub fn new(repo: CheckpointRepository, run_key: &str) -> Self {
        Self {
            repo,
            run_key: run_key.to_string(),
        }
    }
}

#[async_trait]
impl ProgressStore for DbProgressStore {
    async fn load(&self) -> Result<Checkpoint, ImportError> {
        match self.repo.load(&self.run_key).await? {
            None => Ok(Checkpoint::default()),
            Some(data) => serde_json::from_str(&data).map_err(|e| ImportError::CorruptCheckpoint {
                location: self.location(),
                message: e.to_string(),
            }),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ImportError> {
        let data = serde_json::to_string(checkpoint)?;
        self.repo.save(&self.run_key, &data).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<bool, ImportError> {
        Ok(self.repo.delete(&self.run_key).await?)
    }

    async fn archive(&self) -> Result<(), ImportError> {
        let archived = format!("{}@{}", self.run_key, archive_suffix());
        if self.repo.rename(&self.run_key, &archived).await? {
            tracing::info!("Archived checkpoint as {}", archived);
        }
        Ok(())
    }

    fn location(&self) -> String {
        format!("import_checkpoints[{}]", self.run_key)
    }
}
