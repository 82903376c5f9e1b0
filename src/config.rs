//! Configuration management for listing-import using the prefer crate.
//!
//! Precedence, lowest to highest: built-in defaults, the config file
//! (explicit `--config`, one next to `--data`, or discovered by prefer),
//! environment variables, then command-line flags.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enrich::EnrichConfig;
use crate::import::{
    CheckpointBackend, ColumnMapping, DbProgressStore, FileProgressStore, NormalizerDefaults,
    ProgressStore, RecordNormalizer, RunnerConfig, ScoringConfig, StateLookup, StopSignal,
};
use crate::repository::DbContext;

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "listings.db";

/// Default run key for checkpoints.
pub const DEFAULT_RUN_KEY: &str = "listings";

const CHECKPOINTS_SUBDIR: &str = "checkpoints";
const CACHE_SUBDIR: &str = "cache";
const STOP_FILENAME: &str = "STOP";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    pub database_filename: String,
    /// Overrides `data_dir`/`database_filename` when set.
    pub database_url: Option<String>,
    /// Where file-backed checkpoints live.
    pub checkpoint_dir: PathBuf,
    /// Enrichment response cache root.
    pub cache_dir: PathBuf,
    /// Sentinel file that requests a stop at the next batch boundary.
    pub stop_file: PathBuf,
    pub run_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("listing-import");
        Self::with_data_dir(data_dir)
    }
}

impl Settings {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            checkpoint_dir: data_dir.join(CHECKPOINTS_SUBDIR),
            cache_dir: data_dir.join(CACHE_SUBDIR),
            stop_file: data_dir.join(STOP_FILENAME),
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            database_url: None,
            run_key: DEFAULT_RUN_KEY.to_string(),
        }
    }

    fn set_data_dir(&mut self, data_dir: PathBuf) {
        let run_key = std::mem::take(&mut self.run_key);
        let database_filename = std::mem::take(&mut self.database_filename);
        let database_url = self.database_url.take();
        *self = Self {
            run_key,
            database_filename,
            database_url,
            ..Self::with_data_dir(data_dir)
        };
    }

    /// Database URL, built from the data directory unless set explicitly.
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite:{}", self.database_path().display()),
        }
    }

    /// Path of the SQLite file.
    pub fn database_path(&self) -> PathBuf {
        match &self.database_url {
            Some(url) => PathBuf::from(
                url.strip_prefix("sqlite://")
                    .or_else(|| url.strip_prefix("sqlite:"))
                    .unwrap_or(url),
            ),
            None => self.data_dir.join(&self.database_filename),
        }
    }

    pub fn database_exists(&self) -> bool {
        self.database_path().exists()
    }

    /// Single-instance lock file, next to the database.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.database_path().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Ensure the data and checkpoint directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for (dir, label) in [
            (&self.data_dir, "data"),
            (&self.checkpoint_dir, "checkpoint"),
        ] {
            fs::create_dir_all(dir).map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("Failed to create {} directory '{}': {}", label, dir.display(), e),
                )
            })?;
        }
        if let Some(parent) = self.database_path().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    pub fn create_db_context(&self) -> DbContext {
        DbContext::from_url(&self.database_url())
    }

    /// Checkpoint store for `run_key` on the chosen backend.
    pub fn progress_store(
        &self,
        backend: CheckpointBackend,
        db: &DbContext,
        run_key: &str,
    ) -> Box<dyn ProgressStore> {
        match backend {
            CheckpointBackend::File => {
                Box::new(FileProgressStore::for_run(&self.checkpoint_dir, run_key))
            }
            CheckpointBackend::Database => {
                Box::new(DbProgressStore::new(db.checkpoints(), run_key))
            }
        }
    }

    /// Stop signal that also watches the stop file.
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal::new(Some(self.stop_file.clone()))
    }

    /// Apply `DATABASE_URL` and `LISTING_IMPORT_DATA_DIR` overrides.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("LISTING_IMPORT_DATA_DIR").filter(|s| !s.is_empty()) {
            tracing::debug!("Using LISTING_IMPORT_DATA_DIR from environment: {}", dir);
            self.set_data_dir(PathBuf::from(shellexpand::tilde(&dir).as_ref()));
        }
        if let Some(url) = var("DATABASE_URL").filter(|s| !s.is_empty()) {
            tracing::debug!("Using DATABASE_URL from environment: {}", url);
            self.database_url = Some(url);
        }
    }
}

/// Config file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename (relative to the data directory) or URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_file: Option<String>,
    pub import: RunnerConfig,
    pub columns: ColumnMapping,
    pub defaults: NormalizerDefaults,
    pub scoring: ScoringConfig,
    pub enrich: EnrichConfig,
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover a config file with prefer, falling back to defaults.
    pub async fn load() -> Result<Self, ConfigError> {
        match prefer::load("listing-import").await {
            Ok(found) => match found.source_path() {
                Some(path) => Self::load_from_path(path).await,
                None => Ok(Self::default()),
            },
            Err(_) => Ok(Self::default()),
        }
    }

    /// Parse a config file, choosing the format by extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let parse_err = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        let mut config: Config = match ext {
            "json" => serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&contents).map_err(|e| parse_err(e.to_string()))?
            }
            _ => toml::from_str(&contents).map_err(|e| parse_err(e.to_string()))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Directory containing the config file.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path relative to `base_dir`, expanding `~`.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.set_data_dir(self.resolve_path(data_dir, base_dir));
        }
        if let Some(ref database) = self.database {
            if database.starts_with("sqlite:") {
                settings.database_url = Some(database.clone());
            } else {
                settings.database_filename = database.clone();
            }
        }
        if let Some(ref run_key) = self.run_key {
            settings.run_key = run_key.clone();
        }
        if let Some(ref stop_file) = self.stop_file {
            settings.stop_file = self.resolve_path(stop_file, base_dir);
        }
    }

    /// Normalizer configured from the `defaults` and `scoring` sections.
    pub fn normalizer(&self) -> RecordNormalizer {
        RecordNormalizer::new(StateLookup::us(), self.defaults.clone(), self.scoring.clone())
    }
}

/// How to find the config and data directory.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file.
    pub config_path: Option<PathBuf>,
    /// Data directory or database file.
    pub data: Option<PathBuf>,
}

fn find_config_next_to_db(data_dir: &Path) -> Option<PathBuf> {
    let extensions = ["toml", "yaml", "yml", "json"];
    let basenames = ["listing-import", "config"];

    for basename in basenames {
        for ext in extensions {
            let path = data_dir.join(format!("{basename}.{ext}"));
            if path.exists() {
                return Some(path);
            }
        }
    }
    None
}

fn is_db_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "db" || ext == "sqlite" || ext == "sqlite3")
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

/// Load settings and config. Returns (Settings, Config).
pub async fn load_settings_with_options(
    options: LoadOptions,
) -> Result<(Settings, Config), ConfigError> {
    let data = options.data.as_deref().map(absolute);
    let data_dir = data.as_ref().map(|d| {
        if is_db_file(d) {
            d.parent().unwrap_or(Path::new(".")).to_path_buf()
        } else {
            d.clone()
        }
    });

    let config = if let Some(ref path) = options.config_path {
        Config::load_from_path(path).await?
    } else if let Some(path) = data_dir.as_deref().and_then(find_config_next_to_db) {
        tracing::debug!("Found config next to data dir: {}", path.display());
        Config::load_from_path(&path).await?
    } else {
        Config::load().await?
    };

    let mut settings = Settings::default();
    let base_dir = config
        .base_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    config.apply_to_settings(&mut settings, &base_dir);
    settings.apply_env(|key| std::env::var(key).ok());

    if let Some(dir) = data_dir {
        settings.set_data_dir(dir);
    }
    if let Some(ref path) = data {
        if is_db_file(path) {
            settings.database_url = None;
            settings.database_filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_DATABASE_FILENAME)
                .to_string();
        }
    }

    Ok((settings, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{IdempotencyKey, PartitionMode};
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
data_dir = "./data"
run_key = "laundromats-2024"

[import]
batch_size = 250
partition = "state"
idempotency_key = "natural"
checkpoint = "database"

[columns]
name = ["Business"]

[scoring]
premium_threshold = 60

[enrich]
concurrency = 3
"#;

    #[tokio::test]
    async fn test_load_toml_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listing-import.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.import.batch_size, 250);
        assert_eq!(config.import.pause_ms, 250);
        assert_eq!(config.import.partition, PartitionMode::State);
        assert_eq!(config.import.idempotency_key, IdempotencyKey::Natural);
        assert_eq!(config.import.checkpoint, CheckpointBackend::Database);
        assert_eq!(config.columns.name, vec!["Business".to_string()]);
        assert!(!config.columns.city.is_empty());
        assert_eq!(config.scoring.premium_threshold, 60);
        assert_eq!(config.scoring.featured_threshold, 85);
        assert_eq!(config.enrich.concurrency, 3);
        assert_eq!(config.base_dir().as_deref(), Some(dir.path()));

        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings, dir.path());
        assert_eq!(settings.data_dir, dir.path().join("./data"));
        assert_eq!(settings.run_key, "laundromats-2024");
        assert_eq!(settings.checkpoint_dir, settings.data_dir.join("checkpoints"));
        assert_eq!(settings.stop_file, settings.data_dir.join("STOP"));
    }

    #[tokio::test]
    async fn test_load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("config.yaml");
        std::fs::write(&yaml, "import:\n  batch_size: 10\n").unwrap();
        assert_eq!(Config::load_from_path(&yaml).await.unwrap().import.batch_size, 10);

        let json = dir.path().join("config.json");
        std::fs::write(&json, r#"{"enrich": {"max_retries": 1}}"#).unwrap();
        assert_eq!(Config::load_from_path(&json).await.unwrap().enrich.max_retries, 1);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[import\n").unwrap();
        assert!(matches!(
            Config::load_from_path(&bad).await,
            Err(ConfigError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_config_next_to_data_dir_and_db_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("listing-import.toml"), "run_key = \"found\"\n").unwrap();

        let (settings, config) = load_settings_with_options(LoadOptions {
            config_path: None,
            data: Some(dir.path().join("custom.db")),
        })
        .await
        .unwrap();
        assert!(config.source_path.is_some());
        assert_eq!(settings.run_key, "found");
        assert_eq!(settings.data_dir, dir.path());
        if std::env::var("DATABASE_URL").is_err() {
            assert_eq!(settings.database_path(), dir.path().join("custom.db"));
        }
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("LISTING_IMPORT_DATA_DIR", "/srv/listings"),
            ("DATABASE_URL", "sqlite:/var/db/prod.db"),
        ]);
        let mut settings = Settings::default();
        settings.run_key = "kept".to_string();
        settings.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.data_dir, PathBuf::from("/srv/listings"));
        assert_eq!(settings.checkpoint_dir, PathBuf::from("/srv/listings/checkpoints"));
        assert_eq!(settings.run_key, "kept");
        assert_eq!(settings.database_url(), "sqlite:/var/db/prod.db");
        assert_eq!(settings.database_path(), PathBuf::from("/var/db/prod.db"));
        assert_eq!(settings.lock_path(), PathBuf::from("/var/db/prod.db.lock"));
    }

    #[test]
    fn test_default_database_location() {
        let settings = Settings::with_data_dir(PathBuf::from("/data"));
        assert_eq!(settings.database_url(), "sqlite:/data/listings.db");
        assert_eq!(settings.lock_path(), PathBuf::from("/data/listings.db.lock"));
    }
}
