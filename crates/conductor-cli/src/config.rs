//! `conductor.toml` loading.
//!
//! Every key has a default, and a missing file yields the default
//! configuration.

use anyhow::Context;
use conductor_checkpoint::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
use conductor_orchestrator::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Top-level `conductor.toml` contents.
#[derive(Debug, Deserialize, PartialEq)]
pub struct ConductorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            checkpoint: CheckpointConfig::default(),
            engine: EngineSection::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Checkpoint backend selection.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Memory,
}

/// Where and how checkpoints are kept.
#[derive(Debug, Deserialize, PartialEq)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Database file, relative to `data_dir` unless absolute.
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            path: default_checkpoint_path(),
        }
    }
}

/// Engine limits. Unset values fall back to [`EngineConfig::default`].
#[derive(Debug, Deserialize, PartialEq)]
pub struct EngineSection {
    /// Maximum steps per `run`/`resume` invocation.
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            recursion_limit: default_recursion_limit(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging setup applied before the engine starts.
#[derive(Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("checkpoints.db")
}
fn default_recursion_limit() -> usize {
    100
}
fn default_level() -> String {
    "info".to_string()
}

impl ConductorConfig {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    /// Parses configuration from TOML text.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Resolved path of the SQLite checkpoint database.
    pub fn checkpoint_path(&self) -> PathBuf {
        if self.checkpoint.path.is_absolute() {
            self.checkpoint.path.clone()
        } else {
            self.data_dir.join(&self.checkpoint.path)
        }
    }

    /// Engine configuration with defaults filled in.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            recursion_limit: self.engine.recursion_limit,
            ..EngineConfig::default()
        }
    }

    /// Opens the configured checkpoint backend.
    pub fn open_store(&self) -> anyhow::Result<Arc<dyn CheckpointStore>> {
        match self.checkpoint.backend {
            Backend::Sqlite => {
                let path = self.checkpoint_path();
                let store = SqliteCheckpointStore::open(&path).with_context(|| {
                    format!("Failed to open checkpoint database '{}'", path.display())
                })?;
                Ok(Arc::new(store))
            }
            Backend::Memory => {
                tracing::warn!("In-memory checkpoints do not outlive this process");
                Ok(Arc::new(InMemoryCheckpointStore::new()))
            }
        }
    }

    /// Installs the global tracing subscriber. `RUST_LOG` wins over the configured level.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.logging.level));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        match self.logging.format {
            LogFormat::Json => builder.json().init(),
            LogFormat::Pretty => builder.pretty().init(),
        }
    }
}
