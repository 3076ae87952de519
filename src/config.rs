//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILSUMMARY_CONFIG` (environment variable)
//! 2. `~/.config/mailsummary/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailsummary\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::summary::{BodyIndexer, SummaryOptions, WordIndex};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// How summaries are built and written.
    pub summary: SummaryConfig,
    /// Mbox store tuning.
    pub store: StoreConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override cache directory for summaries and logs.
    pub cache_dir: Option<PathBuf>,
}

/// Summary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Store MIME content trees in the summary.
    pub build_content: bool,
    /// Keep a uid hash index in memory.
    pub uid_index: bool,
    /// `fsync` summary files before renaming them into place.
    pub fsync: bool,
    /// Feed body text to an in-memory word index while building.
    pub index_bodies: bool,
}

/// Mbox store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of raw messages kept in the LRU cache.
    pub lru_cache_size: usize,
    /// Read buffer size in bytes (default: 1 MB).
    pub read_buffer_size: usize,
    /// Bytes of a message parsed for its summary (default: 256 MB). Longer
    /// messages are summarised from their first part only.
    pub max_message_size: usize,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            cache_dir: None,
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            build_content: true,
            uid_index: true,
            fsync: true,
            index_bodies: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lru_cache_size: 50,
            read_buffer_size: crate::parser::mbox::DEFAULT_READ_BUFFER_SIZE,
            max_message_size: crate::parser::mbox::MAX_MESSAGE_SIZE,
        }
    }
}

impl SummaryConfig {
    /// Options for a summary built with these settings. `index` receives
    /// body text when `index_bodies` is set.
    pub fn options(&self, index: Option<&Arc<WordIndex>>) -> SummaryOptions {
        let indexer = match index {
            Some(index) if self.index_bodies => Some(Arc::clone(index) as Arc<dyn BodyIndexer>),
            _ => None,
        };
        SummaryOptions {
            build_content: self.build_content,
            uid_index: self.uid_index,
            fsync: self.fsync,
            indexer,
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILSUMMARY_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailsummary").join("config.toml"))
}

/// Return the cache directory for fallback summaries and logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    default_cache_dir()
}

/// `mailsummary` under the user cache directory.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("mailsummary")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mailsummary.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert!(cfg.summary.build_content);
        assert!(cfg.summary.uid_index);
        assert_eq!(cfg.store.lru_cache_size, 50);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.general.log_level, cfg.general.log_level);
        assert_eq!(parsed.summary.fsync, cfg.summary.fsync);
        assert_eq!(parsed.store.read_buffer_size, cfg.store.read_buffer_size);
        assert_eq!(parsed.store.max_message_size, cfg.store.max_message_size);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[summary]
fsync = false
index_bodies = true

[store]
lru_cache_size = 8
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert!(!cfg.summary.fsync);
        assert_eq!(cfg.store.lru_cache_size, 8);
        // Other fields use defaults
        assert!(cfg.summary.uid_index);
        assert_eq!(cfg.general.log_level, "warn");

        let index = Arc::new(WordIndex::new());
        let options = cfg.summary.options(Some(&index));
        assert!(!options.fsync);
        assert!(options.build_content);
        assert!(options.indexer.is_some());
        assert!(Config::default().summary.options(Some(&index)).indexer.is_none());
    }

    #[test]
    fn test_cache_dir_override() {
        let mut cfg = Config::default();
        cfg.general.cache_dir = Some(PathBuf::from("/tmp/summaries"));
        assert_eq!(cache_dir(&cfg), PathBuf::from("/tmp/summaries"));
        assert_eq!(log_file_path(&cfg), PathBuf::from("/tmp/summaries/mailsummary.log"));
    }
}
