// ⚙️ Configuration - JSON settings file + environment + CLI overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_DATABASE_PATH: &str = "LEDGER_DATABASE_PATH";
pub const ENV_ARTIFACT_DIR: &str = "LEDGER_ARTIFACT_DIR";

/// Knobs of a single ingestion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Rows per bulk create/update call
    pub batch_size: usize,

    /// Treat an empty normalized tax id as a row failure instead of a candidate
    pub reject_empty_tax_id: bool,

    /// How many leading rows are scanned for the header row
    pub header_search_rows: usize,

    /// Rows dropped right after the header (column numbering rows in the legacy report)
    pub skip_rows_after_header: usize,

    /// SQLite busy timeout
    pub busy_timeout_ms: u64,

    /// Hard deadline for one run; exceeding it rolls the run back
    pub run_timeout_secs: Option<u64>,

    /// Largest accepted artifact
    pub max_upload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            batch_size: 500,
            reject_empty_tax_id: true,
            header_search_rows: 20,
            skip_rows_after_header: 0,
            busy_timeout_ms: 5_000,
            run_timeout_secs: None,
            max_upload_bytes: 30 * 1024 * 1024,
        }
    }
}

impl IngestConfig {
    /// Batch size is never allowed to reach zero (chunks(0) panics)
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub ingest: IngestConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: PathBuf::from("counterparties.db"),
            artifact_dir: PathBuf::from("media"),
            ingest: IngestConfig::default(),
        }
    }
}

impl AppConfig {
    /// Apply `LEDGER_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(ENV_DATABASE_PATH) {
            if !path.trim().is_empty() {
                self.database_path = PathBuf::from(path);
            }
        }
        if let Ok(dir) = std::env::var(ENV_ARTIFACT_DIR) {
            if !dir.trim().is_empty() {
                self.artifact_dir = PathBuf::from(dir);
            }
        }
        self
    }
}

/// Loads configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Reading config file: {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Parsing config JSON in {}", path.display()))?;
    Ok(config)
}

/// Loads configuration from an optional path, falling back to defaults
pub fn load_optional_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(config_path) => load_config(config_path),
        None => Ok(AppConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"ingest": {"batch_size": 50}}"#).unwrap();

        assert_eq!(config.ingest.batch_size, 50);
        assert!(config.ingest.reject_empty_tax_id);
        assert_eq!(config.ingest.max_upload_bytes, 30 * 1024 * 1024);
        assert_eq!(config.database_path, PathBuf::from("counterparties.db"));
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let config = IngestConfig {
            batch_size: 0,
            ..IngestConfig::default()
        };
        assert_eq!(config.effective_batch_size(), 1);
    }

    #[test]
    fn test_missing_optional_config_is_default() {
        let config = load_optional_config(None).unwrap();
        assert_eq!(config, AppConfig::default());
    }
}
