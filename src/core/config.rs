use std::path::{Path, PathBuf};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::storage::kv_store::SyncMode;
use crate::storage::merge_policy::MergePolicyKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,

    // Partition lifecycle
    pub partition_persist_min_doc_count: u64,   // seal the mem partition at this size
    pub partition_merge_min_doc_count: u64,     // merge candidate floor
    pub partition_merge_max_doc_count: u64,     // upper bound for a merged partition
    pub merge_policy: MergePolicyKind,
    pub maintenance_interval_ms: u64,

    // Storage
    pub deletion_bitmap_bits: u64,              // grows on demand
    pub kv_sync_mode: SyncMode,

    // Logging
    pub log_path: Option<PathBuf>,
    pub log_level: String,

    // Carried for the request layer, unused here
    pub bind_ip: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),

            partition_persist_min_doc_count: 100_000,
            partition_merge_min_doc_count: 100_000,
            partition_merge_max_doc_count: 5_000_000,
            merge_policy: MergePolicyKind::Floor,
            maintenance_interval_ms: 5000,

            deletion_bitmap_bits: 1 << 20,
            kv_sync_mode: SyncMode::Batch,

            log_path: None,
            log_level: "info".to_string(),

            bind_ip: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    /// Read a JSON config file; keys left out keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_persist_min_doc_count == 0 {
            return Err(Error::invalid_argument("partition_persist_min_doc_count must be positive"));
        }
        if self.partition_merge_min_doc_count > self.partition_merge_max_doc_count {
            return Err(Error::invalid_argument(
                "partition_merge_min_doc_count exceeds partition_merge_max_doc_count",
            ));
        }
        self.level_filter().map(|_| ())
    }

    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| Error::invalid_argument(format!("unknown log level '{}'", self.log_level)))
    }

    /// Cap the `log` facade at the configured level. Installing a logger is left
    /// to the embedding application.
    pub fn apply_log_level(&self) -> Result<()> {
        log::set_max_level(self.level_filter()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"partition_persist_min_doc_count": 3, "merge_policy": "tiered", "log_level": "debug"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.partition_persist_min_doc_count, 3);
        assert_eq!(config.merge_policy, MergePolicyKind::Tiered);
        assert_eq!(config.partition_merge_min_doc_count, 100_000);
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Debug);
    }

    #[test]
    fn rejects_unknown_level() {
        let config = Config {
            log_level: "loud".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
