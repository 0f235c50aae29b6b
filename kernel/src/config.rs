// Write Configuration
//
// Everything a write client consumes, loaded from JSON. Every section
// falls back to built-in defaults; `validate` rejects combinations the
// write path cannot honour.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bloom::{BloomFilterConfig, BloomFilterType};
use crate::io::{BaseFileFormat, HFileConfig, ParquetConfig, MB};
use crate::schema::{RecordSchema, SchemaError};
use crate::table::TableType;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub parallelism: usize,
    /// Marker-based rollback when true, listing-based otherwise.
    pub use_markers: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            parallelism: 100,
            use_markers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanConfig {
    pub auto: bool,
    /// Run the cleaner in the background while the write executes.
    pub async_clean: bool,
    pub retained_file_versions: usize,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            auto: true,
            async_clean: false,
            retained_file_versions: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub inline: bool,
    pub max_delta_commits: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            inline: false,
            max_delta_commits: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub min_commits_to_keep: usize,
    pub max_commits_to_keep: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            min_commits_to_keep: 20,
            max_commits_to_keep: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// A new log version is started once the current one reaches this size.
    pub max_file_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * MB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineServerConfig {
    pub enabled: bool,
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
}

impl Default for TimelineServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

/// Write client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    pub base_path: PathBuf,
    pub table_name: String,
    pub table_type: TableType,
    pub base_file_format: BaseFileFormat,
    pub schema: RecordSchema,
    /// Commit at the end of each write call.
    pub auto_commit: bool,
    pub assume_date_partitioning: bool,
    pub write_parallelism: usize,
    pub markers_delete_parallelism: usize,
    /// Records per new file group on insert.
    pub insert_split_size: usize,
    pub rollback: RollbackConfig,
    pub clean: CleanConfig,
    pub compaction: CompactionConfig,
    pub archive: ArchiveConfig,
    pub bloom: BloomFilterConfig,
    pub parquet: ParquetConfig,
    pub hfile: HFileConfig,
    pub log: LogConfig,
    pub timeline_server: TimelineServerConfig,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::new(),
            table_name: String::new(),
            table_type: TableType::CopyOnWrite,
            base_file_format: BaseFileFormat::Parquet,
            schema: RecordSchema::default(),
            auto_commit: true,
            assume_date_partitioning: false,
            write_parallelism: 4,
            markers_delete_parallelism: 100,
            insert_split_size: 500_000,
            rollback: RollbackConfig::default(),
            clean: CleanConfig::default(),
            compaction: CompactionConfig::default(),
            archive: ArchiveConfig::default(),
            bloom: BloomFilterConfig::default(),
            parquet: ParquetConfig::default(),
            hfile: HFileConfig::default(),
            log: LogConfig::default(),
            timeline_server: TimelineServerConfig::default(),
        }
    }
}

impl WriteConfig {
    pub fn new(base_path: impl Into<PathBuf>, table_name: &str, schema: RecordSchema) -> Self {
        Self {
            base_path: base_path.into(),
            table_name: table_name.to_string(),
            schema,
            ..Default::default()
        }
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: WriteConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.base_path.as_os_str().is_empty() {
            return invalid("base_path must be set");
        }
        if self.table_name.is_empty() {
            return invalid("table_name must be set");
        }
        if self.write_parallelism == 0
            || self.markers_delete_parallelism == 0
            || self.rollback.parallelism == 0
        {
            return invalid("parallelism must be at least 1");
        }
        if self.insert_split_size == 0 {
            return invalid("insert_split_size must be at least 1");
        }
        if self.archive.min_commits_to_keep == 0
            || self.archive.min_commits_to_keep > self.archive.max_commits_to_keep
        {
            return invalid("archive bounds must satisfy 0 < min_commits_to_keep <= max_commits_to_keep");
        }
        if self.clean.retained_file_versions == 0 {
            return invalid("retained_file_versions must be at least 1");
        }
        if !(self.bloom.fpp > 0.0 && self.bloom.fpp < 1.0) {
            return invalid("bloom fpp must be in (0, 1)");
        }
        if self.bloom.num_entries == 0 {
            return invalid("bloom num_entries must be at least 1");
        }
        if self.bloom.filter_type == BloomFilterType::Dynamic
            && self.bloom.dynamic_max_entries < self.bloom.num_entries
        {
            return invalid("bloom dynamic_max_entries must be >= num_entries");
        }
        if self.compaction.inline && self.compaction.max_delta_commits == 0 {
            return invalid("max_delta_commits must be at least 1");
        }

        self.schema.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![Field::new("id", FieldType::Utf8, false)], "id", None)
    }

    #[test]
    fn sections_default_when_absent() {
        let config = WriteConfig::from_json(
            r#"{
                "base_path": "/tmp/t",
                "table_name": "t",
                "schema": {"fields": [{"name": "id", "type": "utf8"}], "record_key_field": "id"},
                "rollback": {"parallelism": 8}
            }"#,
        )
        .unwrap();

        assert_eq!(config.rollback.parallelism, 8);
        assert!(config.rollback.use_markers);
        assert_eq!(config.archive, ArchiveConfig::default());
        assert_eq!(config.table_type, TableType::CopyOnWrite);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let mut config = WriteConfig::new("/tmp/t", "t", schema());
        config.rollback.parallelism = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn inverted_archive_bounds_are_rejected() {
        let mut config = WriteConfig::new("/tmp/t", "t", schema());
        config.archive.min_commits_to_keep = 10;
        config.archive.max_commits_to_keep = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn fpp_must_be_a_probability() {
        let mut config = WriteConfig::new("/tmp/t", "t", schema());
        config.bloom.fpp = 1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn schema_is_validated() {
        let config = WriteConfig::new("/tmp/t", "t", RecordSchema::default());
        assert!(matches!(config.validate(), Err(ConfigError::Schema(SchemaError::Empty))));
    }
}
