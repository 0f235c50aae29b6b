// Table Metadata Client
//
// Owns the table's metadata folder: the properties file written at
// initialization, the timeline store and the marker root.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{TableError, TableType};
use crate::config::WriteConfig;
use crate::fs::naming::{META_FOLDER_NAME, TEMP_FOLDER_NAME};
use crate::fs::FileSystem;
use crate::invariants::InvariantEngine;
use crate::io::BaseFileFormat;
use crate::markers::MarkerStore;
use crate::replay::replay_timeline;
use crate::timeline::{ActiveTimeline, FsTimelineStore, TimelineStore};

pub const TABLE_PROPERTIES_FILE: &str = "table.json";

/// Layout version written by this crate. Version 0 tables predate
/// markers.
pub const CURRENT_TABLE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    pub name: String,
    pub table_type: TableType,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub base_file_format: BaseFileFormat,
    pub record_key_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_path_field: Option<String>,
}

impl TableProperties {
    pub fn from_config(config: &WriteConfig) -> Self {
        Self {
            name: config.table_name.clone(),
            table_type: config.table_type,
            version: CURRENT_TABLE_VERSION,
            base_file_format: config.base_file_format,
            record_key_field: config.schema.record_key_field.clone(),
            partition_path_field: config.schema.partition_path_field.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableMetaClient {
    fs: Arc<dyn FileSystem>,
    base_path: PathBuf,
    meta_path: PathBuf,
    properties: TableProperties,
}

impl TableMetaClient {
    /// Create the metadata folder and properties file of a new table.
    pub fn init(
        fs: Arc<dyn FileSystem>,
        base_path: impl Into<PathBuf>,
        properties: TableProperties,
    ) -> Result<Self, TableError> {
        let base_path = base_path.into();
        let meta_path = base_path.join(META_FOLDER_NAME);
        let props_path = meta_path.join(TABLE_PROPERTIES_FILE);
        if fs.exists(&props_path) {
            return Err(TableError::AlreadyExists(base_path.display().to_string()));
        }

        fs.mkdirs(&meta_path.join(TEMP_FOLDER_NAME))
            .map_err(|e| TableError::io(&meta_path, e))?;
        let client = Self {
            fs,
            base_path,
            meta_path,
            properties,
        };
        client.write_properties()?;
        info!(
            table = %client.properties.name,
            table_type = ?client.properties.table_type,
            base_path = %client.base_path.display(),
            "initialized table"
        );
        Ok(client)
    }

    pub fn load(fs: Arc<dyn FileSystem>, base_path: impl Into<PathBuf>) -> Result<Self, TableError> {
        let base_path = base_path.into();
        let meta_path = base_path.join(META_FOLDER_NAME);
        let props_path = meta_path.join(TABLE_PROPERTIES_FILE);

        let bytes = match fs.read(&props_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TableError::NotInitialized(base_path.display().to_string()))
            }
            Err(e) => return Err(TableError::io(&props_path, e)),
        };
        let properties: TableProperties = serde_json::from_slice(&bytes)?;
        if properties.version > CURRENT_TABLE_VERSION {
            return Err(TableError::UnsupportedVersion(properties.version));
        }

        Ok(Self {
            fs,
            base_path,
            meta_path,
            properties,
        })
    }

    /// Load the table, initializing it from `config` if it does not exist.
    pub fn load_or_init(fs: Arc<dyn FileSystem>, config: &WriteConfig) -> Result<Self, TableError> {
        match Self::load(Arc::clone(&fs), &config.base_path) {
            Err(TableError::NotInitialized(_)) => {
                Self::init(fs, &config.base_path, TableProperties::from_config(config))
            }
            other => other,
        }
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub fn table_type(&self) -> TableType {
        self.properties.table_type
    }

    pub fn version(&self) -> u32 {
        self.properties.version
    }

    pub fn timeline_store(&self) -> Arc<dyn TimelineStore> {
        Arc::new(FsTimelineStore::new(Arc::clone(&self.fs), &self.meta_path))
    }

    /// Replay the timeline from storage.
    pub fn reload_active_timeline(
        &self,
        invariants: Arc<InvariantEngine>,
    ) -> Result<ActiveTimeline, TableError> {
        Ok(replay_timeline(self.timeline_store(), invariants)?)
    }

    pub fn marker_store(&self, instant_time: &str) -> MarkerStore {
        MarkerStore::new(Arc::clone(&self.fs), &self.base_path, instant_time)
    }

    pub fn temp_path(&self) -> PathBuf {
        self.meta_path.join(TEMP_FOLDER_NAME)
    }

    /// Persist a new layout version.
    pub fn set_version(&mut self, version: u32) -> Result<(), TableError> {
        self.properties.version = version;
        self.write_properties()
    }

    fn write_properties(&self) -> Result<(), TableError> {
        let target = self.meta_path.join(TABLE_PROPERTIES_FILE);
        let staging = self.meta_path.join(format!(".{TABLE_PROPERTIES_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(&self.properties)?;

        let mut out = self
            .fs
            .create(&staging, true)
            .map_err(|e| TableError::io(&staging, e))?;
        out.write_all(&bytes)
            .and_then(|_| out.flush())
            .map_err(|e| TableError::io(&staging, e))?;
        drop(out);

        self.fs
            .rename(&staging, &target)
            .map_err(|e| TableError::io(&target, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::schema::{Field, FieldType, RecordSchema};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> WriteConfig {
        let schema = RecordSchema::new(vec![Field::new("id", FieldType::Utf8, false)], "id", None);
        WriteConfig::new(dir.path(), "trips", schema)
    }

    #[test]
    fn init_then_load() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);

        let created = TableMetaClient::load_or_init(Arc::clone(&fs), &config(&dir)).unwrap();
        assert_eq!(created.version(), CURRENT_TABLE_VERSION);
        assert!(fs.exists(&created.temp_path()));

        let loaded = TableMetaClient::load(fs, dir.path()).unwrap();
        assert_eq!(loaded.properties(), created.properties());
        assert_eq!(loaded.table_type(), TableType::CopyOnWrite);
    }

    #[test]
    fn load_of_missing_table_fails() {
        let dir = TempDir::new().unwrap();
        let err = TableMetaClient::load(Arc::new(LocalFileSystem), dir.path()).unwrap_err();
        assert!(matches!(err, TableError::NotInitialized(_)));
    }

    #[test]
    fn double_init_is_rejected() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let props = TableProperties::from_config(&config(&dir));

        TableMetaClient::init(Arc::clone(&fs), dir.path(), props.clone()).unwrap();
        let err = TableMetaClient::init(fs, dir.path(), props).unwrap_err();
        assert!(matches!(err, TableError::AlreadyExists(_)));
    }

    #[test]
    fn version_change_is_persisted() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let mut client = TableMetaClient::load_or_init(Arc::clone(&fs), &config(&dir)).unwrap();

        client.set_version(0).unwrap();
        assert_eq!(TableMetaClient::load(fs, dir.path()).unwrap().version(), 0);
    }
}
