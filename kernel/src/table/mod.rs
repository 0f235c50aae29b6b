// Table Layer
//
// Everything between a write client and the files of one table: table
// properties, the file-system view of committed file slices, the record
// index, the write handles and the table services (compaction, cleaning,
// archival, upgrade/downgrade).

pub mod archive;
pub mod clean;
pub mod compact;
pub mod file_group;
pub mod handle;
pub mod index;
pub mod meta;
pub mod upgrade;
pub mod view;

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::executor::ExecutorError;
use crate::io::log::LogFormatError;
use crate::io::WriterError;
use crate::markers::MarkerError;
use crate::record::{Record, RecordKey, RecordLocation};
use crate::replay::ReplayError;
use crate::rollback::RollbackError;
use crate::schema::{RecordSchema, SchemaError};
use crate::timeline::{Action, ActiveTimeline, TimelineError};

pub use file_group::FileGroupTable;
pub use index::InMemoryHashIndex;
pub use meta::{TableMetaClient, TableProperties};
pub use view::{FileGroup, FileSlice, FileSystemView};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("table at {0} is not initialized")]
    NotInitialized(String),

    #[error("table at {0} already exists")]
    AlreadyExists(String),

    #[error("unsupported table version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid compaction plan: {0}")]
    InvalidPlan(String),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Marker(#[from] MarkerError),

    #[error(transparent)]
    LogFormat(#[from] LogFormatError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TableError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        TableError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Physical layout of updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableType {
    /// Updates rewrite the file group into a new base file.
    #[default]
    CopyOnWrite,
    /// Updates append to the file group's log; compaction folds them in.
    MergeOnRead,
}

impl TableType {
    /// Action recorded for regular writes.
    pub fn commit_action(&self) -> Action {
        match self {
            TableType::CopyOnWrite => Action::Commit,
            TableType::MergeOnRead => Action::DeltaCommit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperationType {
    Insert,
    InsertPrepped,
    Upsert,
    UpsertPrepped,
    BulkInsert,
    BulkInsertPrepped,
    Delete,
    Compact,
}

impl WriteOperationType {
    /// Whether the caller already de-duplicated and tagged the records.
    pub fn is_prepped(&self) -> bool {
        matches!(
            self,
            WriteOperationType::InsertPrepped
                | WriteOperationType::UpsertPrepped
                | WriteOperationType::BulkInsertPrepped
        )
    }

    /// Operations whose records are checked against the full table
    /// schema compatibility rules. Deletes only carry keys.
    pub fn writes_records(&self) -> bool {
        !matches!(self, WriteOperationType::Delete | WriteOperationType::Compact)
    }
}

impl fmt::Display for WriteOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteOperationType::Insert => "insert",
            WriteOperationType::InsertPrepped => "insert_prepped",
            WriteOperationType::Upsert => "upsert",
            WriteOperationType::UpsertPrepped => "upsert_prepped",
            WriteOperationType::BulkInsert => "bulk_insert",
            WriteOperationType::BulkInsertPrepped => "bulk_insert_prepped",
            WriteOperationType::Delete => "delete",
            WriteOperationType::Compact => "compact",
        };
        f.write_str(name)
    }
}

/// Input of one write operation.
#[derive(Debug, Clone)]
pub enum WriteOperation {
    Records {
        operation: WriteOperationType,
        records: Vec<Record>,
    },
    Delete(Vec<RecordKey>),
}

impl WriteOperation {
    pub fn operation_type(&self) -> WriteOperationType {
        match self {
            WriteOperation::Records { operation, .. } => *operation,
            WriteOperation::Delete(_) => WriteOperationType::Delete,
        }
    }
}

/// Per-file outcome of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStat {
    pub partition_path: String,
    pub file_id: String,
    /// Path relative to the table base path.
    pub path: String,
    /// Instant of the version this write replaced or appended to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_commit: Option<String>,
    pub num_writes: u64,
    pub num_inserts: u64,
    pub num_update_writes: u64,
    pub num_deletes: u64,
    pub total_write_bytes: u64,
    pub total_write_errors: u64,
}

/// Result of writing one file group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteStatus {
    pub stat: WriteStat,
    /// Keys that could not be written and why.
    pub failed_records: Vec<(RecordKey, String)>,
    /// Where successfully written records now live.
    pub written: Vec<(RecordKey, RecordLocation)>,
    pub deleted: Vec<RecordKey>,
}

impl WriteStatus {
    pub fn has_errors(&self) -> bool {
        !self.failed_records.is_empty()
    }
}

/// Outcome of one table operation.
#[derive(Debug, Clone, Default)]
pub struct WriteMetadata {
    pub statuses: Vec<WriteStatus>,
    pub index_lookup_ms: u64,
}

/// Details stored with a completed commit, delta commit or compaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub operation_type: Option<WriteOperationType>,
    pub partition_to_write_stats: BTreeMap<String, Vec<WriteStat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<RecordSchema>,
    #[serde(default)]
    pub extra_metadata: BTreeMap<String, String>,
}

impl CommitMetadata {
    /// Groups write stats by partition. `operation_type` is `None` when the
    /// committing client never saw the write, as after a restart.
    pub fn new(
        operation_type: Option<WriteOperationType>,
        statuses: &[WriteStatus],
        schema: Option<RecordSchema>,
    ) -> Self {
        let mut partition_to_write_stats: BTreeMap<String, Vec<WriteStat>> = BTreeMap::new();
        for status in statuses {
            partition_to_write_stats
                .entry(status.stat.partition_path.clone())
                .or_default()
                .push(status.stat.clone());
        }
        Self {
            operation_type,
            partition_to_write_stats,
            schema,
            extra_metadata: BTreeMap::new(),
        }
    }

    pub fn total_records_written(&self) -> u64 {
        self.write_stats().map(|s| s.num_writes).sum()
    }

    pub fn write_stats(&self) -> impl Iterator<Item = &WriteStat> {
        self.partition_to_write_stats.values().flatten()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TableError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TableError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The table operation a write client delegates to.
pub trait TableOperations: Send + Sync {
    fn table_type(&self) -> TableType;

    /// Write the operation's records under `instant_time`. The instant must
    /// already be INFLIGHT; nothing is committed.
    fn execute(
        &self,
        timeline: &ActiveTimeline,
        instant_time: &str,
        operation: WriteOperation,
    ) -> Result<WriteMetadata, TableError>;
}

/// Schema recorded by the latest completed commit that carries one.
pub fn last_commit_schema(timeline: &ActiveTimeline) -> Result<Option<RecordSchema>, TableError> {
    for instant in timeline.completed_commits().collect::<Vec<_>>().into_iter().rev() {
        let Some(details) = timeline.read_details(instant)? else {
            continue;
        };
        if let Some(schema) = CommitMetadata::from_bytes(&details)?.schema {
            return Ok(Some(schema));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_metadata_groups_stats_by_partition() {
        let status = |partition: &str, writes: u64| WriteStatus {
            stat: WriteStat {
                partition_path: partition.into(),
                num_writes: writes,
                ..Default::default()
            },
            ..Default::default()
        };

        let metadata = CommitMetadata::new(
            Some(WriteOperationType::Upsert),
            &[status("a", 2), status("b", 3), status("a", 1)],
            None,
        );

        assert_eq!(metadata.partition_to_write_stats["a"].len(), 2);
        assert_eq!(metadata.total_records_written(), 6);
        let decoded = CommitMetadata::from_bytes(&metadata.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn table_type_selects_commit_action() {
        assert_eq!(TableType::CopyOnWrite.commit_action(), Action::Commit);
        assert_eq!(TableType::MergeOnRead.commit_action(), Action::DeltaCommit);
    }
}
