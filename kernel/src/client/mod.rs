// Write Client
//
// Drives one table through begin -> write -> commit -> post-commit:
//
// 1. upgrade/downgrade the table layout when its version is stale
// 2. roll back writes a previous session left pending
// 3. move the instant to INFLIGHT, check the schema, start async cleaning
// 4. delegate the write to the table operation
// 5. publish the COMPLETED instant with its commit metadata
// 6. drop markers, run inline compaction, archive and clean
//
// A failure in 4 leaves the instant INFLIGHT for the next rollback pass.

pub mod async_clean;
pub mod metrics;
pub mod timeline_server;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as Clock};

use tracing::{info, warn};

use crate::config::{ConfigError, WriteConfig};
use crate::executor::ParallelExecutor;
use crate::fs::FileSystem;
use crate::invariants::InvariantEngine;
use crate::record::{Record, RecordKey};
use crate::rollback::{RollbackCoordinator, RollbackError, RollbackStats};
use crate::schema::SchemaError;
use crate::table::archive::archive_if_required;
use crate::table::clean::{CleanStats, Cleaner};
use crate::table::compact::{self, CompactionPlan};
use crate::table::meta::CURRENT_TABLE_VERSION;
use crate::table::{
    last_commit_schema, upgrade, CommitMetadata, FileGroupTable, InMemoryHashIndex, TableError,
    TableMetaClient, TableOperations, TableType, WriteOperation, WriteOperationType, WriteStatus,
};
use crate::timeline::{
    new_instant_time, parse_instant_time, Action, ActiveTimeline, Instant, InstantState,
    TimelineError,
};

pub use async_clean::AsyncCleanerService;
pub use metrics::{CommitMetric, WriteMetrics, WriteMetricsSnapshot};
pub use timeline_server::EmbeddedTimelineServer;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to commit instant {instant} on table {base_path}: {source}")]
    Commit {
        instant: String,
        base_path: String,
        #[source]
        source: TableError,
    },

    #[error("`{instant}` on table {base_path} is not a valid instant time")]
    InvalidInstantTime { instant: String, base_path: String },

    #[error("instant {0} is not pending on the active timeline")]
    InstantNotFound(String),

    #[error("write schema is incompatible with the table schema: {0}")]
    IncompatibleSchema(#[source] SchemaError),

    #[error("compaction is only supported on merge-on-read tables")]
    CompactionNotSupported,

    #[error("cannot schedule compaction while write {0} is pending")]
    PendingWrite(String),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Timeline(#[from] TimelineError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct WriteClient {
    fs: Arc<dyn FileSystem>,
    config: WriteConfig,
    meta: TableMetaClient,
    timeline: ActiveTimeline,
    table: Arc<dyn TableOperations>,
    compactor: Arc<FileGroupTable>,
    index: Arc<InMemoryHashIndex>,
    executor: ParallelExecutor,
    rollback: RollbackCoordinator,
    rollback_pending: bool,
    operations: HashMap<String, WriteOperationType>,
    timers: HashMap<String, Clock>,
    async_cleaner: Option<AsyncCleanerService>,
    timeline_server: Mutex<Option<EmbeddedTimelineServer>>,
    metrics: WriteMetrics,
}

impl WriteClient {
    /// Open (or initialize) the table at `config.base_path`.
    pub fn new(fs: Arc<dyn FileSystem>, config: WriteConfig) -> Result<Self, ClientError> {
        let executor = ParallelExecutor::new("tidemark-write");
        let index = Arc::new(InMemoryHashIndex::new());
        let table = Arc::new(FileGroupTable::new(
            Arc::clone(&fs),
            config.clone(),
            executor.clone(),
            Arc::clone(&index),
        ));
        Self::build(fs, config, executor, index, table.clone(), table)
    }

    /// Like [`WriteClient::new`], but writes go through `table`.
    pub fn with_table_operations(
        fs: Arc<dyn FileSystem>,
        config: WriteConfig,
        table: Arc<dyn TableOperations>,
    ) -> Result<Self, ClientError> {
        let executor = ParallelExecutor::new("tidemark-write");
        let index = Arc::new(InMemoryHashIndex::new());
        let compactor = Arc::new(FileGroupTable::new(
            Arc::clone(&fs),
            config.clone(),
            executor.clone(),
            Arc::clone(&index),
        ));
        Self::build(fs, config, executor, index, table, compactor)
    }

    fn build(
        fs: Arc<dyn FileSystem>,
        config: WriteConfig,
        executor: ParallelExecutor,
        index: Arc<InMemoryHashIndex>,
        table: Arc<dyn TableOperations>,
        compactor: Arc<FileGroupTable>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let meta = TableMetaClient::load_or_init(Arc::clone(&fs), &config)?;
        if meta.table_type() != config.table_type {
            return Err(ConfigError::Invalid(format!(
                "table at {} is {:?}, config says {:?}",
                config.base_path.display(),
                meta.table_type(),
                config.table_type
            ))
            .into());
        }
        let timeline =
            meta.reload_active_timeline(Arc::new(InvariantEngine::with_timeline_defaults()))?;
        let rollback = RollbackCoordinator::from_config(Arc::clone(&fs), &config, executor.clone());

        let client = Self {
            fs,
            config,
            meta,
            timeline,
            table,
            compactor,
            index,
            executor,
            rollback,
            rollback_pending: true,
            operations: HashMap::new(),
            timers: HashMap::new(),
            async_cleaner: None,
            timeline_server: Mutex::new(None),
            metrics: WriteMetrics::new(),
        };
        client.start_embedded_server_if_needed();
        Ok(client)
    }

    /// Whether writes left pending by earlier sessions are rolled back
    /// before a new write starts. On by default.
    pub fn with_rollback_pending(mut self, rollback_pending: bool) -> Self {
        self.rollback_pending = rollback_pending;
        self
    }

    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    pub fn meta(&self) -> &TableMetaClient {
        &self.meta
    }

    pub fn timeline(&self) -> &ActiveTimeline {
        &self.timeline
    }

    pub fn index(&self) -> &Arc<InMemoryHashIndex> {
        &self.index
    }

    pub fn metrics(&self) -> &WriteMetrics {
        &self.metrics
    }

    pub fn base_path(&self) -> &Path {
        self.meta.base_path()
    }

    pub fn reload_active_timeline(&mut self) -> Result<(), ClientError> {
        self.timeline = self
            .meta
            .reload_active_timeline(Arc::clone(self.timeline.invariants()))?;
        Ok(())
    }

    /// Address of the embedded timeline server, if it is running.
    pub fn timeline_server_address(&self) -> Option<SocketAddr> {
        self.with_server(|server| server.as_ref().map(|s| s.address()))
    }

    pub fn is_async_cleaning(&self) -> bool {
        self.async_cleaner
            .as_ref()
            .map_or(false, AsyncCleanerService::is_started)
    }

    /// Register a new REQUESTED write instant and return its time.
    pub fn begin_instant(&mut self) -> Result<String, ClientError> {
        self.upgrade_if_needed()?;
        let action = self.commit_action();
        let instant_time = new_instant_time(self.timeline.last_instant_time());
        self.timeline.create_requested(&instant_time, action, None)?;
        info!(instant = %instant_time, "began instant");
        Ok(instant_time)
    }

    pub fn upsert(
        &mut self,
        records: Vec<Record>,
        instant_time: &str,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        self.write(instant_time, records_op(WriteOperationType::Upsert, records))
    }

    pub fn upsert_prepped(
        &mut self,
        records: Vec<Record>,
        instant_time: &str,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        self.write(instant_time, records_op(WriteOperationType::UpsertPrepped, records))
    }

    pub fn insert(
        &mut self,
        records: Vec<Record>,
        instant_time: &str,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        self.write(instant_time, records_op(WriteOperationType::Insert, records))
    }

    pub fn insert_prepped(
        &mut self,
        records: Vec<Record>,
        instant_time: &str,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        self.write(instant_time, records_op(WriteOperationType::InsertPrepped, records))
    }

    pub fn bulk_insert(
        &mut self,
        records: Vec<Record>,
        instant_time: &str,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        self.write(instant_time, records_op(WriteOperationType::BulkInsert, records))
    }

    pub fn bulk_insert_prepped(
        &mut self,
        records: Vec<Record>,
        instant_time: &str,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        self.write(
            instant_time,
            records_op(WriteOperationType::BulkInsertPrepped, records),
        )
    }

    pub fn delete(
        &mut self,
        keys: Vec<RecordKey>,
        instant_time: &str,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        self.write(instant_time, WriteOperation::Delete(keys))
    }

    fn write(
        &mut self,
        instant_time: &str,
        operation: WriteOperation,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        let operation_type = operation.operation_type();
        self.start_write(instant_time, operation_type)?;

        let result = self.table.execute(&self.timeline, instant_time, operation)?;
        self.metrics
            .update_index_metrics(operation_type, result.index_lookup_ms);

        if self.config.auto_commit {
            self.commit(instant_time, &result.statuses)?;
        }
        Ok(result.statuses)
    }

    fn start_write(
        &mut self,
        instant_time: &str,
        operation: WriteOperationType,
    ) -> Result<(), ClientError> {
        self.upgrade_if_needed()?;
        if self.timeline.find(instant_time).is_none() {
            let action = self.commit_action();
            self.timeline.create_requested(instant_time, action, None)?;
        }
        if self.rollback_pending {
            self.rollback_pending_writes(instant_time)?;
        }

        let requested = self
            .timeline
            .find(instant_time)
            .filter(|i| i.action.is_write() && i.state == InstantState::Requested)
            .cloned()
            .ok_or_else(|| ClientError::InstantNotFound(instant_time.to_string()))?;
        self.timeline.transition_to_inflight(&requested)?;

        if operation.writes_records() {
            if let Some(table_schema) = last_commit_schema(&self.timeline)? {
                self.config
                    .schema
                    .check_compatible_with(&table_schema)
                    .map_err(ClientError::IncompatibleSchema)?;
            }
        }

        self.operations.insert(instant_time.to_string(), operation);
        self.timers.insert(instant_time.to_string(), Clock::now());
        self.start_async_cleaning_if_enabled(instant_time);
        Ok(())
    }

    /// Publish `instant_time` as COMPLETED and run post-commit actions.
    /// Returns `false` when the instant was already committed.
    pub fn commit(
        &mut self,
        instant_time: &str,
        statuses: &[WriteStatus],
    ) -> Result<bool, ClientError> {
        let Some(instant) = self.timeline.find(instant_time).cloned() else {
            return Err(ClientError::InstantNotFound(instant_time.to_string()));
        };
        if !instant.action.is_write() {
            return Err(ClientError::InstantNotFound(instant_time.to_string()));
        }
        if instant.is_completed() {
            info!(instant = %instant_time, "instant already committed");
            return Ok(false);
        }

        if let Some(cleaner) = self.async_cleaner.take() {
            cleaner.join();
        }

        let operation = self.operations.remove(instant_time);
        let schema = match operation {
            Some(op) if op.writes_records() => Some(self.config.schema.clone()),
            _ => last_commit_schema(&self.timeline)?,
        };
        let metadata = CommitMetadata::new(operation, statuses, schema);

        let commit_err = |source: TableError| ClientError::Commit {
            instant: instant_time.to_string(),
            base_path: self.config.base_path.display().to_string(),
            source,
        };
        let bytes = metadata.to_bytes().map_err(commit_err)?;
        self.timeline
            .save_as_complete(&instant, Some(&bytes))
            .map_err(|e| commit_err(e.into()))?;
        self.index.update_location(statuses);
        info!(
            instant = %instant_time,
            action = instant.action.as_str(),
            records = metadata.total_records_written(),
            "committed instant"
        );

        let duration = self.elapsed(instant_time);
        match parse_instant_time(instant_time) {
            Ok(commit_time) => self.metrics.update_commit_metrics(
                instant_time,
                &commit_time,
                instant.action,
                duration,
                &metadata,
            ),
            Err(e) => warn!(instant = %instant_time, error = %e, "skipping commit metrics"),
        }

        self.post_commit(instant_time)?;
        Ok(true)
    }

    fn post_commit(&mut self, instant_time: &str) -> Result<(), ClientError> {
        self.meta
            .marker_store(instant_time)
            .delete_all(&self.executor, self.config.markers_delete_parallelism);

        if self.config.compaction.inline && self.meta.table_type() == TableType::MergeOnRead {
            self.run_any_pending_compactions()?;
            self.inline_compact()?;
        }

        archive_if_required(&mut self.timeline, &self.config.archive)?;

        if self.config.clean.auto && !self.config.clean.async_clean {
            self.clean()?;
        }
        Ok(())
    }

    /// Undo every file effect of `instant_time` and drop it from the
    /// active timeline.
    pub fn rollback(&mut self, instant_time: &str) -> Result<RollbackStats, ClientError> {
        let stats = self.rollback.rollback(&mut self.timeline, instant_time, true)?;
        self.operations.remove(instant_time);
        self.timers.remove(instant_time);
        self.index.invalidate();
        Ok(stats)
    }

    fn rollback_pending_writes(&mut self, current: &str) -> Result<(), ClientError> {
        let pending: Vec<String> = self
            .timeline
            .pending_writes()
            .filter(|i| i.timestamp != current)
            .map(|i| i.timestamp.clone())
            .collect();
        for instant_time in pending {
            info!(instant = %instant_time, "rolling back pending write");
            self.rollback(&instant_time)?;
        }
        Ok(())
    }

    /// Plan a compaction of every file slice with log files. `None` when
    /// there is nothing to compact.
    pub fn schedule_compaction(&mut self) -> Result<Option<String>, ClientError> {
        if self.meta.table_type() != TableType::MergeOnRead {
            return Err(ClientError::CompactionNotSupported);
        }
        if let Some(pending) = self.timeline.pending_writes().next() {
            return Err(ClientError::PendingWrite(pending.timestamp.clone()));
        }

        let view = self.compactor.build_view(self.timeline.instants())?;
        let plan = compact::generate_plan(&view, &self.timeline)?;
        if plan.is_empty() {
            info!("no file slices to compact");
            return Ok(None);
        }

        let instant_time = new_instant_time(self.timeline.last_instant_time());
        self.timeline.create_requested(
            &instant_time,
            Action::Compaction,
            Some(&plan.to_bytes()?),
        )?;
        info!(
            instant = %instant_time,
            operations = plan.operations.len(),
            "scheduled compaction"
        );
        Ok(Some(instant_time))
    }

    /// Execute a scheduled compaction. An inflight attempt is rolled back
    /// to its plan first.
    pub fn compact(
        &mut self,
        instant_time: &str,
        should_complete: bool,
    ) -> Result<Vec<WriteStatus>, ClientError> {
        self.parse_compaction_time(instant_time)?;
        if self.meta.table_type() != TableType::MergeOnRead {
            return Err(ClientError::CompactionNotSupported);
        }

        let pending = self
            .timeline
            .filter_pending_compaction_timeline()
            .find(|i| i.timestamp == instant_time)
            .cloned()
            .ok_or_else(|| ClientError::InstantNotFound(instant_time.to_string()))?;
        if pending.state == InstantState::Inflight {
            info!(instant = %instant_time, "rolling back inflight compaction");
            self.rollback.rollback(&mut self.timeline, instant_time, true)?;
        }
        let requested = Instant::requested(instant_time, Action::Compaction);

        let plan = CompactionPlan::read(&self.timeline, &requested)?;
        self.timeline.transition_to_inflight(&requested)?;
        self.timers.insert(instant_time.to_string(), Clock::now());

        let statuses = compact::execute_plan(&self.compactor, &self.timeline, instant_time, &plan)?;
        if should_complete {
            self.commit_compaction(instant_time, &statuses)?;
        }
        Ok(statuses)
    }

    /// Publish an executed compaction.
    pub fn commit_compaction(
        &mut self,
        instant_time: &str,
        statuses: &[WriteStatus],
    ) -> Result<(), ClientError> {
        let commit_time = self.parse_compaction_time(instant_time)?;
        let inflight = Instant::inflight(instant_time, Action::Compaction);
        if !self.timeline.contains_instant(&inflight) {
            return Err(ClientError::InstantNotFound(instant_time.to_string()));
        }

        let metadata = CommitMetadata::new(
            Some(WriteOperationType::Compact),
            statuses,
            Some(self.config.schema.clone()),
        );
        let commit_err = |source: TableError| ClientError::Commit {
            instant: instant_time.to_string(),
            base_path: self.config.base_path.display().to_string(),
            source,
        };
        let bytes = metadata.to_bytes().map_err(commit_err)?;
        self.timeline
            .save_as_complete(&inflight, Some(&bytes))
            .map_err(|e| commit_err(e.into()))?;
        self.index.update_location(statuses);

        let duration = self.elapsed(instant_time);
        self.metrics.update_commit_metrics(
            instant_time,
            &commit_time,
            Action::Compaction,
            duration,
            &metadata,
        );
        self.meta
            .marker_store(instant_time)
            .delete_all(&self.executor, self.config.markers_delete_parallelism);
        info!(instant = %instant_time, "compacted successfully");
        Ok(())
    }

    fn run_any_pending_compactions(&mut self) -> Result<(), ClientError> {
        let pending: Vec<String> = self
            .timeline
            .filter_pending_compaction_timeline()
            .map(|i| i.timestamp.clone())
            .collect();
        for instant_time in pending {
            info!(instant = %instant_time, "running pending compaction");
            self.compact(&instant_time, true)?;
        }
        Ok(())
    }

    fn inline_compact(&mut self) -> Result<(), ClientError> {
        let delta_commits = self.timeline.delta_commits_since_last_compaction();
        if delta_commits < self.config.compaction.max_delta_commits {
            return Ok(());
        }
        if let Some(instant_time) = self.schedule_compaction()? {
            self.compact(&instant_time, true)?;
        }
        Ok(())
    }

    /// Delete file slices outside the retention window.
    pub fn clean(&self) -> Result<CleanStats, ClientError> {
        let cleaner = Cleaner::new(Arc::clone(&self.fs), self.config.clone());
        Ok(cleaner.clean(self.timeline.instants())?)
    }

    /// Stop background services. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(cleaner) = self.async_cleaner.take() {
            cleaner.join();
        }
        self.with_server(|server| {
            if let Some(mut server) = server.take() {
                server.stop();
            }
        });
    }

    fn upgrade_if_needed(&mut self) -> Result<(), ClientError> {
        if upgrade::needs_upgrade_or_downgrade(&self.meta, CURRENT_TABLE_VERSION) {
            upgrade::run(
                &mut self.meta,
                &mut self.timeline,
                &self.config,
                &self.executor,
                CURRENT_TABLE_VERSION,
            )?;
            self.index.invalidate();
        }
        Ok(())
    }

    fn start_async_cleaning_if_enabled(&mut self, instant_time: &str) {
        if !(self.config.clean.auto && self.config.clean.async_clean) {
            return;
        }
        if let Some(previous) = self.async_cleaner.take() {
            previous.join();
        }
        let cleaner = Cleaner::new(Arc::clone(&self.fs), self.config.clone());
        self.async_cleaner = Some(AsyncCleanerService::start(
            cleaner,
            self.timeline.instants().to_vec(),
            instant_time,
        ));
    }

    fn start_embedded_server_if_needed(&self) {
        if !self.config.timeline_server.enabled {
            return;
        }
        self.with_server(|server| {
            if server.is_some() {
                return;
            }
            match EmbeddedTimelineServer::start(
                &self.config.timeline_server,
                self.meta.timeline_store(),
            ) {
                Ok(started) => *server = Some(started),
                Err(e) => warn!(
                    error = %e,
                    "failed to start embedded timeline server, continuing without it"
                ),
            }
        });
    }

    fn with_server<R>(&self, f: impl FnOnce(&mut Option<EmbeddedTimelineServer>) -> R) -> R {
        let mut guard = match self.timeline_server.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn parse_compaction_time(
        &self,
        instant_time: &str,
    ) -> Result<chrono::NaiveDateTime, ClientError> {
        parse_instant_time(instant_time).map_err(|_| ClientError::InvalidInstantTime {
            instant: instant_time.to_string(),
            base_path: self.config.base_path.display().to_string(),
        })
    }

    fn elapsed(&mut self, instant_time: &str) -> Duration {
        self.timers
            .remove(instant_time)
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    fn commit_action(&self) -> Action {
        self.meta.table_type().commit_action()
    }
}

impl Drop for WriteClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn records_op(operation: WriteOperationType, records: Vec<Record>) -> WriteOperation {
    WriteOperation::Records { operation, records }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::markers::marker_dir;
    use crate::schema::{Field, FieldType, RecordSchema};
    use serde_json::json;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn schema() -> RecordSchema {
        RecordSchema::new(
            vec![
                Field::new("id", FieldType::Utf8, false),
                Field::new("region", FieldType::Utf8, false),
                Field::new("amount", FieldType::Int64, true),
            ],
            "id",
            Some("region".into()),
        )
    }

    fn record(id: &str, amount: i64) -> Record {
        let data = json!({"id": id, "region": "eu", "amount": amount});
        Record::from_data(&schema(), data.as_object().unwrap().clone()).unwrap()
    }

    fn config(dir: &TempDir, table_type: TableType) -> WriteConfig {
        let mut config = WriteConfig::new(dir.path(), "trips", schema());
        config.table_type = table_type;
        config.clean.auto = false;
        config
    }

    fn client(config: WriteConfig) -> WriteClient {
        WriteClient::new(Arc::new(LocalFileSystem), config).unwrap()
    }

    #[test]
    fn upsert_commits_and_drops_markers() {
        let dir = TempDir::new().unwrap();
        let mut client = client(config(&dir, TableType::CopyOnWrite));

        let ts = client.begin_instant().unwrap();
        let statuses = client.upsert(vec![record("a", 1), record("b", 2)], &ts).unwrap();

        assert_eq!(statuses.iter().map(|s| s.stat.num_writes).sum::<u64>(), 2);
        let completed = client.timeline().last_completed_commit().unwrap();
        assert_eq!(completed.timestamp, ts);
        assert_eq!(completed.action, Action::Commit);
        assert!(!LocalFileSystem.exists(&marker_dir(dir.path(), &ts)));
        assert_eq!(client.metrics().snapshot().commits.len(), 1);
    }

    #[test]
    fn manual_commit_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, TableType::CopyOnWrite);
        cfg.auto_commit = false;
        let mut client = client(cfg);

        let ts = client.begin_instant().unwrap();
        let statuses = client.insert(vec![record("a", 1)], &ts).unwrap();
        assert_eq!(client.timeline().pending_writes().count(), 1);

        assert!(client.commit(&ts, &statuses).unwrap());
        assert!(!client.commit(&ts, &statuses).unwrap());
    }

    #[test]
    fn commit_from_another_client_leaves_operation_unset() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, TableType::CopyOnWrite);
        cfg.auto_commit = false;
        let (ts, statuses) = {
            let mut writer = client(cfg.clone());
            let ts = writer.begin_instant().unwrap();
            let statuses = writer.insert(vec![record("a", 1)], &ts).unwrap();
            (ts, statuses)
        };

        let mut committer = client(cfg).with_rollback_pending(false);
        assert!(committer.commit(&ts, &statuses).unwrap());

        let details = committer
            .timeline()
            .read_details(&Instant::completed(ts.as_str(), Action::Commit))
            .unwrap()
            .unwrap();
        let metadata = CommitMetadata::from_bytes(&details).unwrap();
        assert_eq!(metadata.operation_type, None);
        assert_eq!(metadata.total_records_written(), 1);
    }

    #[test]
    fn pending_write_is_rolled_back_before_next_write() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, TableType::CopyOnWrite);
        cfg.auto_commit = false;
        let mut client = client(cfg);

        let abandoned = client.begin_instant().unwrap();
        client.insert(vec![record("a", 1)], &abandoned).unwrap();

        let ts = client.begin_instant().unwrap();
        let statuses = client.insert(vec![record("b", 2)], &ts).unwrap();
        client.commit(&ts, &statuses).unwrap();

        assert!(client.timeline().find(&abandoned).is_none());
        let files = LocalFileSystem.list(&dir.path().join("eu")).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn incompatible_schema_leaves_instant_inflight() {
        let dir = TempDir::new().unwrap();
        {
            let mut client = client(config(&dir, TableType::CopyOnWrite));
            let ts = client.begin_instant().unwrap();
            client.insert(vec![record("a", 1)], &ts).unwrap();
        }

        let mut cfg = config(&dir, TableType::CopyOnWrite);
        cfg.schema = RecordSchema::new(
            vec![
                Field::new("id", FieldType::Utf8, false),
                Field::new("region", FieldType::Utf8, false),
            ],
            "id",
            Some("region".into()),
        );
        let mut client = client(cfg);
        let ts = client.begin_instant().unwrap();
        let err = client.insert(Vec::new(), &ts).unwrap_err();

        assert!(matches!(err, ClientError::IncompatibleSchema(_)));
        let pending = client.timeline().find(&ts).unwrap();
        assert_eq!(pending.state, InstantState::Inflight);
    }

    #[test]
    fn delete_removes_keys() {
        let dir = TempDir::new().unwrap();
        let mut client = client(config(&dir, TableType::CopyOnWrite));

        let ts = client.begin_instant().unwrap();
        client.insert(vec![record("a", 1), record("b", 2)], &ts).unwrap();
        let ts = client.begin_instant().unwrap();
        let statuses = client.delete(vec![RecordKey::new("a", "eu")], &ts).unwrap();

        assert_eq!(statuses.iter().map(|s| s.stat.num_deletes).sum::<u64>(), 1);
        assert!(client.index().location_of(&RecordKey::new("a", "eu")).is_none());
        assert!(client.index().location_of(&RecordKey::new("b", "eu")).is_some());
    }

    #[test]
    fn compaction_requires_merge_on_read() {
        let dir = TempDir::new().unwrap();
        let mut client = client(config(&dir, TableType::CopyOnWrite));
        assert!(matches!(
            client.schedule_compaction(),
            Err(ClientError::CompactionNotSupported)
        ));
    }

    #[test]
    fn unparseable_compaction_time_fails_fast() {
        let dir = TempDir::new().unwrap();
        let mut client = client(config(&dir, TableType::MergeOnRead));
        let err = client.compact("not-a-time", true).unwrap_err();
        assert!(matches!(err, ClientError::InvalidInstantTime { .. }));
    }

    #[test]
    fn inline_compaction_runs_after_enough_delta_commits() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, TableType::MergeOnRead);
        cfg.compaction.inline = true;
        cfg.compaction.max_delta_commits = 2;
        let mut client = client(cfg);

        let ts = client.begin_instant().unwrap();
        client.insert(vec![record("a", 1)], &ts).unwrap();
        let ts = client.begin_instant().unwrap();
        client.upsert(vec![record("a", 2)], &ts).unwrap();

        let compactions: Vec<&Instant> = client
            .timeline()
            .completed_instants()
            .filter(|i| i.action == Action::Compaction)
            .collect();
        assert_eq!(compactions.len(), 1);
        assert_eq!(client.timeline().delta_commits_since_last_compaction(), 0);
    }

    #[test]
    fn timeline_server_serves_completed_instants() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, TableType::CopyOnWrite);
        cfg.timeline_server.enabled = true;
        let mut client = client(cfg);

        let ts = client.begin_instant().unwrap();
        client.insert(vec![record("a", 1)], &ts).unwrap();

        let address = client.timeline_server_address().unwrap();
        let mut stream = std::net::TcpStream::connect(address).unwrap();
        write!(
            stream,
            "GET /timeline HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.contains(&ts));

        client.close();
        assert!(client.timeline_server_address().is_none());
    }

    #[test]
    fn timeline_server_start_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = config(&dir, TableType::CopyOnWrite);
        cfg.timeline_server.enabled = true;
        cfg.timeline_server.port = taken.local_addr().unwrap().port();

        let client = client(cfg);
        assert!(client.timeline_server_address().is_none());
    }
}
