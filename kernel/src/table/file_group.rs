// File Group Table
//
// Turns one write operation into per-file-group work units and runs them
// on the parallel executor:
//
// - records without a location go to new file groups
// - copy-on-write: updates and deletes rewrite the file group
// - merge-on-read: updates and deletes are appended to its log

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant as Clock;

use tracing::{debug, info};

use super::handle::{append_to_file_group, create_file_groups, merge_file_group, WriteContext};
use super::index::InMemoryHashIndex;
use super::view::{FileSlice, FileSystemView};
use super::{
    TableError, TableOperations, TableType, WriteMetadata, WriteOperation, WriteOperationType,
    WriteStatus,
};
use crate::config::WriteConfig;
use crate::executor::ParallelExecutor;
use crate::fs::FileSystem;
use crate::io::FileWriterFactory;
use crate::markers::MarkerStore;
use crate::record::{Record, RecordKey};
use crate::timeline::{ActiveTimeline, Instant};

enum WorkUnit<'a> {
    Create {
        partition_path: String,
        records: Vec<Record>,
    },
    Merge {
        slice: &'a FileSlice,
        updates: Vec<Record>,
        deletes: Vec<RecordKey>,
    },
    Append {
        slice: &'a FileSlice,
        updates: Vec<Record>,
        deletes: Vec<RecordKey>,
    },
}

#[derive(Default)]
struct FileGroupChanges {
    updates: Vec<Record>,
    deletes: Vec<RecordKey>,
}

#[derive(Debug)]
pub struct FileGroupTable {
    fs: Arc<dyn FileSystem>,
    config: WriteConfig,
    factory: FileWriterFactory,
    executor: ParallelExecutor,
    index: Arc<InMemoryHashIndex>,
}

impl FileGroupTable {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        config: WriteConfig,
        executor: ParallelExecutor,
        index: Arc<InMemoryHashIndex>,
    ) -> Self {
        let factory = FileWriterFactory::new(
            Arc::clone(&fs),
            config.bloom.clone(),
            config.parquet.clone(),
            config.hfile.clone(),
        );
        Self {
            fs,
            config,
            factory,
            executor,
            index,
        }
    }

    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn index(&self) -> &Arc<InMemoryHashIndex> {
        &self.index
    }

    pub fn executor(&self) -> &ParallelExecutor {
        &self.executor
    }

    pub fn build_view(&self, instants: &[Instant]) -> Result<FileSystemView, TableError> {
        FileSystemView::build(
            self.fs.as_ref(),
            &self.config.base_path,
            instants,
            self.config.assume_date_partitioning,
        )
    }

    pub(crate) fn write_context(&self, instant_time: &str) -> WriteContext {
        WriteContext {
            fs: Arc::clone(&self.fs),
            base_path: self.config.base_path.clone(),
            factory: self.factory.clone(),
            schema: self.config.schema.clone(),
            base_file_format: self.config.base_file_format,
            log_max_file_size: self.config.log.max_file_size,
            instant_time: instant_time.to_string(),
            markers: MarkerStore::new(Arc::clone(&self.fs), &self.config.base_path, instant_time),
        }
    }

    /// Rewrite every listed slice into a new base file at `instant_time`.
    pub(crate) fn rewrite_slices(
        &self,
        view: &FileSystemView,
        instant_time: &str,
        slices: Vec<&FileSlice>,
    ) -> Result<Vec<WriteStatus>, TableError> {
        let units = slices
            .into_iter()
            .map(|slice| WorkUnit::Merge {
                slice,
                updates: Vec::new(),
                deletes: Vec::new(),
            })
            .collect();
        self.run(view, instant_time, units)
    }

    fn run(
        &self,
        view: &FileSystemView,
        instant_time: &str,
        units: Vec<WorkUnit<'_>>,
    ) -> Result<Vec<WriteStatus>, TableError> {
        let ctx = self.write_context(instant_time);
        let committed = view.committed();
        let tasks: Vec<(u64, WorkUnit<'_>)> = (0u64..).zip(units).collect();

        let statuses = self.executor.map(tasks, self.config.write_parallelism, |(task_id, unit)| {
            match unit {
                WorkUnit::Create {
                    partition_path,
                    records,
                } => create_file_groups(&ctx, task_id, &partition_path, records),
                WorkUnit::Merge {
                    slice,
                    updates,
                    deletes,
                } => merge_file_group(&ctx, task_id, slice, committed, updates, deletes)
                    .map(|s| vec![s]),
                WorkUnit::Append {
                    slice,
                    updates,
                    deletes,
                } => append_to_file_group(&ctx, task_id, slice, updates, deletes).map(|s| vec![s]),
            }
        })?;
        Ok(statuses.into_iter().flatten().collect())
    }

    /// Split records per partition into chunks of at most
    /// `insert_split_size`, one new file group each.
    fn insert_units<'a>(&self, records: Vec<Record>, sort: bool) -> Vec<WorkUnit<'a>> {
        let mut by_partition: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in records {
            by_partition
                .entry(record.key.partition_path.clone())
                .or_default()
                .push(record.with_location(None));
        }

        let mut units = Vec::new();
        for (partition_path, mut records) in by_partition {
            if sort {
                records.sort_by(|a, b| a.key.record_key.cmp(&b.key.record_key));
            }
            let mut records = records.into_iter().peekable();
            while records.peek().is_some() {
                let chunk: Vec<Record> = records.by_ref().take(self.config.insert_split_size).collect();
                units.push(WorkUnit::Create {
                    partition_path: partition_path.clone(),
                    records: chunk,
                });
            }
        }
        units
    }

    /// Updates and deletes per existing file group, in the layout of the
    /// table type. Changes for file groups no longer visible fall back to
    /// inserts (updates) or are dropped (deletes).
    fn change_units<'a>(
        &self,
        view: &'a FileSystemView,
        changes: HashMap<(String, String), FileGroupChanges>,
        inserts: &mut Vec<Record>,
    ) -> Vec<WorkUnit<'a>> {
        let mut units = Vec::new();
        for ((partition_path, file_id), FileGroupChanges { updates, deletes }) in changes {
            let Some(slice) = view
                .file_group(&partition_path, &file_id)
                .and_then(|g| g.latest_slice())
            else {
                debug!(partition = %partition_path, file_id = %file_id, "file group not visible, writing as insert");
                inserts.extend(updates);
                continue;
            };
            units.push(match self.config.table_type {
                TableType::CopyOnWrite => WorkUnit::Merge {
                    slice,
                    updates,
                    deletes,
                },
                TableType::MergeOnRead => WorkUnit::Append {
                    slice,
                    updates,
                    deletes,
                },
            });
        }
        units
    }

    fn tag(
        &self,
        view: &FileSystemView,
        records: Vec<Record>,
        prepped: bool,
    ) -> Result<(Vec<Record>, u64), TableError> {
        if prepped {
            return Ok((records, 0));
        }
        let started = Clock::now();
        self.index
            .ensure_loaded(self.fs.as_ref(), view, &self.config.schema)?;
        let tagged = self.index.tag_location(dedupe(records));
        Ok((tagged, started.elapsed().as_millis() as u64))
    }

    fn upsert(
        &self,
        view: &FileSystemView,
        instant_time: &str,
        records: Vec<Record>,
        prepped: bool,
    ) -> Result<WriteMetadata, TableError> {
        let (records, index_lookup_ms) = self.tag(view, records, prepped)?;

        let mut inserts = Vec::new();
        let mut changes: HashMap<(String, String), FileGroupChanges> = HashMap::new();
        for record in records {
            match record.current_location.clone() {
                Some(location) => changes
                    .entry((record.key.partition_path.clone(), location.file_id))
                    .or_default()
                    .updates
                    .push(record),
                None => inserts.push(record),
            }
        }

        let mut units = self.change_units(view, changes, &mut inserts);
        units.extend(self.insert_units(inserts, false));
        Ok(WriteMetadata {
            statuses: self.run(view, instant_time, units)?,
            index_lookup_ms,
        })
    }

    fn delete(
        &self,
        view: &FileSystemView,
        instant_time: &str,
        keys: Vec<RecordKey>,
    ) -> Result<WriteMetadata, TableError> {
        let started = Clock::now();
        self.index
            .ensure_loaded(self.fs.as_ref(), view, &self.config.schema)?;

        let mut changes: HashMap<(String, String), FileGroupChanges> = HashMap::new();
        let mut unknown = 0usize;
        for key in keys {
            match self.index.location_of(&key) {
                Some(location) => changes
                    .entry((key.partition_path.clone(), location.file_id))
                    .or_default()
                    .deletes
                    .push(key),
                None => unknown += 1,
            }
        }
        if unknown > 0 {
            debug!(instant = %instant_time, keys = unknown, "ignoring deletes of unknown keys");
        }
        let index_lookup_ms = started.elapsed().as_millis() as u64;

        let units = self.change_units(view, changes, &mut Vec::new());
        Ok(WriteMetadata {
            statuses: self.run(view, instant_time, units)?,
            index_lookup_ms,
        })
    }
}

/// Keep the last record per key.
fn dedupe(records: Vec<Record>) -> Vec<Record> {
    let mut latest: BTreeMap<RecordKey, Record> = BTreeMap::new();
    for record in records {
        latest.insert(record.key.clone(), record);
    }
    latest.into_values().collect()
}

impl TableOperations for FileGroupTable {
    fn table_type(&self) -> TableType {
        self.config.table_type
    }

    fn execute(
        &self,
        timeline: &ActiveTimeline,
        instant_time: &str,
        operation: WriteOperation,
    ) -> Result<WriteMetadata, TableError> {
        let operation_type = operation.operation_type();
        let view = self.build_view(timeline.instants())?;

        let metadata = match operation {
            WriteOperation::Records { operation, records } => match operation {
                WriteOperationType::Upsert | WriteOperationType::UpsertPrepped => {
                    self.upsert(&view, instant_time, records, operation.is_prepped())?
                }
                WriteOperationType::Insert | WriteOperationType::BulkInsert => {
                    let sort = operation == WriteOperationType::BulkInsert;
                    let units = self.insert_units(dedupe(records), sort);
                    WriteMetadata {
                        statuses: self.run(&view, instant_time, units)?,
                        index_lookup_ms: 0,
                    }
                }
                WriteOperationType::InsertPrepped | WriteOperationType::BulkInsertPrepped => {
                    let sort = operation == WriteOperationType::BulkInsertPrepped;
                    let units = self.insert_units(records, sort);
                    WriteMetadata {
                        statuses: self.run(&view, instant_time, units)?,
                        index_lookup_ms: 0,
                    }
                }
                WriteOperationType::Delete | WriteOperationType::Compact => {
                    return Err(TableError::InvalidPlan(format!(
                        "{operation} does not take records"
                    )))
                }
            },
            WriteOperation::Delete(keys) => self.delete(&view, instant_time, keys)?,
        };

        let records: u64 = metadata.statuses.iter().map(|s| s.stat.num_writes).sum();
        info!(
            instant = %instant_time,
            operation = %operation_type,
            files = metadata.statuses.len(),
            records,
            "wrote file groups"
        );
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::invariants::InvariantEngine;
    use crate::markers::IoType;
    use crate::schema::{Field, FieldType, RecordSchema};
    use crate::timeline::InMemoryTimelineStore;
    use serde_json::json;
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

    fn record(id: &str, region: &str, amount: i64) -> Record {
        let data = json!({"id": id, "region": region, "amount": amount});
        Record::from_data(&schema(), data.as_object().unwrap().clone()).unwrap()
    }

    fn table(dir: &TempDir, table_type: TableType) -> FileGroupTable {
        let mut config = WriteConfig::new(dir.path(), "t", schema());
        config.table_type = table_type;
        config.insert_split_size = 2;
        FileGroupTable::new(
            Arc::new(LocalFileSystem),
            config,
            ParallelExecutor::default(),
            Arc::new(InMemoryHashIndex::new()),
        )
    }

    fn timeline() -> ActiveTimeline {
        ActiveTimeline::new(
            Arc::new(InMemoryTimelineStore::default()),
            Arc::new(InvariantEngine::with_timeline_defaults()),
        )
    }

    fn write(
        table: &FileGroupTable,
        timeline: &mut ActiveTimeline,
        ts: &str,
        operation: WriteOperation,
    ) -> WriteMetadata {
        let action = table.table_type().commit_action();
        let requested = timeline.create_requested(ts, action, None).unwrap();
        let inflight = timeline.transition_to_inflight(&requested).unwrap();
        let metadata = table.execute(timeline, ts, operation).unwrap();
        timeline.save_as_complete(&inflight, None).unwrap();
        table.index().update_location(&metadata.statuses);
        metadata
    }

    fn markers(dir: &TempDir, ts: &str) -> Vec<IoType> {
        MarkerStore::new(Arc::new(LocalFileSystem), dir.path(), ts)
            .markers()
            .unwrap()
            .into_iter()
            .map(|m| m.io_type)
            .collect()
    }

    #[test]
    fn inserts_split_into_file_groups() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, TableType::CopyOnWrite);
        let mut timeline = timeline();

        let metadata = write(
            &table,
            &mut timeline,
            "001",
            WriteOperation::Records {
                operation: WriteOperationType::Insert,
                records: vec![
                    record("a", "eu", 1),
                    record("b", "eu", 2),
                    record("c", "eu", 3),
                    record("d", "us", 4),
                ],
            },
        );

        assert_eq!(metadata.statuses.len(), 3);
        assert_eq!(markers(&dir, "001"), vec![IoType::Create; 3]);
    }

    #[test]
    fn copy_on_write_upsert_merges() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, TableType::CopyOnWrite);
        let mut timeline = timeline();
        write(
            &table,
            &mut timeline,
            "001",
            WriteOperation::Records {
                operation: WriteOperationType::Insert,
                records: vec![record("a", "eu", 1)],
            },
        );

        let metadata = write(
            &table,
            &mut timeline,
            "002",
            WriteOperation::Records {
                operation: WriteOperationType::Upsert,
                records: vec![record("a", "eu", 7), record("z", "eu", 9)],
            },
        );

        let mut io_types = markers(&dir, "002");
        io_types.sort_by_key(|t| t.as_str());
        assert_eq!(io_types, vec![IoType::Create, IoType::Merge]);
        let updates: u64 = metadata.statuses.iter().map(|s| s.stat.num_update_writes).sum();
        assert_eq!(updates, 1);
    }

    #[test]
    fn merge_on_read_deletes_append() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, TableType::MergeOnRead);
        let mut timeline = timeline();
        write(
            &table,
            &mut timeline,
            "001",
            WriteOperation::Records {
                operation: WriteOperationType::Insert,
                records: vec![record("a", "eu", 1), record("b", "eu", 2)],
            },
        );

        let metadata = write(
            &table,
            &mut timeline,
            "002",
            WriteOperation::Delete(vec![RecordKey::new("a", "eu"), RecordKey::new("nope", "eu")]),
        );

        assert_eq!(markers(&dir, "002"), vec![IoType::Append]);
        assert_eq!(metadata.statuses.len(), 1);
        assert_eq!(metadata.statuses[0].stat.num_deletes, 1);
        assert_eq!(table.index().location_of(&RecordKey::new("a", "eu")), None);
    }

    #[test]
    fn duplicate_keys_keep_the_last_record() {
        let records = dedupe(vec![record("a", "eu", 1), record("a", "eu", 2)]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data["amount"], json!(2));
    }

    #[test]
    fn bulk_insert_sorts_by_key() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir, TableType::CopyOnWrite);
        let units = table.insert_units(
            vec![record("c", "eu", 1), record("a", "eu", 2), record("b", "eu", 3)],
            true,
        );

        let keys: Vec<Vec<String>> = units
            .into_iter()
            .map(|u| match u {
                WorkUnit::Create { records, .. } => {
                    records.into_iter().map(|r| r.key.record_key).collect()
                }
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![vec!["a".to_string(), "b".into()], vec!["c".into()]]);
    }
}
