// Write Handles
//
// One handle writes one file group for one instant. Every handle records
// its marker before the first byte of data reaches storage:
//
//   create  new file group, new base file            (CREATE)
//   merge   existing file group rewritten into a new
//           base file version                         (MERGE)
//   append  blocks appended to the file group's log   (APPEND)

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::view::{CommittedInstants, FileSlice};
use super::{TableError, WriteStat, WriteStatus};
use crate::fs::naming::{partition_dir, BaseFileName, LogFileName, WriteToken};
use crate::fs::FileSystem;
use crate::io::log::{LogBlock, LogWriter};
use crate::io::{BaseFileFormat, FileWriter, FileWriterFactory, WriterError};
use crate::markers::{IoType, MarkerError, MarkerStore};
use crate::record::{Record, RecordKey, RecordLocation};
use crate::schema::RecordSchema;

/// Everything a handle needs to write under one instant.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub fs: Arc<dyn FileSystem>,
    pub base_path: PathBuf,
    pub factory: FileWriterFactory,
    pub schema: RecordSchema,
    pub base_file_format: BaseFileFormat,
    pub log_max_file_size: u64,
    pub instant_time: String,
    pub markers: MarkerStore,
}

impl WriteContext {
    fn location(&self, file_id: &str) -> RecordLocation {
        RecordLocation {
            file_id: file_id.to_string(),
            instant_time: self.instant_time.clone(),
        }
    }

    fn base_file_name(&self, file_id: &str, token: &WriteToken) -> BaseFileName {
        BaseFileName::new(
            file_id,
            token,
            &self.instant_time,
            self.base_file_format.extension(),
        )
    }
}

/// Path relative to the base path, `/`-separated.
fn relative_path(partition_path: &str, file_name: &str) -> String {
    if partition_path.is_empty() {
        file_name.to_string()
    } else {
        format!("{partition_path}/{file_name}")
    }
}

fn new_file_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Write one record, turning schema rejections into per-record failures.
fn write_record(
    writer: &mut dyn FileWriter,
    record: &Record,
    status: &mut WriteStatus,
) -> Result<bool, TableError> {
    match writer.write(record) {
        Ok(()) => Ok(true),
        Err(WriterError::Schema(e)) => {
            status.failed_records.push((record.key.clone(), e.to_string()));
            status.stat.total_write_errors += 1;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Start a new base file: marker first, then the writer.
fn open_base_file(
    ctx: &WriteContext,
    partition_path: &str,
    name: &BaseFileName,
    io_type: IoType,
) -> Result<Box<dyn FileWriter>, TableError> {
    let file_name = name.file_name();
    let path = partition_dir(&ctx.base_path, partition_path).join(&file_name);
    BaseFileFormat::of_path(&path)?;

    ctx.markers.record(partition_path, &file_name, io_type)?;
    Ok(ctx.factory.get_file_writer(&path, &ctx.schema)?)
}

/// Write `records` into new file groups of `partition_path`, starting a
/// new group whenever the current file reaches its size limit.
pub fn create_file_groups(
    ctx: &WriteContext,
    task_id: u64,
    partition_path: &str,
    records: Vec<Record>,
) -> Result<Vec<WriteStatus>, TableError> {
    let token = WriteToken::new(task_id, 0, 0);
    let mut statuses = Vec::new();
    let mut records = records.into_iter().peekable();

    while records.peek().is_some() {
        let file_id = new_file_id();
        let name = ctx.base_file_name(&file_id, &token);
        let mut writer = open_base_file(ctx, partition_path, &name, IoType::Create)?;
        let location = ctx.location(&file_id);

        let mut status = WriteStatus {
            stat: WriteStat {
                partition_path: partition_path.to_string(),
                file_id: file_id.clone(),
                path: relative_path(partition_path, &name.file_name()),
                ..Default::default()
            },
            ..Default::default()
        };

        while writer.can_write() {
            let Some(record) = records.next() else {
                break;
            };
            if write_record(writer.as_mut(), &record, &mut status)? {
                status.stat.num_inserts += 1;
                status.written.push((record.key, location.clone()));
            }
        }

        let written = writer.close()?;
        status.stat.num_writes = written.records;
        status.stat.total_write_bytes = ctx.fs.len(&written.path).unwrap_or_default();
        debug!(
            instant = %ctx.instant_time,
            file = %status.stat.path,
            records = written.records,
            "created file group"
        );
        statuses.push(status);
    }
    Ok(statuses)
}

/// Rewrite `slice` with `updates` applied and `deletes` removed into a new
/// base file of the same file group.
pub fn merge_file_group(
    ctx: &WriteContext,
    task_id: u64,
    slice: &FileSlice,
    committed: &CommittedInstants,
    updates: Vec<Record>,
    deletes: Vec<RecordKey>,
) -> Result<WriteStatus, TableError> {
    let mut current = slice.read_records(ctx.fs.as_ref(), &ctx.schema, committed)?;
    let token = WriteToken::new(task_id, 0, 0);
    let name = ctx.base_file_name(&slice.file_id, &token);
    let location = ctx.location(&slice.file_id);

    let mut status = WriteStatus {
        stat: WriteStat {
            partition_path: slice.partition_path.clone(),
            file_id: slice.file_id.clone(),
            path: relative_path(&slice.partition_path, &name.file_name()),
            prev_commit: Some(slice.base_instant_time.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    let mut changed = Vec::with_capacity(updates.len());
    for record in updates {
        let key = record.key.clone();
        if current
            .insert(key.record_key.clone(), record.with_location(None))
            .is_some()
        {
            status.stat.num_update_writes += 1;
        } else {
            status.stat.num_inserts += 1;
        }
        changed.push(key);
    }
    for key in deletes {
        if current.remove(&key.record_key).is_some() {
            status.stat.num_deletes += 1;
            status.deleted.push(key);
        }
    }

    let mut writer = open_base_file(ctx, &slice.partition_path, &name, IoType::Merge)?;
    for record in current.values() {
        write_record(writer.as_mut(), record, &mut status)?;
    }
    let written = writer.close()?;

    status.written = changed
        .into_iter()
        .filter(|k| !status.failed_records.iter().any(|(failed, _)| failed == k))
        .map(|k| (k, location.clone()))
        .collect();
    status.stat.num_writes = written.records;
    status.stat.total_write_bytes = ctx.fs.len(&written.path).unwrap_or_default();
    debug!(
        instant = %ctx.instant_time,
        file = %status.stat.path,
        updates = status.stat.num_update_writes,
        deletes = status.stat.num_deletes,
        "merged file group"
    );
    Ok(status)
}

/// Append `updates` and `deletes` as blocks to the latest log file of
/// `slice`, rolling to a new log version once it is full.
pub fn append_to_file_group(
    ctx: &WriteContext,
    task_id: u64,
    slice: &FileSlice,
    updates: Vec<Record>,
    deletes: Vec<RecordKey>,
) -> Result<WriteStatus, TableError> {
    let token = WriteToken::new(task_id, 0, 0);
    let log_name = match slice.latest_log_file() {
        Some(log) if log.len < ctx.log_max_file_size => log.name.clone(),
        Some(log) => LogFileName::new(
            &slice.file_id,
            &slice.base_instant_time,
            log.name.version + 1,
            &token,
        ),
        None => LogFileName::new(&slice.file_id, &slice.base_instant_time, 1, &token),
    };
    let file_name = log_name.file_name();

    match ctx.markers.record(&slice.partition_path, &file_name, IoType::Append) {
        Ok(_) | Err(MarkerError::AlreadyExists(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let path = partition_dir(&ctx.base_path, &slice.partition_path).join(&file_name);
    let writer = LogWriter::new(ctx.fs.as_ref(), &path);
    let size_before = writer.len()?;
    let location = ctx.location(&slice.file_id);

    let mut status = WriteStatus {
        stat: WriteStat {
            partition_path: slice.partition_path.clone(),
            file_id: slice.file_id.clone(),
            path: relative_path(&slice.partition_path, &file_name),
            prev_commit: Some(slice.base_instant_time.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    if !updates.is_empty() {
        let records: Vec<Record> = updates.into_iter().map(|r| r.with_location(None)).collect();
        writer.append(&LogBlock::data(&ctx.instant_time, &records)?)?;
        status.stat.num_update_writes = records.len() as u64;
        status.stat.num_writes = records.len() as u64;
        status.written = records
            .into_iter()
            .map(|r| (r.key, location.clone()))
            .collect();
    }
    if !deletes.is_empty() {
        writer.append(&LogBlock::delete(&ctx.instant_time, &deletes)?)?;
        status.stat.num_deletes = deletes.len() as u64;
        status.deleted = deletes;
    }

    let size_after = writer.len()?;
    if size_after < size_before {
        warn!(path = %path.display(), "log file shrank while appending");
    }
    status.stat.total_write_bytes = size_after.saturating_sub(size_before);
    debug!(
        instant = %ctx.instant_time,
        file = %status.stat.path,
        bytes = status.stat.total_write_bytes,
        "appended to log"
    );
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomFilterConfig;
    use crate::fs::LocalFileSystem;
    use crate::io::{HFileConfig, ParquetConfig};
    use crate::schema::{Field, FieldType};
    use crate::table::view::FileSystemView;
    use crate::timeline::{Action, Instant};
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

    fn record(id: &str, amount: i64) -> Record {
        let data = json!({"id": id, "region": "eu", "amount": amount});
        Record::from_data(&schema(), data.as_object().unwrap().clone()).unwrap()
    }

    fn context(dir: &TempDir, instant_time: &str) -> WriteContext {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        WriteContext {
            fs: Arc::clone(&fs),
            base_path: dir.path().to_path_buf(),
            factory: FileWriterFactory::new(
                Arc::clone(&fs),
                BloomFilterConfig::default(),
                ParquetConfig::default(),
                HFileConfig::default(),
            ),
            schema: schema(),
            base_file_format: BaseFileFormat::Parquet,
            log_max_file_size: 1024 * 1024,
            instant_time: instant_time.to_string(),
            markers: MarkerStore::new(fs, dir.path(), instant_time),
        }
    }

    fn latest_slice(dir: &TempDir, instants: &[Instant]) -> (FileSlice, CommittedInstants) {
        let view = FileSystemView::build(&LocalFileSystem, dir.path(), instants, false).unwrap();
        let slice = view.latest_file_slices("eu").next().unwrap().clone();
        (slice, view.committed().clone())
    }

    #[test]
    fn create_records_marker_and_locations() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, "001");

        let statuses = create_file_groups(&ctx, 0, "eu", vec![record("a", 1), record("b", 2)]).unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].stat.num_inserts, 2);
        assert_eq!(statuses[0].written.len(), 2);
        let markers = ctx.markers.markers().unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].io_type, IoType::Create);
    }

    #[test]
    fn merge_rewrites_file_group() {
        let dir = TempDir::new().unwrap();
        create_file_groups(&context(&dir, "001"), 0, "eu", vec![record("a", 1), record("b", 2)]).unwrap();
        let (slice, committed) = latest_slice(&dir, &[Instant::completed("001", Action::Commit)]);

        let ctx = context(&dir, "002");
        let status = merge_file_group(
            &ctx,
            0,
            &slice,
            &committed,
            vec![record("a", 10), record("c", 3)],
            vec![RecordKey::new("b", "eu")],
        )
        .unwrap();

        assert_eq!(status.stat.num_update_writes, 1);
        assert_eq!(status.stat.num_inserts, 1);
        assert_eq!(status.stat.num_deletes, 1);
        assert_eq!(status.stat.num_writes, 2);
        assert_eq!(status.stat.prev_commit.as_deref(), Some("001"));

        let instants = [
            Instant::completed("001", Action::Commit),
            Instant::completed("002", Action::Commit),
        ];
        let (slice, committed) = latest_slice(&dir, &instants);
        let records = slice.read_records(&LocalFileSystem, &schema(), &committed).unwrap();
        assert_eq!(records.keys().cloned().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(records["a"].data["amount"], json!(10));
    }

    #[test]
    fn append_reuses_log_marker_within_an_instant() {
        let dir = TempDir::new().unwrap();
        create_file_groups(&context(&dir, "001"), 0, "eu", vec![record("a", 1)]).unwrap();
        let (slice, committed) = latest_slice(&dir, &[Instant::completed("001", Action::DeltaCommit)]);

        let ctx = context(&dir, "002");
        append_to_file_group(&ctx, 0, &slice, vec![record("a", 5)], vec![]).unwrap();
        let (slice, _) = latest_slice(&dir, &[Instant::completed("001", Action::DeltaCommit)]);
        append_to_file_group(&ctx, 0, &slice, vec![], vec![RecordKey::new("a", "eu")]).unwrap();

        assert_eq!(ctx.markers.list_all().unwrap().len(), 1);
        assert_eq!(slice.log_files.len(), 1);

        // Blocks of the pending instant are invisible.
        let records = slice.read_records(&LocalFileSystem, &schema(), &committed).unwrap();
        assert_eq!(records["a"].data["amount"], json!(1));

        let instants = [
            Instant::completed("001", Action::DeltaCommit),
            Instant::completed("002", Action::DeltaCommit),
        ];
        let (slice, committed) = latest_slice(&dir, &instants);
        assert!(slice.read_records(&LocalFileSystem, &schema(), &committed).unwrap().is_empty());
    }
}
