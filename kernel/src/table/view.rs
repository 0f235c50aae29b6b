// File System View
//
// Groups the data files of a table into file groups and file slices and
// hides everything written by instants that have not committed. A file
// slice is one base file plus the log files appended against it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::TableError;
use crate::fs::naming::{partition_dir, BaseFileName, DataFileName, LogFileName};
use crate::fs::partition::list_partitions;
use crate::fs::FileSystem;
use crate::io::log::{BlockType, LogWriter};
use crate::io::open_base_file_reader;
use crate::record::{Record, RecordLocation};
use crate::schema::RecordSchema;
use crate::timeline::Instant;

/// Which instant times readers may see.
///
/// An instant is visible when it completed on the active timeline, or
/// when it sorts before the first active instant (it was archived).
#[derive(Debug, Clone, Default)]
pub struct CommittedInstants {
    completed: HashSet<String>,
    pending: HashSet<String>,
    first_active: Option<String>,
}

impl CommittedInstants {
    pub fn from_instants(instants: &[Instant]) -> Self {
        let mut committed = CommittedInstants {
            first_active: instants.iter().map(|i| i.timestamp.clone()).min(),
            ..Default::default()
        };
        for instant in instants {
            if instant.is_completed() && instant.action.produces_data() {
                committed.completed.insert(instant.timestamp.clone());
            } else if !instant.is_completed() {
                committed.pending.insert(instant.timestamp.clone());
            }
        }
        committed
    }

    pub fn is_committed(&self, instant_time: &str) -> bool {
        if self.completed.contains(instant_time) {
            return true;
        }
        if self.pending.contains(instant_time) {
            return false;
        }
        self.first_active
            .as_deref()
            .is_some_and(|first| instant_time < first)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseFile {
    pub path: PathBuf,
    pub name: BaseFileName,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub name: LogFileName,
    pub len: u64,
}

/// One version of a file group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub partition_path: String,
    pub file_id: String,
    pub base_instant_time: String,
    pub base_file: Option<BaseFile>,
    /// Ordered by version.
    pub log_files: Vec<LogFile>,
}

impl FileSlice {
    fn new(partition_path: &str, file_id: &str, base_instant_time: &str) -> Self {
        Self {
            partition_path: partition_path.to_string(),
            file_id: file_id.to_string(),
            base_instant_time: base_instant_time.to_string(),
            base_file: None,
            log_files: Vec::new(),
        }
    }

    pub fn latest_log_file(&self) -> Option<&LogFile> {
        self.log_files.last()
    }

    /// Current records of the slice: base file rows overlaid by the valid
    /// blocks of every log file, in order.
    pub fn read_records(
        &self,
        fs: &dyn FileSystem,
        schema: &RecordSchema,
        committed: &CommittedInstants,
    ) -> Result<BTreeMap<String, Record>, TableError> {
        let mut records = BTreeMap::new();

        if let Some(base) = &self.base_file {
            let location = RecordLocation {
                file_id: self.file_id.clone(),
                instant_time: base.name.instant_time.clone(),
            };
            for row in open_base_file_reader(fs, &base.path)?.read_rows()? {
                let mut record = Record::from_data(schema, row)?;
                record.key.partition_path = self.partition_path.clone();
                records.insert(
                    record.key.record_key.clone(),
                    record.with_location(Some(location.clone())),
                );
            }
        }

        for log in &self.log_files {
            let scan = LogWriter::new(fs, &log.path).scan()?;
            for positioned in scan.valid_blocks(|ts| committed.is_committed(ts)) {
                let block = &positioned.block;
                match block.block_type {
                    BlockType::Data => {
                        let location = RecordLocation {
                            file_id: self.file_id.clone(),
                            instant_time: block.header.instant_time.clone(),
                        };
                        for record in block.records()? {
                            records.insert(
                                record.key.record_key.clone(),
                                record.with_location(Some(location.clone())),
                            );
                        }
                    }
                    BlockType::Delete => {
                        for key in block.deleted_keys()? {
                            records.remove(&key.record_key);
                        }
                    }
                    BlockType::Command => {}
                }
            }
        }
        Ok(records)
    }
}

/// Every visible slice of one file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    pub partition_path: String,
    pub file_id: String,
    /// Ordered by base instant time.
    pub slices: Vec<FileSlice>,
}

impl FileGroup {
    pub fn latest_slice(&self) -> Option<&FileSlice> {
        self.slices.last()
    }
}

#[derive(Debug, Clone)]
pub struct FileSystemView {
    base_path: PathBuf,
    committed: CommittedInstants,
    groups: BTreeMap<(String, String), FileGroup>,
}

impl FileSystemView {
    /// List every partition and keep the files visible under `instants`.
    pub fn build(
        fs: &dyn FileSystem,
        base_path: &Path,
        instants: &[Instant],
        assume_date_partitioning: bool,
    ) -> Result<Self, TableError> {
        let committed = CommittedInstants::from_instants(instants);
        let partitions = list_partitions(fs, base_path, assume_date_partitioning)
            .map_err(|e| TableError::io(base_path, e))?;

        let mut slices: BTreeMap<(String, String, String), FileSlice> = BTreeMap::new();
        for partition in &partitions {
            let dir = partition_dir(base_path, partition);
            for entry in fs.list(&dir).map_err(|e| TableError::io(&dir, e))? {
                if entry.is_dir {
                    continue;
                }
                let Some(name) = entry.path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                match DataFileName::parse(name) {
                    Some(DataFileName::Base(base)) if committed.is_committed(&base.instant_time) => {
                        let slice = slices
                            .entry((partition.clone(), base.file_id.clone(), base.instant_time.clone()))
                            .or_insert_with(|| FileSlice::new(partition, &base.file_id, &base.instant_time));
                        slice.base_file = Some(BaseFile {
                            path: entry.path.clone(),
                            name: base,
                            len: entry.len,
                        });
                    }
                    Some(DataFileName::Log(log)) => {
                        let slice = slices
                            .entry((partition.clone(), log.file_id.clone(), log.base_instant_time.clone()))
                            .or_insert_with(|| {
                                FileSlice::new(partition, &log.file_id, &log.base_instant_time)
                            });
                        slice.log_files.push(LogFile {
                            path: entry.path.clone(),
                            name: log,
                            len: entry.len,
                        });
                    }
                    _ => {}
                }
            }
        }

        let mut groups: BTreeMap<(String, String), FileGroup> = BTreeMap::new();
        for ((partition, file_id, _), mut slice) in slices {
            slice.log_files.sort_by(|a, b| {
                a.name
                    .version
                    .cmp(&b.name.version)
                    .then_with(|| a.name.write_token.cmp(&b.name.write_token))
            });
            groups
                .entry((partition.clone(), file_id.clone()))
                .or_insert_with(|| FileGroup {
                    partition_path: partition,
                    file_id,
                    slices: Vec::new(),
                })
                .slices
                .push(slice);
        }

        debug!(
            base_path = %base_path.display(),
            partitions = partitions.len(),
            file_groups = groups.len(),
            "built file system view"
        );
        Ok(Self {
            base_path: base_path.to_path_buf(),
            committed,
            groups,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn committed(&self) -> &CommittedInstants {
        &self.committed
    }

    pub fn partitions(&self) -> Vec<&str> {
        let mut partitions: Vec<&str> = self.groups.keys().map(|(p, _)| p.as_str()).collect();
        partitions.dedup();
        partitions
    }

    pub fn all_file_groups(&self) -> impl Iterator<Item = &FileGroup> {
        self.groups.values()
    }

    pub fn file_groups<'a>(&'a self, partition_path: &'a str) -> impl Iterator<Item = &'a FileGroup> + 'a {
        self.groups
            .values()
            .filter(move |g| g.partition_path == partition_path)
    }

    pub fn file_group(&self, partition_path: &str, file_id: &str) -> Option<&FileGroup> {
        self.groups
            .get(&(partition_path.to_string(), file_id.to_string()))
    }

    pub fn latest_file_slices<'a>(&'a self, partition_path: &'a str) -> impl Iterator<Item = &'a FileSlice> + 'a {
        self.file_groups(partition_path)
            .filter_map(|g| g.latest_slice())
    }

    /// Latest committed base file per file group of the partition.
    pub fn latest_base_files<'a>(&'a self, partition_path: &'a str) -> impl Iterator<Item = &'a BaseFile> + 'a {
        self.file_groups(partition_path).filter_map(|g| {
            g.slices
                .iter()
                .rev()
                .find_map(|s| s.base_file.as_ref())
        })
    }
}
