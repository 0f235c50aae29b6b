// Timeline Storage Abstraction
//
// Defines the durability contract for the active timeline.
// Implementations may persist to disk, object storage, databases, etc.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{Instant, TimelineError};
use crate::fs::naming::ARCHIVE_FOLDER_NAME;
use crate::fs::FileSystem;

/// Storage backend for the active timeline.
///
/// Properties required from implementations:
/// - One record per (timestamp, action, state)
/// - Completed records appear atomically together with their details
/// - `load` returns records ordered by timestamp, then state
///
/// Implementations MUST NOT:
/// - Mutate the details of a completed record
pub trait TimelineStore: Send + Sync {
    /// Persist the record for this exact instant state.
    fn save(&self, instant: &Instant, details: Option<&[u8]>) -> Result<(), TimelineError>;

    /// Remove the record for this exact instant state, if present.
    fn remove(&self, instant: &Instant) -> Result<(), TimelineError>;

    /// Load every active record in order.
    ///
    /// Used for deterministic replay.
    fn load(&self) -> Result<Vec<Instant>, TimelineError>;

    /// Details stored with the record. Empty details read as `None`.
    fn read_details(&self, instant: &Instant) -> Result<Option<Vec<u8>>, TimelineError>;

    /// Move every state record of the given instants to the archive.
    fn archive(&self, instants: &[Instant]) -> Result<(), TimelineError>;

    /// Load the archived records in order.
    fn load_archived(&self) -> Result<Vec<Instant>, TimelineError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    active: BTreeMap<Instant, Option<Vec<u8>>>,
    archived: BTreeMap<Instant, Option<Vec<u8>>>,
}

/// Volatile store, used by tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTimelineStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryTimelineStore {
    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl TimelineStore for InMemoryTimelineStore {
    fn save(&self, instant: &Instant, details: Option<&[u8]>) -> Result<(), TimelineError> {
        self.with_state(|s| {
            s.active
                .insert(instant.clone(), details.map(<[u8]>::to_vec));
        });
        Ok(())
    }

    fn remove(&self, instant: &Instant) -> Result<(), TimelineError> {
        self.with_state(|s| s.active.remove(instant));
        Ok(())
    }

    fn load(&self) -> Result<Vec<Instant>, TimelineError> {
        Ok(self.with_state(|s| s.active.keys().cloned().collect()))
    }

    fn read_details(&self, instant: &Instant) -> Result<Option<Vec<u8>>, TimelineError> {
        Ok(self.with_state(|s| {
            s.active
                .get(instant)
                .cloned()
                .flatten()
                .filter(|d| !d.is_empty())
        }))
    }

    fn archive(&self, instants: &[Instant]) -> Result<(), TimelineError> {
        self.with_state(|s| {
            let moved: Vec<Instant> = s
                .active
                .keys()
                .filter(|k| {
                    instants
                        .iter()
                        .any(|i| i.timestamp == k.timestamp && i.action == k.action)
                })
                .cloned()
                .collect();
            for key in moved {
                if let Some(details) = s.active.remove(&key) {
                    s.archived.insert(key, details);
                }
            }
        });
        Ok(())
    }

    fn load_archived(&self) -> Result<Vec<Instant>, TimelineError> {
        Ok(self.with_state(|s| s.archived.keys().cloned().collect()))
    }
}

/// Store keeping one file per instant state under the table's
/// metadata folder.
///
/// Completed records are written to a temporary file and renamed into
/// place, so readers never observe a half-written commit.
#[derive(Debug, Clone)]
pub struct FsTimelineStore {
    fs: Arc<dyn FileSystem>,
    meta_path: PathBuf,
}

impl FsTimelineStore {
    pub fn new(fs: Arc<dyn FileSystem>, meta_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            meta_path: meta_path.into(),
        }
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    fn archive_path(&self) -> PathBuf {
        self.meta_path.join(ARCHIVE_FOLDER_NAME)
    }

    fn list_instants(&self, dir: &Path) -> Result<Vec<Instant>, TimelineError> {
        if !self.fs.exists(dir) {
            return Ok(Vec::new());
        }

        let mut instants: Vec<Instant> = self
            .fs
            .list(dir)?
            .into_iter()
            .filter(|status| !status.is_dir)
            .filter_map(|status| {
                let name = status.path.file_name()?.to_str()?.to_string();
                Instant::parse_file_name(&name).ok()
            })
            .collect();
        instants.sort();
        Ok(instants)
    }
}

impl TimelineStore for FsTimelineStore {
    fn save(&self, instant: &Instant, details: Option<&[u8]>) -> Result<(), TimelineError> {
        let target = self.meta_path.join(instant.file_name());
        let staging = self.meta_path.join(format!(".{}.tmp", instant.file_name()));

        let mut out = self.fs.create(&staging, true)?;
        if let Some(bytes) = details {
            out.write_all(bytes)?;
        }
        out.flush()?;
        drop(out);

        self.fs.rename(&staging, &target)?;
        Ok(())
    }

    fn remove(&self, instant: &Instant) -> Result<(), TimelineError> {
        self.fs.delete(&self.meta_path.join(instant.file_name()))?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<Instant>, TimelineError> {
        self.list_instants(&self.meta_path)
    }

    fn read_details(&self, instant: &Instant) -> Result<Option<Vec<u8>>, TimelineError> {
        let path = self.meta_path.join(instant.file_name());
        if !self.fs.exists(&path) {
            return Ok(None);
        }
        let bytes = self.fs.read(&path)?;
        Ok(Some(bytes).filter(|b| !b.is_empty()))
    }

    fn archive(&self, instants: &[Instant]) -> Result<(), TimelineError> {
        let archive = self.archive_path();
        self.fs.mkdirs(&archive)?;

        for record in self.load()? {
            let archived = instants
                .iter()
                .any(|i| i.timestamp == record.timestamp && i.action == record.action);
            if archived {
                let name = record.file_name();
                self.fs
                    .rename(&self.meta_path.join(&name), &archive.join(&name))?;
            }
        }
        Ok(())
    }

    fn load_archived(&self) -> Result<Vec<Instant>, TimelineError> {
        self.list_instants(&self.archive_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::timeline::Action;
    use tempfile::TempDir;

    fn stores(dir: &TempDir) -> Vec<Box<dyn TimelineStore>> {
        vec![
            Box::new(InMemoryTimelineStore::default()),
            Box::new(FsTimelineStore::new(
                Arc::new(LocalFileSystem),
                dir.path().join(".tidemark"),
            )),
        ]
    }

    #[test]
    fn save_load_and_details() {
        let dir = TempDir::new().unwrap();
        for store in stores(&dir) {
            let requested = Instant::requested("002", Action::Commit);
            let completed = Instant::completed("001", Action::Commit);

            store.save(&requested, None).unwrap();
            store.save(&completed, Some(b"meta")).unwrap();

            assert_eq!(store.load().unwrap(), vec![completed.clone(), requested.clone()]);
            assert_eq!(store.read_details(&completed).unwrap(), Some(b"meta".to_vec()));
            assert_eq!(store.read_details(&requested).unwrap(), None);

            store.remove(&requested).unwrap();
            assert_eq!(store.load().unwrap(), vec![completed]);
        }
    }

    #[test]
    fn archive_moves_every_state() {
        let dir = TempDir::new().unwrap();
        for store in stores(&dir) {
            let requested = Instant::requested("001", Action::DeltaCommit);
            let completed = Instant::completed("001", Action::DeltaCommit);
            let later = Instant::completed("002", Action::DeltaCommit);
            store.save(&requested, None).unwrap();
            store.save(&completed, None).unwrap();
            store.save(&later, None).unwrap();

            store.archive(&[completed.clone()]).unwrap();

            assert_eq!(store.load().unwrap(), vec![later]);
            assert_eq!(store.load_archived().unwrap(), vec![requested, completed]);
        }
    }
}
