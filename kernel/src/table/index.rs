// Record Index
//
// Maps record keys to the file group holding them. The index is loaded
// from the latest file slices on first use and learns new locations
// only from committed writes.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use super::view::FileSystemView;
use super::{TableError, WriteStatus};
use crate::fs::FileSystem;
use crate::record::{Record, RecordKey, RecordLocation};
use crate::schema::RecordSchema;

#[derive(Debug, Default)]
pub struct InMemoryHashIndex {
    locations: RwLock<Option<HashMap<RecordKey, RecordLocation>>>,
}

impl InMemoryHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.read(|locations| locations.is_some())
    }

    /// Load every key of the latest file slices, unless already loaded.
    pub fn ensure_loaded(
        &self,
        fs: &dyn FileSystem,
        view: &FileSystemView,
        schema: &RecordSchema,
    ) -> Result<(), TableError> {
        if self.is_loaded() {
            return Ok(());
        }

        let mut locations = HashMap::new();
        for group in view.all_file_groups() {
            let Some(slice) = group.latest_slice() else {
                continue;
            };
            for (_, record) in slice.read_records(fs, schema, view.committed())? {
                if let Some(location) = record.current_location {
                    locations.insert(record.key, location);
                }
            }
        }
        debug!(keys = locations.len(), "loaded record index");

        self.write(|current| {
            current.get_or_insert(locations);
        });
        Ok(())
    }

    /// Attach the known location to every record.
    pub fn tag_location(&self, records: Vec<Record>) -> Vec<Record> {
        self.read(|locations| {
            records
                .into_iter()
                .map(|record| {
                    let location = locations
                        .as_ref()
                        .and_then(|l| l.get(&record.key))
                        .cloned();
                    record.with_location(location)
                })
                .collect()
        })
    }

    pub fn location_of(&self, key: &RecordKey) -> Option<RecordLocation> {
        self.read(|locations| locations.as_ref()?.get(key).cloned())
    }

    /// Learn the locations of a committed write.
    pub fn update_location(&self, statuses: &[WriteStatus]) {
        self.write(|current| {
            let Some(locations) = current.as_mut() else {
                return;
            };
            for status in statuses {
                for (key, location) in &status.written {
                    locations.insert(key.clone(), location.clone());
                }
                for key in &status.deleted {
                    locations.remove(key);
                }
            }
        });
    }

    /// Forget everything; the next write reloads from the table.
    pub fn invalidate(&self) {
        self.write(|current| *current = None);
    }

    fn read<R>(&self, f: impl FnOnce(&Option<HashMap<RecordKey, RecordLocation>>) -> R) -> R {
        let guard = match self.locations.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Option<HashMap<RecordKey, RecordLocation>>) -> R) -> R {
        let mut guard = match self.locations.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::WriteStat;
    use serde_json::Map;

    fn record(key: &str) -> Record {
        Record {
            key: RecordKey::new(key, "p"),
            current_location: None,
            data: Map::new(),
        }
    }

    fn loaded() -> InMemoryHashIndex {
        let index = InMemoryHashIndex::new();
        index.write(|l| *l = Some(HashMap::new()));
        index
    }

    #[test]
    fn committed_writes_are_learned() {
        let index = loaded();
        let location = RecordLocation {
            file_id: "fg1".into(),
            instant_time: "001".into(),
        };
        index.update_location(&[WriteStatus {
            stat: WriteStat::default(),
            written: vec![(RecordKey::new("a", "p"), location.clone())],
            ..Default::default()
        }]);

        let tagged = index.tag_location(vec![record("a"), record("b")]);
        assert_eq!(tagged[0].current_location, Some(location));
        assert!(!tagged[1].is_tagged());
    }

    #[test]
    fn deletes_are_forgotten() {
        let index = loaded();
        let key = RecordKey::new("a", "p");
        index.update_location(&[WriteStatus {
            written: vec![(
                key.clone(),
                RecordLocation {
                    file_id: "fg1".into(),
                    instant_time: "001".into(),
                },
            )],
            ..Default::default()
        }]);
        index.update_location(&[WriteStatus {
            deleted: vec![key.clone()],
            ..Default::default()
        }]);

        assert_eq!(index.location_of(&key), None);
    }

    #[test]
    fn unloaded_index_ignores_updates() {
        let index = InMemoryHashIndex::new();
        index.update_location(&[WriteStatus {
            deleted: vec![RecordKey::new("a", "p")],
            ..Default::default()
        }]);
        assert!(!index.is_loaded());
    }
}
