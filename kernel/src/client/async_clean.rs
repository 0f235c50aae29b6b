// Async Cleaner Service
//
// Runs the cleaner on a background thread while a write executes. The
// write client owns the handle and joins it before committing; failures
// are logged and never reach the foreground write.

use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::table::clean::{CleanStats, Cleaner};
use crate::table::TableError;
use crate::timeline::Instant;

#[derive(Debug)]
pub struct AsyncCleanerService {
    instant_time: String,
    handle: Option<JoinHandle<Result<CleanStats, TableError>>>,
}

impl AsyncCleanerService {
    /// Start cleaning against `instants`, a snapshot of the active
    /// timeline taken when `instant_time` began.
    pub fn start(cleaner: Cleaner, instants: Vec<Instant>, instant_time: &str) -> Self {
        let spawned = thread::Builder::new()
            .name(format!("async-cleaner-{instant_time}"))
            .spawn(move || cleaner.clean(&instants));

        let handle = match spawned {
            Ok(handle) => {
                info!(instant = %instant_time, "started async cleaner");
                Some(handle)
            }
            Err(e) => {
                warn!(instant = %instant_time, error = %e, "failed to start async cleaner");
                None
            }
        };

        Self {
            instant_time: instant_time.to_string(),
            handle,
        }
    }

    pub fn instant_time(&self) -> &str {
        &self.instant_time
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// Wait for the cleaner to finish. `None` when it never started or
    /// failed.
    pub fn join(mut self) -> Option<CleanStats> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                warn!(instant = %self.instant_time, error = %e, "async cleaner failed");
                None
            }
            Err(_) => {
                warn!(instant = %self.instant_time, "async cleaner panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteConfig;
    use crate::fs::naming::{BaseFileName, WriteToken};
    use crate::fs::{FileSystem, LocalFileSystem};
    use crate::schema::{Field, FieldType, RecordSchema};
    use crate::timeline::Action;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn join_returns_clean_stats() {
        let dir = TempDir::new().unwrap();
        let mut instants = Vec::new();
        for ts in ["001", "002"] {
            let name = BaseFileName::new("fg1", &WriteToken::new(0, 0, 0), ts, "parquet");
            LocalFileSystem
                .create_durable_empty(&dir.path().join("p").join(name.file_name()))
                .unwrap();
            instants.push(Instant::completed(ts, Action::Commit));
        }
        let schema = RecordSchema::new(vec![Field::new("id", FieldType::Utf8, false)], "id", None);
        let mut config = WriteConfig::new(dir.path(), "t", schema);
        config.clean.retained_file_versions = 1;

        let service = AsyncCleanerService::start(
            Cleaner::new(Arc::new(LocalFileSystem), config),
            instants,
            "003",
        );
        assert!(service.is_started());

        let stats = service.join().unwrap();
        assert_eq!(stats.deleted_files.len(), 1);
    }

    #[test]
    fn failed_clean_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let schema = RecordSchema::new(vec![Field::new("id", FieldType::Utf8, false)], "id", None);
        // A base path that is a regular file cannot be listed.
        let base = dir.path().join("not-a-dir");
        LocalFileSystem.create_durable_empty(&base).unwrap();
        let config = WriteConfig::new(&base, "t", schema);

        let service = AsyncCleanerService::start(
            Cleaner::new(Arc::new(LocalFileSystem), config),
            vec![Instant::completed("001", Action::Commit)],
            "002",
        );
        assert!(service.join().is_none());
    }
}
