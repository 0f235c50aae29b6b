// Cleaner
//
// Deletes file slices that fell out of the retention window. Each file
// group keeps its newest `retained_file_versions` slices; older slices
// lose their base file and every log file.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::view::FileSystemView;
use super::TableError;
use crate::config::WriteConfig;
use crate::fs::FileSystem;
use crate::timeline::Instant;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanStats {
    pub deleted_files: Vec<String>,
    pub failed_files: Vec<String>,
    pub file_groups_cleaned: usize,
}

#[derive(Debug, Clone)]
pub struct Cleaner {
    fs: Arc<dyn FileSystem>,
    config: WriteConfig,
}

impl Cleaner {
    pub fn new(fs: Arc<dyn FileSystem>, config: WriteConfig) -> Self {
        Self { fs, config }
    }

    /// Clean against a snapshot of the active timeline.
    pub fn clean(&self, instants: &[Instant]) -> Result<CleanStats, TableError> {
        let retained = self.config.clean.retained_file_versions.max(1);
        let view = FileSystemView::build(
            self.fs.as_ref(),
            &self.config.base_path,
            instants,
            self.config.assume_date_partitioning,
        )?;

        let mut stats = CleanStats::default();
        for group in view.all_file_groups() {
            if group.slices.len() <= retained {
                continue;
            }
            let expired = &group.slices[..group.slices.len() - retained];
            for slice in expired {
                if let Some(base) = &slice.base_file {
                    self.delete(&base.path, &mut stats);
                }
                for log in &slice.log_files {
                    self.delete(&log.path, &mut stats);
                }
            }
            stats.file_groups_cleaned += 1;
        }

        info!(
            base_path = %self.config.base_path.display(),
            deleted = stats.deleted_files.len(),
            failed = stats.failed_files.len(),
            "cleaned file slices"
        );
        Ok(stats)
    }

    fn delete(&self, path: &Path, stats: &mut CleanStats) {
        let key = path.display().to_string();
        match self.fs.delete(path) {
            Ok(_) => stats.deleted_files.push(key),
            Err(e) => {
                warn!(path = %key, error = %e, "failed to clean file");
                stats.failed_files.push(key);
            }
        }
    }
}
