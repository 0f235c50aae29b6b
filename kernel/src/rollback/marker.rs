// Marker-Based Rollback
//
// Replays the markers an instant left behind. Each marker is undone
// independently; results are merged per partition.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{RollbackContext, RollbackFailure, RollbackStat, RollbackStats};
use crate::fs::naming::{partition_dir, BaseFileName};
use crate::fs::FileSystem;
use crate::io::log::{LogBlock, LogScan, LogWriter};
use crate::markers::{IoType, Marker, MarkerStore};
use crate::timeline::Instant;

#[derive(Debug, Clone)]
pub struct MarkerBasedRollback {
    ctx: RollbackContext,
}

impl MarkerBasedRollback {
    pub fn new(ctx: RollbackContext) -> Self {
        Self { ctx }
    }

    pub fn execute(
        &self,
        instant: &Instant,
        rollback_instant_time: &str,
    ) -> Result<RollbackStats, RollbackFailure> {
        let markers = MarkerStore::new(
            Arc::clone(&self.ctx.fs),
            &self.ctx.base_path,
            &instant.timestamp,
        );
        let marker_paths = markers.list_all()?;
        debug!(
            instant = %instant.timestamp,
            markers = marker_paths.len(),
            "rolling back using markers"
        );

        let stats = self.ctx.executor.map_to_pair_and_reduce_by_key(
            marker_paths,
            self.ctx.parallelism,
            |marker_path| {
                let marker = Marker::parse(&marker_path)?;
                let path = markers.data_file(&marker_path);
                let stat = self.undo(&marker, &path, &instant.timestamp, rollback_instant_time)?;
                Ok::<_, RollbackFailure>((marker.partition_path, stat))
            },
            RollbackStat::merge,
        )?;

        Ok(stats.into_iter().collect())
    }

    fn undo(
        &self,
        marker: &Marker,
        path: &Path,
        instant_time: &str,
        rollback_instant_time: &str,
    ) -> Result<RollbackStat, RollbackFailure> {
        match marker.io_type {
            IoType::Create => Ok(self.undo_create(marker, path)),
            IoType::Merge => Ok(self.undo_merge(marker, path, instant_time)),
            IoType::Append => self.undo_append(marker, path, instant_time, rollback_instant_time),
        }
    }

    fn undo_create(&self, marker: &Marker, path: &Path) -> RollbackStat {
        let mut stat = RollbackStat::new(&marker.partition_path);
        delete_into(self.ctx.fs.as_ref(), path, &mut stat);
        stat
    }

    /// Delete the new version; the prior version of the file group must
    /// still be present for the rollback to count as successful.
    fn undo_merge(&self, marker: &Marker, path: &Path, instant_time: &str) -> RollbackStat {
        let mut stat = self.undo_create(marker, path);

        let Some(new_version) = BaseFileName::parse(&marker.file_name) else {
            return stat;
        };
        if !self.has_prior_version(&marker.partition_path, &new_version, instant_time) {
            error!(
                instant = %instant_time,
                path = %path.display(),
                "no prior version left after undoing merge"
            );
            let path = path.display().to_string();
            stat.success_delete_files.remove(&path);
            stat.failed_delete_files.insert(path);
        }
        stat
    }

    fn has_prior_version(&self, partition_path: &str, new_version: &BaseFileName, instant_time: &str) -> bool {
        let dir = partition_dir(&self.ctx.base_path, partition_path);
        let Ok(entries) = self.ctx.fs.list(&dir) else {
            return false;
        };

        entries
            .iter()
            .filter_map(|e| e.path.file_name()?.to_str().and_then(BaseFileName::parse))
            .any(|b| b.file_id == new_version.file_id && b.instant_time.as_str() < instant_time)
    }

    /// Log files are shared across instants: append a command block
    /// invalidating what the instant wrote instead of deleting.
    fn undo_append(
        &self,
        marker: &Marker,
        path: &Path,
        instant_time: &str,
        rollback_instant_time: &str,
    ) -> Result<RollbackStat, RollbackFailure> {
        let mut stat = RollbackStat::new(&marker.partition_path);
        if !self.ctx.fs.exists(path) {
            warn!(instant = %instant_time, path = %path.display(), "log file to roll back is missing");
            return Ok(stat);
        }

        let writer = LogWriter::new(self.ctx.fs.as_ref(), path);
        let scan = writer.scan()?;
        invalidate_log_blocks(&writer, &scan, instant_time, rollback_instant_time, &mut stat)?;
        Ok(stat)
    }
}

/// Append a command block invalidating everything `instant_time` wrote to
/// the log, unless one is already there, and record the valid length.
pub(super) fn invalidate_log_blocks(
    writer: &LogWriter<'_>,
    scan: &LogScan,
    instant_time: &str,
    rollback_instant_time: &str,
    stat: &mut RollbackStat,
) -> Result<(), RollbackFailure> {
    let valid_offset = scan.valid_offset_before(instant_time);
    let key = writer.path().display().to_string();

    if !scan.rolled_back_instants().contains(instant_time) {
        writer.append(&LogBlock::rollback_command(
            rollback_instant_time,
            instant_time,
            valid_offset,
        ))?;
        stat.command_blocks_count.insert(key.clone(), 1);
    }
    stat.written_file_size_map.insert(key, valid_offset);
    Ok(())
}

/// Delete one file into `stat`. A file that is already gone counts as
/// deleted.
pub(super) fn delete_into(fs: &dyn FileSystem, path: &Path, stat: &mut RollbackStat) {
    let key = path.display().to_string();
    match fs.delete(path) {
        Ok(_) => {
            stat.success_delete_files.insert(key);
        }
        Err(e) => {
            warn!(path = %key, error = %e, "failed to delete file during rollback");
            stat.failed_delete_files.insert(key);
        }
    }
}
