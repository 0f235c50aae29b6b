// Listing-Based Rollback
//
// Scans every partition for files the instant wrote. Base files carrying
// the instant time are deleted; log files holding blocks of the instant
// get a command block invalidating them, as log files are shared across
// instants.

use tracing::debug;

use super::marker::{delete_into, invalidate_log_blocks};
use super::{RollbackContext, RollbackFailure, RollbackStat, RollbackStats};
use crate::fs::naming::{partition_dir, DataFileName};
use crate::fs::partition::list_partitions;
use crate::io::log::LogWriter;
use crate::timeline::Instant;

#[derive(Debug, Clone)]
pub struct ListingBasedRollback {
    ctx: RollbackContext,
}

impl ListingBasedRollback {
    pub fn new(ctx: RollbackContext) -> Self {
        Self { ctx }
    }

    pub fn execute(
        &self,
        instant: &Instant,
        rollback_instant_time: &str,
    ) -> Result<RollbackStats, RollbackFailure> {
        let fs = self.ctx.fs.as_ref();
        let partitions = list_partitions(fs, &self.ctx.base_path, self.ctx.assume_date_partitioning)
            .map_err(|source| RollbackFailure::Io {
                path: self.ctx.base_path.display().to_string(),
                source,
            })?;
        debug!(
            instant = %instant.timestamp,
            partitions = partitions.len(),
            "rolling back by listing"
        );

        let stats = self.ctx.executor.map_to_pair_and_reduce_by_key(
            partitions,
            self.ctx.parallelism,
            |partition| {
                let dir = partition_dir(&self.ctx.base_path, &partition);
                let entries = fs.list(&dir).map_err(|source| RollbackFailure::Io {
                    path: dir.display().to_string(),
                    source,
                })?;

                let mut stat = RollbackStat::new(&partition);
                for entry in entries.iter().filter(|e| !e.is_dir) {
                    let Some(name) = entry.path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    match DataFileName::parse(name) {
                        Some(DataFileName::Base(base)) if base.instant_time == instant.timestamp => {
                            delete_into(fs, &entry.path, &mut stat);
                        }
                        Some(DataFileName::Log(_)) => {
                            let writer = LogWriter::new(fs, &entry.path);
                            let scan = writer.scan()?;
                            let written_by_instant = scan
                                .blocks
                                .iter()
                                .any(|b| b.block.header.instant_time == instant.timestamp);
                            let already_undone =
                                scan.rolled_back_instants().contains(instant.timestamp.as_str());
                            if written_by_instant && !already_undone {
                                invalidate_log_blocks(
                                    &writer,
                                    &scan,
                                    &instant.timestamp,
                                    rollback_instant_time,
                                    &mut stat,
                                )?;
                            }
                        }
                        _ => {}
                    }
                }
                Ok::<_, RollbackFailure>((partition, stat))
            },
            RollbackStat::merge,
        )?;

        Ok(stats.into_iter().filter(|(_, stat)| !stat.is_empty()).collect())
    }
}
