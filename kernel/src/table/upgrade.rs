// Upgrade / Downgrade
//
// Moves a table between layout versions before a write client touches it.
//
// 0 -> 1: version 0 writers left no markers, so pending writes are rolled
//         back by listing before markers become authoritative.
// 1 -> 0: pending writes are rolled back from their markers, then the
//         marker root is dropped.

use std::sync::Arc;

use tracing::info;

use super::meta::{TableMetaClient, CURRENT_TABLE_VERSION};
use super::TableError;
use crate::config::WriteConfig;
use crate::executor::ParallelExecutor;
use crate::rollback::{RollbackContext, RollbackCoordinator, RollbackStrategy};
use crate::timeline::{ActiveTimeline, InstantState};

pub fn needs_upgrade_or_downgrade(meta: &TableMetaClient, to_version: u32) -> bool {
    meta.version() != to_version
}

/// Bring the table to `to_version`, one version step at a time.
pub fn run(
    meta: &mut TableMetaClient,
    timeline: &mut ActiveTimeline,
    config: &WriteConfig,
    executor: &ParallelExecutor,
    to_version: u32,
) -> Result<(), TableError> {
    if to_version > CURRENT_TABLE_VERSION {
        return Err(TableError::UnsupportedVersion(to_version));
    }

    while meta.version() != to_version {
        let from = meta.version();
        if from < to_version {
            upgrade_step(meta, timeline, config, executor, from)?;
        } else {
            downgrade_step(meta, timeline, config, executor, from)?;
        }
        info!(
            base_path = %meta.base_path().display(),
            from,
            to = meta.version(),
            "changed table version"
        );
    }
    Ok(())
}

fn coordinator(
    meta: &TableMetaClient,
    config: &WriteConfig,
    executor: &ParallelExecutor,
    use_markers: bool,
) -> RollbackCoordinator {
    let ctx = RollbackContext {
        fs: Arc::clone(meta.fs()),
        base_path: meta.base_path().to_path_buf(),
        executor: executor.clone(),
        parallelism: config.rollback.parallelism,
        assume_date_partitioning: config.assume_date_partitioning,
    };
    let strategy = if use_markers {
        RollbackStrategy::marker_based(ctx.clone())
    } else {
        RollbackStrategy::listing_based(ctx.clone())
    };
    RollbackCoordinator::new(strategy, ctx, config.markers_delete_parallelism)
}

fn rollback_pending_writes(
    timeline: &mut ActiveTimeline,
    coordinator: &RollbackCoordinator,
) -> Result<(), TableError> {
    // A REQUESTED write has not touched any file yet.
    let pending: Vec<String> = timeline
        .pending_writes()
        .filter(|i| i.state == InstantState::Inflight)
        .map(|i| i.timestamp.clone())
        .collect();
    for instant_time in pending {
        coordinator.rollback(timeline, &instant_time, true)?;
    }
    Ok(())
}

fn upgrade_step(
    meta: &mut TableMetaClient,
    timeline: &mut ActiveTimeline,
    config: &WriteConfig,
    executor: &ParallelExecutor,
    from: u32,
) -> Result<(), TableError> {
    match from {
        0 => {
            let listing = coordinator(meta, config, executor, false);
            rollback_pending_writes(timeline, &listing)?;
            meta.set_version(1)
        }
        other => Err(TableError::UnsupportedVersion(other)),
    }
}

fn downgrade_step(
    meta: &mut TableMetaClient,
    timeline: &mut ActiveTimeline,
    config: &WriteConfig,
    executor: &ParallelExecutor,
    from: u32,
) -> Result<(), TableError> {
    match from {
        1 => {
            let markers = coordinator(meta, config, executor, true);
            rollback_pending_writes(timeline, &markers)?;

            let temp = meta.temp_path();
            meta.fs()
                .delete_dir(&temp)
                .map_err(|e| TableError::io(&temp, e))?;
            meta.set_version(0)
        }
        other => Err(TableError::UnsupportedVersion(other)),
    }
}
