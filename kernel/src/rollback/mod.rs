// Rollback
//
// Reverts the file effects of one instant. Two interchangeable
// strategies produce per-partition undo statistics: replaying the
// instant's markers, or listing partitions for files it wrote. The
// coordinator runs the chosen strategy, drops the marker directory,
// removes the instant from the active timeline and records a completed
// rollback instant. Completed instants have no markers left and are
// always undone by listing.

pub mod listing;
pub mod marker;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::WriteConfig;
use crate::executor::{ExecutorError, ParallelExecutor};
use crate::fs::FileSystem;
use crate::io::log::LogFormatError;
use crate::markers::{MarkerError, MarkerStore};
use crate::timeline::{new_instant_time, Action, ActiveTimeline, Instant, InstantState, TimelineError};

pub use listing::ListingBasedRollback;
pub use marker::MarkerBasedRollback;

/// Undo actions taken in one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStat {
    pub partition_path: String,
    /// Files confirmed gone.
    pub success_delete_files: BTreeSet<String>,
    /// Files that could not be confirmed gone.
    pub failed_delete_files: BTreeSet<String>,
    /// Log file path -> logical length after the undo.
    pub written_file_size_map: BTreeMap<String, u64>,
    /// Log file path -> command blocks appended.
    pub command_blocks_count: BTreeMap<String, u64>,
}

/// Partition path -> merged stat.
pub type RollbackStats = BTreeMap<String, RollbackStat>;

impl RollbackStat {
    pub fn new(partition_path: &str) -> Self {
        Self {
            partition_path: partition_path.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.success_delete_files.is_empty()
            && self.failed_delete_files.is_empty()
            && self.written_file_size_map.is_empty()
            && self.command_blocks_count.is_empty()
    }

    /// Combine two stats of the same partition.
    ///
    /// Associative and commutative. A path that failed in either input
    /// is failed in the result; counters are summed per path.
    pub fn merge(self, other: RollbackStat) -> RollbackStat {
        let mut failed = self.failed_delete_files;
        failed.extend(other.failed_delete_files);

        let success = self
            .success_delete_files
            .into_iter()
            .chain(other.success_delete_files)
            .filter(|p| !failed.contains(p))
            .collect();

        let partition_path = if self.partition_path.is_empty() {
            other.partition_path
        } else {
            self.partition_path
        };

        RollbackStat {
            partition_path,
            success_delete_files: success,
            failed_delete_files: failed,
            written_file_size_map: sum_maps(self.written_file_size_map, other.written_file_size_map),
            command_blocks_count: sum_maps(self.command_blocks_count, other.command_blocks_count),
        }
    }
}

fn sum_maps(mut left: BTreeMap<String, u64>, right: BTreeMap<String, u64>) -> BTreeMap<String, u64> {
    for (path, value) in right {
        *left.entry(path).or_insert(0) += value;
    }
    left
}

/// Why a rollback failed.
#[derive(Debug, thiserror::Error)]
pub enum RollbackFailure {
    #[error("unknown marker type `{0}`")]
    UnknownMarkerType(String),

    #[error("marker error: {0}")]
    Marker(MarkerError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("log error: {0}")]
    LogFormat(#[from] LogFormatError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("timeline error: {0}")]
    Timeline(#[from] TimelineError),

    #[error("rollback not allowed: {0}")]
    NotAllowed(String),

    #[error("failed to serialize rollback metadata: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<MarkerError> for RollbackFailure {
    fn from(err: MarkerError) -> Self {
        match err {
            MarkerError::UnknownIoType(io_type) => RollbackFailure::UnknownMarkerType(io_type),
            MarkerError::Executor(e) => RollbackFailure::Executor(e),
            other => RollbackFailure::Marker(other),
        }
    }
}

/// A failed rollback, tagged with the instant being rolled back.
#[derive(Debug, thiserror::Error)]
#[error("failed to roll back instant {instant}: {source}")]
pub struct RollbackError {
    pub instant: String,
    #[source]
    pub source: RollbackFailure,
}

impl RollbackError {
    pub fn new(instant: &str, source: impl Into<RollbackFailure>) -> Self {
        Self {
            instant: instant.to_string(),
            source: source.into(),
        }
    }

    /// The instant left intents this build cannot undo.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.source, RollbackFailure::UnknownMarkerType(_))
    }
}

/// What a strategy needs to reach the table's files.
#[derive(Debug, Clone)]
pub struct RollbackContext {
    pub fs: Arc<dyn FileSystem>,
    pub base_path: PathBuf,
    pub executor: ParallelExecutor,
    pub parallelism: usize,
    pub assume_date_partitioning: bool,
}

/// How undo actions are discovered. Fixed per write session.
#[derive(Debug, Clone)]
pub enum RollbackStrategy {
    MarkerBased(MarkerBasedRollback),
    ListingBased(ListingBasedRollback),
}

impl RollbackStrategy {
    pub fn marker_based(ctx: RollbackContext) -> Self {
        RollbackStrategy::MarkerBased(MarkerBasedRollback::new(ctx))
    }

    pub fn listing_based(ctx: RollbackContext) -> Self {
        RollbackStrategy::ListingBased(ListingBasedRollback::new(ctx))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RollbackStrategy::MarkerBased(_) => "marker-based",
            RollbackStrategy::ListingBased(_) => "listing-based",
        }
    }

    /// Undo every file effect of `instant`. Command blocks appended to
    /// log files are attributed to `rollback_instant_time`.
    pub fn execute(
        &self,
        instant: &Instant,
        rollback_instant_time: &str,
    ) -> Result<RollbackStats, RollbackError> {
        let result = match self {
            RollbackStrategy::MarkerBased(s) => s.execute(instant, rollback_instant_time),
            RollbackStrategy::ListingBased(s) => s.execute(instant, rollback_instant_time),
        };
        result.map_err(|e| RollbackError::new(&instant.timestamp, e))
    }
}

/// Metadata stored with a completed rollback instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMetadata {
    pub rollback_instant_time: String,
    pub rolled_back_instant: Instant,
    pub strategy: String,
    pub total_files_deleted: usize,
    pub total_failed_deletes: usize,
    pub partition_metadata: RollbackStats,
}

/// Runs one strategy against the active timeline.
#[derive(Debug, Clone)]
pub struct RollbackCoordinator {
    strategy: RollbackStrategy,
    ctx: RollbackContext,
    markers_delete_parallelism: usize,
}

impl RollbackCoordinator {
    pub fn new(strategy: RollbackStrategy, ctx: RollbackContext, markers_delete_parallelism: usize) -> Self {
        Self {
            strategy,
            ctx,
            markers_delete_parallelism,
        }
    }

    /// Strategy chosen by `rollback.use_markers`.
    pub fn from_config(fs: Arc<dyn FileSystem>, config: &WriteConfig, executor: ParallelExecutor) -> Self {
        let ctx = RollbackContext {
            fs,
            base_path: config.base_path.clone(),
            executor,
            parallelism: config.rollback.parallelism,
            assume_date_partitioning: config.assume_date_partitioning,
        };
        let strategy = if config.rollback.use_markers {
            RollbackStrategy::marker_based(ctx.clone())
        } else {
            RollbackStrategy::listing_based(ctx.clone())
        };
        Self::new(strategy, ctx, config.markers_delete_parallelism)
    }

    pub fn strategy(&self) -> &RollbackStrategy {
        &self.strategy
    }

    /// Roll back `instant_time`.
    ///
    /// An instant that is not on the active timeline has nothing left to
    /// undo and yields empty stats. A completed instant can only be rolled
    /// back while it is the latest completed commit. With
    /// `delete_instants`, the instant leaves the active timeline (an
    /// inflight compaction goes back to its plan instead). An instant
    /// whose files could not all be deleted stays on the timeline.
    pub fn rollback(
        &self,
        timeline: &mut ActiveTimeline,
        instant_time: &str,
        delete_instants: bool,
    ) -> Result<RollbackStats, RollbackError> {
        let fail = |e: RollbackFailure| RollbackError::new(instant_time, e);

        let Some(target) = timeline.find(instant_time).cloned() else {
            info!(instant = %instant_time, "instant not on the active timeline, nothing to roll back");
            return Ok(RollbackStats::new());
        };
        self.check_allowed(timeline, &target).map_err(fail)?;

        let rollback_time = new_instant_time(timeline.last_instant_time());
        let requested = timeline
            .create_requested(&rollback_time, Action::Rollback, None)
            .map_err(|e| fail(e.into()))?;
        let inflight = timeline
            .transition_to_inflight(&requested)
            .map_err(|e| fail(e.into()))?;

        let markers = MarkerStore::new(Arc::clone(&self.ctx.fs), &self.ctx.base_path, instant_time);
        let strategy = self.strategy_for(&target, &markers);
        info!(
            instant = %instant_time,
            rollback_instant = %rollback_time,
            strategy = strategy.name(),
            "starting rollback"
        );
        let stats = strategy.execute(&target, &rollback_time)?;
        let failed_deletes: usize = stats.values().map(|s| s.failed_delete_files.len()).sum();

        // Files that could not be deleted must stay attributable to the
        // instant, so both the instant and its markers are kept.
        if failed_deletes > 0 {
            warn!(
                instant = %instant_time,
                failed = failed_deletes,
                "files left behind, keeping the instant for another rollback"
            );
        } else {
            markers.delete_all(&self.ctx.executor, self.markers_delete_parallelism);
            if delete_instants {
                let revert_plan =
                    target.action == Action::Compaction && target.state == InstantState::Inflight;
                let result = if revert_plan {
                    timeline.revert_to_requested(&target).map(|_| ())
                } else {
                    timeline.delete_instant(&target)
                };
                result.map_err(|e| fail(e.into()))?;
            }
        }

        let metadata = RollbackMetadata {
            rollback_instant_time: rollback_time.clone(),
            rolled_back_instant: target,
            strategy: strategy.name().to_string(),
            total_files_deleted: stats.values().map(|s| s.success_delete_files.len()).sum(),
            total_failed_deletes: failed_deletes,
            partition_metadata: stats.clone(),
        };
        let details = serde_json::to_vec(&metadata).map_err(|e| fail(e.into()))?;
        timeline
            .save_as_complete(&inflight, Some(&details))
            .map_err(|e| fail(e.into()))?;

        info!(
            instant = %instant_time,
            deleted = metadata.total_files_deleted,
            failed = metadata.total_failed_deletes,
            "rollback complete"
        );
        Ok(stats)
    }

    /// Markers of a completed instant were dropped on commit, so completed
    /// instants and instants without a marker directory are undone by
    /// listing.
    fn strategy_for(&self, target: &Instant, markers: &MarkerStore) -> RollbackStrategy {
        match &self.strategy {
            RollbackStrategy::MarkerBased(_) if target.is_completed() || !markers.exists() => {
                RollbackStrategy::listing_based(self.ctx.clone())
            }
            strategy => strategy.clone(),
        }
    }

    fn check_allowed(&self, timeline: &ActiveTimeline, target: &Instant) -> Result<(), RollbackFailure> {
        if target.action == Action::Rollback {
            return Err(RollbackFailure::NotAllowed(format!(
                "{target} is itself a rollback"
            )));
        }
        if !target.is_completed() {
            return Ok(());
        }

        let latest = timeline.last_completed_commit();
        if !target.action.is_write() || latest != Some(target) {
            return Err(RollbackFailure::NotAllowed(format!(
                "{target} is completed and not the latest commit"
            )));
        }
        Ok(())
    }
}
