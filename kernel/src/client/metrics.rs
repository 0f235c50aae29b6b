// Write Metrics
//
// Counters a write client keeps about its own commits. Each commit is
// keyed by the epoch millis of its instant time and logged as it is
// recorded. Only the most recent commits are kept in full; totals cover
// the client's whole lifetime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info};

use crate::table::{CommitMetadata, WriteOperationType};
use crate::timeline::Action;

/// Number of per-commit entries retained for [`WriteMetrics::snapshot`].
pub const RECENT_COMMITS_RETAINED: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitMetric {
    pub instant_time: String,
    pub action: Action,
    pub commit_epoch_millis: i64,
    pub duration_ms: u64,
    pub files_written: usize,
    pub records_written: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
}

/// Point-in-time copy of [`WriteMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteMetricsSnapshot {
    /// Most recent commits, oldest first.
    pub commits: Vec<CommitMetric>,
    pub total_commits: u64,
    pub total_records_written: u64,
    pub total_bytes_written: u64,
    pub index_lookups: u64,
    pub index_lookup_ms: u64,
}

#[derive(Debug, Default)]
pub struct WriteMetrics {
    commits: Mutex<VecDeque<CommitMetric>>,
    total_commits: AtomicU64,
    total_records_written: AtomicU64,
    total_bytes_written: AtomicU64,
    index_lookups: AtomicU64,
    index_lookup_ms: AtomicU64,
}

impl WriteMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_commit_metrics(
        &self,
        instant_time: &str,
        commit_time: &NaiveDateTime,
        action: Action,
        duration: Duration,
        metadata: &CommitMetadata,
    ) {
        let stats: Vec<_> = metadata.write_stats().collect();
        let metric = CommitMetric {
            instant_time: instant_time.to_string(),
            action,
            commit_epoch_millis: commit_time.and_utc().timestamp_millis(),
            duration_ms: duration.as_millis() as u64,
            files_written: stats.len(),
            records_written: metadata.total_records_written(),
            bytes_written: stats.iter().map(|s| s.total_write_bytes).sum(),
            write_errors: stats.iter().map(|s| s.total_write_errors).sum(),
        };

        info!(
            instant = %metric.instant_time,
            action = action.as_str(),
            commit_epoch_millis = metric.commit_epoch_millis,
            duration_ms = metric.duration_ms,
            files = metric.files_written,
            records = metric.records_written,
            bytes = metric.bytes_written,
            "commit metrics"
        );

        self.total_commits.fetch_add(1, Ordering::Relaxed);
        self.total_records_written
            .fetch_add(metric.records_written, Ordering::Relaxed);
        self.total_bytes_written
            .fetch_add(metric.bytes_written, Ordering::Relaxed);

        let mut commits = match self.commits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if commits.len() == RECENT_COMMITS_RETAINED {
            commits.pop_front();
        }
        commits.push_back(metric);
    }

    pub fn update_index_metrics(&self, operation: WriteOperationType, lookup_ms: u64) {
        self.index_lookups.fetch_add(1, Ordering::Relaxed);
        self.index_lookup_ms.fetch_add(lookup_ms, Ordering::Relaxed);
        debug!(operation = %operation, lookup_ms, "index lookup metrics");
    }

    pub fn snapshot(&self) -> WriteMetricsSnapshot {
        let commits = match self.commits.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };
        WriteMetricsSnapshot {
            commits,
            total_commits: self.total_commits.load(Ordering::Relaxed),
            total_records_written: self.total_records_written.load(Ordering::Relaxed),
            total_bytes_written: self.total_bytes_written.load(Ordering::Relaxed),
            index_lookups: self.index_lookups.load(Ordering::Relaxed),
            index_lookup_ms: self.index_lookup_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{WriteStat, WriteStatus};
    use crate::timeline::parse_instant_time;

    #[test]
    fn commit_is_keyed_by_instant_epoch_millis() {
        let metrics = WriteMetrics::new();
        let status = WriteStatus {
            stat: WriteStat {
                partition_path: "p".into(),
                num_writes: 4,
                total_write_bytes: 128,
                ..Default::default()
            },
            ..Default::default()
        };
        let metadata = CommitMetadata::new(Some(WriteOperationType::Compact), &[status], None);
        let commit_time = parse_instant_time("19700101000001500").unwrap();

        metrics.update_commit_metrics(
            "19700101000001500",
            &commit_time,
            Action::Compaction,
            Duration::from_millis(42),
            &metadata,
        );
        metrics.update_index_metrics(WriteOperationType::Upsert, 7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commits.len(), 1);
        let commit = &snapshot.commits[0];
        assert_eq!(commit.commit_epoch_millis, 1500);
        assert_eq!(commit.duration_ms, 42);
        assert_eq!(commit.records_written, 4);
        assert_eq!(commit.bytes_written, 128);
        assert_eq!(snapshot.index_lookup_ms, 7);
    }

    #[test]
    fn only_recent_commits_are_retained() {
        let metrics = WriteMetrics::new();
        let status = WriteStatus {
            stat: WriteStat {
                partition_path: "p".into(),
                num_writes: 1,
                total_write_bytes: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let metadata = CommitMetadata::new(Some(WriteOperationType::Insert), &[status], None);
        let commit_time = parse_instant_time("19700101000001000").unwrap();

        let total = RECENT_COMMITS_RETAINED + 5;
        for i in 0..total {
            metrics.update_commit_metrics(
                &format!("{i:017}"),
                &commit_time,
                Action::Commit,
                Duration::ZERO,
                &metadata,
            );
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commits.len(), RECENT_COMMITS_RETAINED);
        assert_eq!(snapshot.commits[0].instant_time, format!("{:017}", 5));
        assert_eq!(snapshot.total_commits, total as u64);
        assert_eq!(snapshot.total_records_written, total as u64);
        assert_eq!(snapshot.total_bytes_written, 10 * total as u64);
    }
}
