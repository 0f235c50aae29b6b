// Archiver
//
// Keeps the active timeline short. Once more than `max_commits_to_keep`
// instants have completed, the oldest are moved to the archive until
// `min_commits_to_keep` remain. Nothing at or after the earliest pending
// instant is archived.

use tracing::info;

use super::TableError;
use crate::config::ArchiveConfig;
use crate::timeline::{ActiveTimeline, Instant};

/// Completed instants that should leave the active timeline.
pub fn instants_to_archive(timeline: &ActiveTimeline, config: &ArchiveConfig) -> Vec<Instant> {
    let completed: Vec<&Instant> = timeline.completed_instants().collect();
    if completed.len() <= config.max_commits_to_keep {
        return Vec::new();
    }

    let earliest_pending = timeline
        .pending_instants()
        .map(|i| i.timestamp.as_str())
        .min();

    let excess = completed.len().saturating_sub(config.min_commits_to_keep);
    completed
        .into_iter()
        .take(excess)
        .take_while(|i| earliest_pending.map_or(true, |p| i.timestamp.as_str() < p))
        .cloned()
        .collect()
}

/// Archive what [`instants_to_archive`] selects.
pub fn archive_if_required(
    timeline: &mut ActiveTimeline,
    config: &ArchiveConfig,
) -> Result<Vec<Instant>, TableError> {
    let archived = instants_to_archive(timeline, config);
    if archived.is_empty() {
        return Ok(archived);
    }

    timeline.archive(&archived)?;
    info!(
        archived = archived.len(),
        first = %archived[0].timestamp,
        last = %archived[archived.len() - 1].timestamp,
        "archived instants"
    );
    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::InvariantEngine;
    use crate::timeline::{Action, InMemoryTimelineStore};
    use std::sync::Arc;

    fn timeline_with(completed: usize, pending_at: Option<usize>) -> ActiveTimeline {
        let mut timeline = ActiveTimeline::new(
            Arc::new(InMemoryTimelineStore::default()),
            Arc::new(InvariantEngine::with_timeline_defaults()),
        );
        for i in 0..completed {
            let ts = format!("{:03}", i + 1);
            let requested = timeline.create_requested(&ts, Action::Commit, None).unwrap();
            let inflight = timeline.transition_to_inflight(&requested).unwrap();
            if pending_at != Some(i) {
                timeline.save_as_complete(&inflight, None).unwrap();
            }
        }
        timeline
    }

    fn config(min: usize, max: usize) -> ArchiveConfig {
        ArchiveConfig {
            min_commits_to_keep: min,
            max_commits_to_keep: max,
        }
    }

    #[test]
    fn archives_down_to_min_once_over_max() {
        let mut timeline = timeline_with(6, None);

        assert!(instants_to_archive(&timeline, &config(2, 6)).is_empty());
        let archived = archive_if_required(&mut timeline, &config(2, 5)).unwrap();

        assert_eq!(archived.len(), 4);
        assert_eq!(timeline.instants().len(), 2);
        assert_eq!(timeline.instants()[0].timestamp, "005");
    }

    #[test]
    fn stops_at_earliest_pending_instant() {
        // 001..003 completed, 004 left inflight.
        let mut timeline = timeline_with(4, Some(3));
        let requested = timeline.create_requested("005", Action::Rollback, None).unwrap();
        let inflight = timeline.transition_to_inflight(&requested).unwrap();
        timeline.save_as_complete(&inflight, None).unwrap();

        let archived = instants_to_archive(&timeline, &config(1, 2));
        let archived: Vec<&str> = archived.iter().map(|i| i.timestamp.as_str()).collect();
        assert_eq!(archived, vec!["001", "002", "003"]);
    }
}
