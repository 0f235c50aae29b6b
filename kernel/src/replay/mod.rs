// Deterministic Timeline Replay
//
// Rebuilds the active timeline from its store while enforcing the
// instant state machine and the invariant engine on every recorded
// transition.

use std::collections::HashMap;
use std::sync::Arc;

use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::state::{InstantStateMachine, StateError};
use crate::timeline::{Action, ActiveTimeline, Instant, TimelineError, TimelineStore};

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("failed to load timeline: {0}")]
    Store(#[from] TimelineError),

    #[error("state machine error: {0}")]
    State(#[from] StateError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// Replay the stored timeline records and derive the active timeline.
///
/// This is the *only* supported way to load an existing timeline.
pub fn replay_timeline(
    store: Arc<dyn TimelineStore>,
    invariants: Arc<InvariantEngine>,
) -> Result<ActiveTimeline, ReplayError> {
    let mut machines: HashMap<(String, Action), InstantStateMachine> = HashMap::new();
    let mut current: Vec<Instant> = Vec::new();

    for record in store.load()? {
        let key = (record.timestamp.clone(), record.action);

        match machines.get_mut(&key) {
            Some(machine) => {
                machine.apply(record.state)?;

                let position = current
                    .iter()
                    .position(|i| i.timestamp == record.timestamp && i.action == record.action);
                if let Some(position) = position {
                    let previous = current[position].clone();
                    invariants.evaluate(&current, Some(&previous), &record)?;
                    current[position] = record;
                }
            }
            None => {
                // The earliest surviving record of an instant is trusted as-is.
                invariants.evaluate(&current, None, &record)?;
                machines.insert(key, InstantStateMachine::resume(record.action, record.state));
                current.push(record);
            }
        }
    }

    Ok(ActiveTimeline::from_instants(store, invariants, current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{InMemoryTimelineStore, InstantState};

    fn store_with(records: &[Instant]) -> Arc<dyn TimelineStore> {
        let store = InMemoryTimelineStore::default();
        for record in records {
            store.save(record, None).unwrap();
        }
        Arc::new(store)
    }

    #[test]
    fn replay_keeps_latest_state_per_instant() {
        let store = store_with(&[
            Instant::requested("001", Action::Commit),
            Instant::inflight("001", Action::Commit),
            Instant::completed("001", Action::Commit),
            Instant::requested("002", Action::DeltaCommit),
            Instant::inflight("002", Action::DeltaCommit),
        ]);

        let timeline =
            replay_timeline(store, Arc::new(InvariantEngine::with_timeline_defaults())).unwrap();

        assert_eq!(
            timeline.instants(),
            &[
                Instant::completed("001", Action::Commit),
                Instant::inflight("002", Action::DeltaCommit),
            ]
        );
    }

    #[test]
    fn replay_fails_on_two_inflight_writers() {
        let store = store_with(&[
            Instant::requested("001", Action::Commit),
            Instant::inflight("001", Action::Commit),
            Instant::requested("002", Action::Commit),
            Instant::inflight("002", Action::Commit),
        ]);

        let err = replay_timeline(store, Arc::new(InvariantEngine::with_timeline_defaults()))
            .unwrap_err();

        assert!(matches!(err, ReplayError::Invariant(_)), "unexpected error: {err}");
    }

    #[test]
    fn replay_resumes_from_first_surviving_record() {
        let store = store_with(&[Instant::new("001", Action::Commit, InstantState::Inflight)]);

        let timeline = replay_timeline(store, Arc::new(InvariantEngine::new())).unwrap();
        assert_eq!(timeline.pending_writes().count(), 1);
    }
}
