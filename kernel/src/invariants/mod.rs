// Invariant Framework
//
// Invariants are pure rules that must always hold true while the
// active timeline changes. Violations are detected *before* the
// transition is written to the timeline store.

use crate::timeline::{Instant, InstantState};

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    /// `timeline` is the active timeline before the transition,
    /// `previous` the prior state of the instant (if it existed).
    fn validate(
        &self,
        timeline: &[Instant],
        previous: Option<&Instant>,
        next: &Instant,
    ) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    /// Create a new invariant engine.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with the rules every active timeline must obey.
    pub fn with_timeline_defaults() -> Self {
        let mut engine = Self::new();
        engine.register(SingleInflightWriter);
        engine.register(MonotonicCreation);
        engine.register(CompletedIsImmutable);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        timeline: &[Instant],
        previous: Option<&Instant>,
        next: &Instant,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(timeline, previous, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

/// At most one commit/delta-commit may be INFLIGHT at a time.
pub struct SingleInflightWriter;

impl Invariant for SingleInflightWriter {
    fn name(&self) -> &'static str {
        "single-inflight-writer"
    }

    fn validate(
        &self,
        timeline: &[Instant],
        _previous: Option<&Instant>,
        next: &Instant,
    ) -> InvariantResult {
        if !next.action.is_write() || next.state != InstantState::Inflight {
            return InvariantResult::Pass;
        }

        match timeline.iter().find(|i| {
            i.action.is_write() && i.state == InstantState::Inflight && i.timestamp != next.timestamp
        }) {
            Some(other) => InvariantResult::Fail(format!(
                "cannot start {} while {} is still inflight",
                next.timestamp, other.timestamp
            )),
            None => InvariantResult::Pass,
        }
    }
}

/// Newly created instants sort after everything already on the timeline.
pub struct MonotonicCreation;

impl Invariant for MonotonicCreation {
    fn name(&self) -> &'static str {
        "monotonic-creation"
    }

    fn validate(
        &self,
        timeline: &[Instant],
        previous: Option<&Instant>,
        next: &Instant,
    ) -> InvariantResult {
        if previous.is_some() {
            return InvariantResult::Pass;
        }

        match timeline.iter().map(|i| i.timestamp.as_str()).max() {
            Some(last) if next.timestamp.as_str() <= last => InvariantResult::Fail(format!(
                "instant {} does not sort after latest instant {}",
                next.timestamp, last
            )),
            _ => InvariantResult::Pass,
        }
    }
}

/// A completed instant never changes and is never re-created.
pub struct CompletedIsImmutable;

impl Invariant for CompletedIsImmutable {
    fn name(&self) -> &'static str {
        "completed-is-immutable"
    }

    fn validate(
        &self,
        timeline: &[Instant],
        previous: Option<&Instant>,
        next: &Instant,
    ) -> InvariantResult {
        if previous.is_some_and(|p| p.state == InstantState::Completed) {
            return InvariantResult::Fail(format!("{} is already completed", next.timestamp));
        }

        let already_completed = timeline.iter().any(|i| {
            i.timestamp == next.timestamp
                && i.action == next.action
                && i.state == InstantState::Completed
        });
        if already_completed {
            InvariantResult::Fail(format!("{} is already completed", next.timestamp))
        } else {
            InvariantResult::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{Action, Instant, InstantState};

    fn instant(ts: &str, action: Action, state: InstantState) -> Instant {
        Instant::new(ts, action, state)
    }

    #[test]
    fn second_inflight_writer_is_rejected() {
        let engine = InvariantEngine::with_timeline_defaults();
        let timeline = vec![instant("001", Action::Commit, InstantState::Inflight)];

        let previous = instant("002", Action::Commit, InstantState::Requested);
        let next = instant("002", Action::Commit, InstantState::Inflight);

        let err = engine
            .evaluate(&timeline, Some(&previous), &next)
            .unwrap_err();
        assert!(err.to_string().contains("single-inflight-writer"));
    }

    #[test]
    fn compaction_may_run_beside_inflight_writer() {
        let engine = InvariantEngine::with_timeline_defaults();
        let timeline = vec![instant("001", Action::DeltaCommit, InstantState::Inflight)];

        let previous = instant("002", Action::Compaction, InstantState::Requested);
        let next = instant("002", Action::Compaction, InstantState::Inflight);

        assert!(engine.evaluate(&timeline, Some(&previous), &next).is_ok());
    }

    #[test]
    fn creation_must_be_monotonic() {
        let engine = InvariantEngine::with_timeline_defaults();
        let timeline = vec![instant("005", Action::Commit, InstantState::Completed)];

        let next = instant("003", Action::Commit, InstantState::Requested);
        let err = engine.evaluate(&timeline, None, &next).unwrap_err();
        assert_eq!(err.invariant, "monotonic-creation");
    }

    #[test]
    fn completed_instant_cannot_change() {
        let engine = InvariantEngine::with_timeline_defaults();
        let done = instant("001", Action::Commit, InstantState::Completed);
        let timeline = vec![done.clone()];

        let next = instant("001", Action::Commit, InstantState::Inflight);
        let err = engine.evaluate(&timeline, Some(&done), &next).unwrap_err();
        assert_eq!(err.invariant, "completed-is-immutable");
    }
}
