// Active Timeline
//
// Ordered, append-only record of instants and their lifecycle states.
// Every transition is checked by the instant state machine and the
// invariant engine, then written through to a `TimelineStore` before
// the in-memory view changes.

pub mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::state::{InstantStateMachine, StateError};

pub use store::{FsTimelineStore, InMemoryTimelineStore, TimelineStore};

/// Instant-time layout: `yyyyMMddHHmmssSSS`.
pub const INSTANT_TIME_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Kind of operation an instant records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Commit,
    DeltaCommit,
    Compaction,
    Rollback,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Commit => "commit",
            Action::DeltaCommit => "deltacommit",
            Action::Compaction => "compaction",
            Action::Rollback => "rollback",
        }
    }

    /// Actions that belong to the regular write lineage.
    pub fn is_write(&self) -> bool {
        matches!(self, Action::Commit | Action::DeltaCommit)
    }

    /// Actions whose completion makes new data files visible.
    pub fn produces_data(&self) -> bool {
        !matches!(self, Action::Rollback)
    }
}

impl FromStr for Action {
    type Err = TimelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Action::Commit),
            "deltacommit" => Ok(Action::DeltaCommit),
            "compaction" => Ok(Action::Compaction),
            "rollback" => Ok(Action::Rollback),
            other => Err(TimelineError::UnknownAction(other.to_string())),
        }
    }
}

/// Lifecycle state of an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstantState {
    Requested,
    Inflight,
    Completed,
}

/// One identified write, compaction or rollback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instant {
    pub timestamp: String,
    pub action: Action,
    pub state: InstantState,
}

impl Instant {
    pub fn new(timestamp: impl Into<String>, action: Action, state: InstantState) -> Self {
        Self {
            timestamp: timestamp.into(),
            action,
            state,
        }
    }

    pub fn requested(timestamp: impl Into<String>, action: Action) -> Self {
        Self::new(timestamp, action, InstantState::Requested)
    }

    pub fn inflight(timestamp: impl Into<String>, action: Action) -> Self {
        Self::new(timestamp, action, InstantState::Inflight)
    }

    pub fn completed(timestamp: impl Into<String>, action: Action) -> Self {
        Self::new(timestamp, action, InstantState::Completed)
    }

    pub fn with_state(&self, state: InstantState) -> Self {
        Self::new(self.timestamp.clone(), self.action, state)
    }

    pub fn is_completed(&self) -> bool {
        self.state == InstantState::Completed
    }

    /// Timeline file name for this exact state.
    pub fn file_name(&self) -> String {
        match self.state {
            InstantState::Requested => {
                format!("{}.{}.requested", self.timestamp, self.action.as_str())
            }
            InstantState::Inflight => {
                format!("{}.{}.inflight", self.timestamp, self.action.as_str())
            }
            InstantState::Completed => format!("{}.{}", self.timestamp, self.action.as_str()),
        }
    }

    /// Inverse of [`Instant::file_name`].
    pub fn parse_file_name(name: &str) -> Result<Self, TimelineError> {
        let invalid = || TimelineError::InvalidFileName(name.to_string());

        let mut parts = name.split('.');
        let timestamp = parts.next().filter(|t| !t.is_empty()).ok_or_else(invalid)?;
        let action: Action = parts.next().ok_or_else(invalid)?.parse()?;
        let state = match parts.next() {
            None => InstantState::Completed,
            Some("requested") => InstantState::Requested,
            Some("inflight") => InstantState::Inflight,
            Some(_) => return Err(invalid()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(timestamp, action, state))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}__{}__{:?}]", self.timestamp, self.action.as_str(), self.state)
    }
}

/// Parse an instant time (17-digit millisecond form, or the legacy
/// 14-digit seconds form).
pub fn parse_instant_time(ts: &str) -> Result<NaiveDateTime, TimelineError> {
    let invalid = || TimelineError::InvalidInstantTime(ts.to_string());

    if !(ts.len() == 14 || ts.len() == 17) || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let field = |from: usize, to: usize| ts[from..to].parse::<u32>().map_err(|_| invalid());
    let year = ts[0..4].parse::<i32>().map_err(|_| invalid())?;
    let millis = if ts.len() == 17 { field(14, 17)? } else { 0 };

    NaiveDate::from_ymd_opt(year, field(4, 6)?, field(6, 8)?)
        .and_then(|date| {
            date.and_hms_milli_opt(
                field(8, 10).ok()?,
                field(10, 12).ok()?,
                field(12, 14).ok()?,
                millis,
            )
        })
        .ok_or_else(invalid)
}

pub fn format_instant_time(time: &NaiveDateTime) -> String {
    time.format(INSTANT_TIME_FORMAT).to_string()
}

/// Produce an instant time strictly greater than `last`.
pub fn new_instant_time(last: Option<&str>) -> String {
    let now = Utc::now().naive_utc();
    let candidate = format_instant_time(&now);

    match last {
        Some(last) if candidate.as_str() <= last => match parse_instant_time(last) {
            Ok(previous) => format_instant_time(&(previous + chrono::Duration::milliseconds(1))),
            Err(_) => candidate,
        },
        _ => candidate,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("invalid instant time `{0}`")]
    InvalidInstantTime(String),

    #[error("unrecognized timeline file name `{0}`")]
    InvalidFileName(String),

    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("instant {0} not found on the active timeline")]
    InstantNotFound(String),

    #[error("instant {0} already exists on the active timeline")]
    InstantExists(String),

    #[error("state machine error: {0}")]
    State(#[from] StateError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("timeline storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize instant details: {0}")]
    Serde(#[from] serde_json::Error),
}

/// In-memory view of the active timeline, written through to storage.
pub struct ActiveTimeline {
    store: Arc<dyn TimelineStore>,
    invariants: Arc<InvariantEngine>,
    instants: Vec<Instant>,
}

impl fmt::Debug for ActiveTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTimeline")
            .field("instants", &self.instants)
            .finish()
    }
}

impl ActiveTimeline {
    /// Empty timeline over `store`. Use [`crate::replay::replay_timeline`]
    /// to load existing instants.
    pub fn new(store: Arc<dyn TimelineStore>, invariants: Arc<InvariantEngine>) -> Self {
        Self {
            store,
            invariants,
            instants: Vec::new(),
        }
    }

    pub(crate) fn from_instants(
        store: Arc<dyn TimelineStore>,
        invariants: Arc<InvariantEngine>,
        mut instants: Vec<Instant>,
    ) -> Self {
        instants.sort();
        Self {
            store,
            invariants,
            instants,
        }
    }

    pub fn store(&self) -> &Arc<dyn TimelineStore> {
        &self.store
    }

    pub fn invariants(&self) -> &Arc<InvariantEngine> {
        &self.invariants
    }

    pub fn instants(&self) -> &[Instant] {
        &self.instants
    }

    pub fn find(&self, timestamp: &str) -> Option<&Instant> {
        self.instants.iter().find(|i| i.timestamp == timestamp)
    }

    pub fn contains_instant(&self, instant: &Instant) -> bool {
        self.instants.contains(instant)
    }

    pub fn completed_instants(&self) -> impl Iterator<Item = &Instant> {
        self.instants.iter().filter(|i| i.is_completed())
    }

    /// Completed instants that made data visible (commits, delta commits,
    /// compactions).
    pub fn completed_commits(&self) -> impl Iterator<Item = &Instant> {
        self.completed_instants().filter(|i| i.action.produces_data())
    }

    pub fn last_completed_commit(&self) -> Option<&Instant> {
        self.completed_commits().last()
    }

    pub fn pending_instants(&self) -> impl Iterator<Item = &Instant> {
        self.instants.iter().filter(|i| !i.is_completed())
    }

    /// Write-lineage instants that have not completed.
    pub fn pending_writes(&self) -> impl Iterator<Item = &Instant> {
        self.instants
            .iter()
            .filter(|i| i.action.is_write() && !i.is_completed())
    }

    pub fn filter_pending_compaction_timeline(&self) -> impl Iterator<Item = &Instant> {
        self.instants
            .iter()
            .filter(|i| i.action == Action::Compaction && !i.is_completed())
    }

    pub fn last_instant_time(&self) -> Option<&str> {
        self.instants.last().map(|i| i.timestamp.as_str())
    }

    /// Delta commits completed after the last completed compaction.
    pub fn delta_commits_since_last_compaction(&self) -> usize {
        let last_compaction = self
            .completed_instants()
            .filter(|i| i.action == Action::Compaction)
            .map(|i| i.timestamp.as_str())
            .last();

        self.completed_instants()
            .filter(|i| i.action == Action::DeltaCommit)
            .filter(|i| last_compaction.map_or(true, |c| i.timestamp.as_str() > c))
            .count()
    }

    /// Register a new instant in REQUESTED state.
    pub fn create_requested(
        &mut self,
        timestamp: &str,
        action: Action,
        details: Option<&[u8]>,
    ) -> Result<Instant, TimelineError> {
        if self.find(timestamp).is_some() {
            return Err(TimelineError::InstantExists(timestamp.to_string()));
        }

        let next = Instant::requested(timestamp, action);
        InstantStateMachine::new(action).apply(next.state)?;
        self.invariants.evaluate(&self.instants, None, &next)?;

        self.store.save(&next, details)?;
        self.instants.push(next.clone());
        self.instants.sort();
        Ok(next)
    }

    pub fn transition_to_inflight(&mut self, requested: &Instant) -> Result<Instant, TimelineError> {
        self.transition(requested, InstantState::Inflight, None)
    }

    /// Atomically publish the completed instant together with its metadata.
    pub fn save_as_complete(
        &mut self,
        inflight: &Instant,
        details: Option<&[u8]>,
    ) -> Result<Instant, TimelineError> {
        self.transition(inflight, InstantState::Completed, details)
    }

    /// Move an inflight compaction back to its requested plan.
    pub fn revert_to_requested(&mut self, inflight: &Instant) -> Result<Instant, TimelineError> {
        let position = self.position_of(inflight)?;

        let reverted = inflight.with_state(InstantState::Requested);
        InstantStateMachine::resume(inflight.action, inflight.state).apply(reverted.state)?;
        self.invariants
            .evaluate(&self.instants, Some(inflight), &reverted)?;

        // The requested file still holds the plan; only the inflight marker goes.
        self.store.remove(inflight)?;
        self.instants[position] = reverted.clone();
        Ok(reverted)
    }

    /// Remove every state file of a pending or rolled-back instant.
    pub fn delete_instant(&mut self, instant: &Instant) -> Result<(), TimelineError> {
        let position = self
            .instants
            .iter()
            .position(|i| i.timestamp == instant.timestamp && i.action == instant.action)
            .ok_or_else(|| TimelineError::InstantNotFound(instant.timestamp.clone()))?;

        for state in [InstantState::Completed, InstantState::Inflight, InstantState::Requested] {
            self.store.remove(&instant.with_state(state))?;
        }
        self.instants.remove(position);
        Ok(())
    }

    /// Details stored with this instant, falling back to earlier states
    /// (a compaction plan lives on the REQUESTED file).
    pub fn read_details(&self, instant: &Instant) -> Result<Option<Vec<u8>>, TimelineError> {
        if let Some(bytes) = self.store.read_details(instant)? {
            return Ok(Some(bytes));
        }
        if instant.state != InstantState::Requested {
            return self
                .store
                .read_details(&instant.with_state(InstantState::Requested));
        }
        Ok(None)
    }

    /// Move instants out of the active timeline.
    pub fn archive(&mut self, instants: &[Instant]) -> Result<(), TimelineError> {
        self.store.archive(instants)?;
        self.instants.retain(|i| !instants.contains(i));
        Ok(())
    }

    fn position_of(&self, instant: &Instant) -> Result<usize, TimelineError> {
        self.instants
            .iter()
            .position(|i| i == instant)
            .ok_or_else(|| TimelineError::InstantNotFound(instant.to_string()))
    }

    fn transition(
        &mut self,
        current: &Instant,
        state: InstantState,
        details: Option<&[u8]>,
    ) -> Result<Instant, TimelineError> {
        let position = self.position_of(current)?;

        let next = current.with_state(state);
        InstantStateMachine::resume(current.action, current.state).apply(state)?;
        self.invariants
            .evaluate(&self.instants, Some(current), &next)?;

        self.store.save(&next, details)?;
        self.instants[position] = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline() -> ActiveTimeline {
        ActiveTimeline::new(
            Arc::new(InMemoryTimelineStore::default()),
            Arc::new(InvariantEngine::with_timeline_defaults()),
        )
    }

    #[test]
    fn instant_lifecycle_is_written_through() {
        let mut tl = timeline();

        let requested = tl.create_requested("001", Action::Commit, None).unwrap();
        let inflight = tl.transition_to_inflight(&requested).unwrap();
        let done = tl.save_as_complete(&inflight, Some(b"{}")).unwrap();

        assert_eq!(tl.completed_commits().count(), 1);
        assert_eq!(tl.read_details(&done).unwrap(), Some(b"{}".to_vec()));
        assert_eq!(tl.store().load().unwrap().len(), 3);
    }

    #[test]
    fn duplicate_instant_is_rejected() {
        let mut tl = timeline();
        tl.create_requested("001", Action::Commit, None).unwrap();

        let err = tl.create_requested("001", Action::Commit, None).unwrap_err();
        assert!(matches!(err, TimelineError::InstantExists(_)));
    }

    #[test]
    fn compaction_plan_survives_revert() {
        let mut tl = timeline();
        let requested = tl
            .create_requested("001", Action::Compaction, Some(b"plan"))
            .unwrap();
        let inflight = tl.transition_to_inflight(&requested).unwrap();

        let reverted = tl.revert_to_requested(&inflight).unwrap();
        assert_eq!(reverted.state, InstantState::Requested);
        assert_eq!(tl.read_details(&reverted).unwrap(), Some(b"plan".to_vec()));
        assert_eq!(tl.filter_pending_compaction_timeline().count(), 1);
    }

    #[test]
    fn delete_removes_all_states() {
        let mut tl = timeline();
        let requested = tl.create_requested("001", Action::DeltaCommit, None).unwrap();
        let inflight = tl.transition_to_inflight(&requested).unwrap();

        tl.delete_instant(&inflight).unwrap();
        assert!(tl.instants().is_empty());
        assert!(tl.store().load().unwrap().is_empty());
    }

    #[test]
    fn file_names_round_trip() {
        for instant in [
            Instant::requested("20240101000000000", Action::Compaction),
            Instant::inflight("20240101000000000", Action::DeltaCommit),
            Instant::completed("20240101000000000", Action::Rollback),
        ] {
            assert_eq!(Instant::parse_file_name(&instant.file_name()).unwrap(), instant);
        }
        assert!(Instant::parse_file_name("table.json").is_err());
    }

    #[test]
    fn instant_time_parsing() {
        let parsed = parse_instant_time("20240229235959123").unwrap();
        assert_eq!(format_instant_time(&parsed), "20240229235959123");

        assert!(parse_instant_time("20240101000000").is_ok());
        assert!(parse_instant_time("20241301000000000").is_err());
        assert!(parse_instant_time("2024-01-01").is_err());
        assert!(parse_instant_time("").is_err());
    }

    #[test]
    fn new_instant_time_is_strictly_increasing() {
        let first = new_instant_time(None);
        let second = new_instant_time(Some(&first));
        assert!(second > first);

        let far_future = "29991231235959999";
        let next = new_instant_time(Some(far_future));
        assert_eq!(next, "30000101000000000");
    }

    #[test]
    fn delta_commits_since_compaction() {
        let mut tl = timeline();
        for (ts, action) in [
            ("001", Action::DeltaCommit),
            ("002", Action::Compaction),
            ("003", Action::DeltaCommit),
            ("004", Action::DeltaCommit),
        ] {
            let r = tl.create_requested(ts, action, None).unwrap();
            let i = tl.transition_to_inflight(&r).unwrap();
            tl.save_as_complete(&i, None).unwrap();
        }
        assert_eq!(tl.delta_commits_since_last_compaction(), 2);
    }
}
