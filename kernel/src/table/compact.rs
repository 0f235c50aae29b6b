// Compaction
//
// Folds the log files of merge-on-read file groups into new base files.
// A plan is stored on the REQUESTED compaction instant; executing it
// rewrites each listed file slice at the compaction instant time.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::file_group::FileGroupTable;
use super::view::{FileSlice, FileSystemView};
use super::{TableError, WriteStatus};
use crate::timeline::{ActiveTimeline, Instant};

pub const COMPACTION_PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionOperation {
    pub partition_path: String,
    pub file_id: String,
    pub base_instant_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_file: Option<String>,
    pub log_files: Vec<String>,
}

impl CompactionOperation {
    fn from_slice(slice: &FileSlice) -> Self {
        Self {
            partition_path: slice.partition_path.clone(),
            file_id: slice.file_id.clone(),
            base_instant_time: slice.base_instant_time.clone(),
            base_file: slice.base_file.as_ref().map(|b| b.name.file_name()),
            log_files: slice.log_files.iter().map(|l| l.name.file_name()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionPlan {
    pub version: u32,
    pub operations: Vec<CompactionOperation>,
}

impl CompactionPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TableError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TableError> {
        let plan: CompactionPlan = serde_json::from_slice(bytes)?;
        if plan.version > COMPACTION_PLAN_VERSION {
            return Err(TableError::InvalidPlan(format!(
                "unsupported plan version {}",
                plan.version
            )));
        }
        Ok(plan)
    }

    /// Plan stored with a compaction instant.
    pub fn read(timeline: &ActiveTimeline, instant: &Instant) -> Result<Self, TableError> {
        let bytes = timeline.read_details(instant)?.ok_or_else(|| {
            TableError::InvalidPlan(format!("compaction {} has no plan", instant.timestamp))
        })?;
        Self::from_bytes(&bytes)
    }
}

/// Plan a compaction of every latest file slice that has log files and
/// is not already part of a pending compaction.
pub fn generate_plan(view: &FileSystemView, timeline: &ActiveTimeline) -> Result<CompactionPlan, TableError> {
    let mut pending: HashSet<(String, String)> = HashSet::new();
    for instant in timeline.filter_pending_compaction_timeline() {
        for op in CompactionPlan::read(timeline, instant)?.operations {
            pending.insert((op.partition_path, op.file_id));
        }
    }

    let operations = view
        .all_file_groups()
        .filter(|g| !pending.contains(&(g.partition_path.clone(), g.file_id.clone())))
        .filter_map(|g| g.latest_slice())
        .filter(|s| !s.log_files.is_empty())
        .map(CompactionOperation::from_slice)
        .collect();

    Ok(CompactionPlan {
        version: COMPACTION_PLAN_VERSION,
        operations,
    })
}

/// Rewrite every slice the plan names into a base file at `instant_time`.
pub fn execute_plan(
    table: &FileGroupTable,
    timeline: &ActiveTimeline,
    instant_time: &str,
    plan: &CompactionPlan,
) -> Result<Vec<WriteStatus>, TableError> {
    let view = table.build_view(timeline.instants())?;

    let mut slices = Vec::with_capacity(plan.operations.len());
    for op in &plan.operations {
        let slice = view
            .file_group(&op.partition_path, &op.file_id)
            .and_then(|g| {
                g.slices
                    .iter()
                    .find(|s| s.base_instant_time == op.base_instant_time)
            })
            .ok_or_else(|| {
                TableError::InvalidPlan(format!(
                    "file slice {}/{}@{} is gone",
                    op.partition_path, op.file_id, op.base_instant_time
                ))
            })?;
        if slice.log_files.len() < op.log_files.len() {
            warn!(
                file_id = %op.file_id,
                planned = op.log_files.len(),
                found = slice.log_files.len(),
                "fewer log files than planned"
            );
        }
        slices.push(slice);
    }

    let statuses = table.rewrite_slices(&view, instant_time, slices)?;
    info!(
        instant = %instant_time,
        file_groups = statuses.len(),
        "executed compaction plan"
    );
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteConfig;
    use crate::executor::ParallelExecutor;
    use crate::fs::LocalFileSystem;
    use crate::invariants::InvariantEngine;
    use crate::record::Record;
    use crate::schema::{Field, FieldType, RecordSchema};
    use crate::table::{
        InMemoryHashIndex, TableOperations, TableType, WriteOperation, WriteOperationType,
    };
    use crate::timeline::{Action, InMemoryTimelineStore};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn schema() -> RecordSchema {
        RecordSchema::new(
            vec![
                Field::new("id", FieldType::Utf8, false),
                Field::new("amount", FieldType::Int64, true),
            ],
            "id",
            None,
        )
    }

    fn records(amount: i64) -> Vec<Record> {
        ["a", "b"]
            .iter()
            .map(|id| {
                let data = json!({"id": id, "amount": amount});
                Record::from_data(&schema(), data.as_object().unwrap().clone()).unwrap()
            })
            .collect()
    }

    fn write(
        table: &FileGroupTable,
        timeline: &mut ActiveTimeline,
        ts: &str,
        operation: WriteOperationType,
        records: Vec<Record>,
    ) {
        let requested = timeline.create_requested(ts, Action::DeltaCommit, None).unwrap();
        let inflight = timeline.transition_to_inflight(&requested).unwrap();
        table
            .execute(timeline, ts, WriteOperation::Records { operation, records })
            .unwrap();
        timeline.save_as_complete(&inflight, None).unwrap();
    }

    #[test]
    fn plan_then_execute_folds_logs() {
        let dir = TempDir::new().unwrap();
        let mut config = WriteConfig::new(dir.path(), "t", schema());
        config.table_type = TableType::MergeOnRead;
        let table = FileGroupTable::new(
            Arc::new(LocalFileSystem),
            config,
            ParallelExecutor::default(),
            Arc::new(InMemoryHashIndex::new()),
        );
        let mut timeline = ActiveTimeline::new(
            Arc::new(InMemoryTimelineStore::default()),
            Arc::new(InvariantEngine::with_timeline_defaults()),
        );

        write(&table, &mut timeline, "001", WriteOperationType::Insert, records(1));
        write(&table, &mut timeline, "002", WriteOperationType::Upsert, records(2));

        let view = table.build_view(timeline.instants()).unwrap();
        let plan = generate_plan(&view, &timeline).unwrap();
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].log_files.len(), 1);

        let requested = timeline
            .create_requested("003", Action::Compaction, Some(&plan.to_bytes().unwrap()))
            .unwrap();
        assert_eq!(CompactionPlan::read(&timeline, &requested).unwrap(), plan);

        // A second plan skips file groups already being compacted.
        let view = table.build_view(timeline.instants()).unwrap();
        assert!(generate_plan(&view, &timeline).unwrap().is_empty());

        let inflight = timeline.transition_to_inflight(&requested).unwrap();
        let statuses = execute_plan(&table, &timeline, "003", &plan).unwrap();
        timeline.save_as_complete(&inflight, None).unwrap();
        assert_eq!(statuses[0].stat.num_writes, 2);

        let view = table.build_view(timeline.instants()).unwrap();
        let slice = view.latest_file_slices("").next().unwrap();
        assert_eq!(slice.base_instant_time, "003");
        assert!(slice.log_files.is_empty());
        let merged = slice
            .read_records(&LocalFileSystem, &schema(), view.committed())
            .unwrap();
        assert_eq!(merged["a"].data["amount"], json!(2));
    }
}
