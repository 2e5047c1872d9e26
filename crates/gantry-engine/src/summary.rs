//! Per-task summaries and the run summary document

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use gantry_core::pipeline::TaskDefinition;

use crate::cache::ItemStatus;
use crate::run_state::TaskOutcome;
use crate::task::TaskId;

/// Placeholder recorded when a package does not implement a target task
pub const NONEXISTENT_COMMAND: &str = "<NONEXISTENT>";

/// Timing and outcome of one task's execution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionSummary {
    /// Wall time in milliseconds
    pub duration_ms: u64,
    /// What happened
    pub outcome: TaskOutcome,
}

/// Everything the CLI reports about a single task.
///
/// Field names are part of the output contract; changing them breaks
/// consumers of the run summary document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    /// Full task ID, `package#task`
    pub task_id: String,
    /// Task name
    pub task: String,
    /// Package name
    pub package: String,
    /// The task fingerprint
    pub hash: String,
    /// Where the fingerprint was found at probe time
    pub cache_state: ItemStatus,
    /// The resolved command, or `<NONEXISTENT>`
    pub command: String,
    /// Package directory, repo-relative
    pub dir: String,
    /// Declared output inclusion globs
    pub outputs: Vec<String>,
    /// Declared output exclusion globs
    pub excluded_outputs: Vec<String>,
    /// Repo-relative path of the captured log
    pub log_file: String,
    /// Transitive prerequisite task IDs
    pub dependencies: Vec<String>,
    /// Transitive dependent task IDs
    pub dependents: Vec<String>,
    /// The pipeline rule this task resolved to
    pub resolved_task_definition: TaskDefinition,
    /// Input files that fed the hash, path -> content hash
    pub expanded_inputs: BTreeMap<String, String>,
    /// Output files actually produced (expanded from the globs)
    pub expanded_outputs: Vec<String>,
    /// Env pairs that fed the hash
    pub environment: Vec<String>,
    /// Detected framework, when known
    pub framework: String,
    /// Timing and outcome, absent if the task never started
    pub execution: Option<TaskExecutionSummary>,
}

/// The single JSON document emitted at the end of a successful run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub exit_code: i32,
    pub tasks: Vec<TaskSummary>,
}

/// Mutex-guarded collection of task summaries, written once per task
#[derive(Debug, Default)]
pub struct TaskSummaryStore {
    inner: Mutex<HashMap<TaskId, TaskSummary>>,
}

impl TaskSummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task's summary. Each task ID is recorded at most once; a
    /// second write is dropped.
    pub fn insert(&self, id: TaskId, summary: TaskSummary) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.contains_key(&id) {
            warn!(task = %id, "duplicate task summary dropped");
            return;
        }
        inner.insert(id, summary);
    }

    /// Number of recorded summaries
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of summaries whose outcome matches
    pub fn count_outcome(&self, outcome: TaskOutcome) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|s| s.execution.as_ref().map(|e| e.outcome) == Some(outcome))
            .count()
    }

    /// Drain into the final document, tasks sorted by ID for stable output
    pub fn finalize(&self, exit_code: i32) -> RunSummary {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut tasks: Vec<TaskSummary> = std::mem::take(&mut *inner).into_values().collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        RunSummary { exit_code, tasks }
    }
}
