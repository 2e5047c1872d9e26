//! Per-run task outcome tracking

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskId;

/// What happened to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskOutcome {
    /// Outputs restored from cache
    Cached,
    /// Command ran and exited zero
    Built,
    /// Command ran and failed
    BuildFailed,
    /// No command to run
    Skipped,
}

/// Run-state errors
#[derive(Debug, Error)]
pub enum RunStateError {
    /// `close` was called more than once
    #[error("run state already closed")]
    AlreadyClosed,
}

#[derive(Debug, Clone)]
struct TaskTiming {
    start: Instant,
    end: Option<Instant>,
    outcome: Option<TaskOutcome>,
}

#[derive(Debug)]
struct RunStateInner {
    started: Instant,
    tasks: HashMap<TaskId, TaskTiming>,
    closed: bool,
}

/// Process-wide record of task start/end times and outcomes.
///
/// Shared across visitors behind a single mutex; writes are one small struct
/// assignment each.
#[derive(Debug)]
pub struct RunState {
    inner: Mutex<RunStateInner>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    /// Start tracking a run
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RunStateInner {
                started: Instant::now(),
                tasks: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Record that a task is starting; finish the returned tracer exactly
    /// once with the task's outcome.
    pub fn run(self: &Arc<Self>, id: &TaskId) -> Tracer {
        let start = Instant::now();
        let mut inner = self.lock();
        inner.tasks.insert(
            id.clone(),
            TaskTiming {
                start,
                end: None,
                outcome: None,
            },
        );
        Tracer {
            state: Arc::clone(self),
            id: id.clone(),
            start,
        }
    }

    /// The recorded outcome for a task, if it finished
    pub fn outcome(&self, id: &TaskId) -> Option<TaskOutcome> {
        self.lock().tasks.get(id).and_then(|t| t.outcome)
    }

    /// Wall time of the whole run so far
    pub fn elapsed(&self) -> Duration {
        self.lock().started.elapsed()
    }

    /// Close the run. Calling twice is an error.
    pub fn close(&self) -> Result<(), RunStateError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RunStateError::AlreadyClosed);
        }
        inner.closed = true;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunStateInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, id: &TaskId, outcome: TaskOutcome) {
        let mut inner = self.lock();
        if let Some(timing) = inner.tasks.get_mut(id) {
            timing.end = Some(Instant::now());
            timing.outcome = Some(outcome);
        }
    }
}

/// Handle for recording one task's completion
#[derive(Debug)]
pub struct Tracer {
    state: Arc<RunState>,
    id: TaskId,
    start: Instant,
}

impl Tracer {
    /// Record the outcome; returns the task's wall time
    pub fn stop(self, outcome: TaskOutcome) -> Duration {
        let duration = self.start.elapsed();
        self.state.finish(&self.id, outcome);
        duration
    }
}
