//! DAG-scheduled parallel execution
//!
//! Walks the task graph in topological order with bounded concurrency,
//! invoking a caller-supplied visitor per ready node. A task becomes ready
//! only when every prerequisite's visitor returned success; ready tasks are
//! issued in lexicographic task-ID order so runs are reproducible.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::graph::TaskGraph;
use crate::task::TaskId;

/// Scheduling options
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Lift the concurrency bound. Prerequisite edges still apply; the flag
    /// only removes the in-flight cap.
    pub parallel: bool,
    /// Maximum in-flight visitors when bounded
    pub concurrency: usize,
    /// Keep issuing sibling subtrees after a failure. Descendants of the
    /// failed task are skipped either way.
    pub continue_on_error: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            concurrency: gantry_core::config::default_concurrency(),
            continue_on_error: false,
        }
    }
}

/// Drives visitors over the task graph
pub struct Engine {
    graph: Arc<TaskGraph>,
}

impl Engine {
    pub fn new(graph: Arc<TaskGraph>) -> Self {
        Self { graph }
    }

    /// Execute the visitor over every task, honouring DAG order.
    ///
    /// Returns all collected visitor errors, paired with the task that
    /// produced them; empty on success. Cancellation stops new work from
    /// being issued — in-flight visitors observe the signal themselves.
    pub async fn execute<F, Fut, E>(
        &self,
        visitor: F,
        opts: &ExecutionOptions,
        cancel: watch::Receiver<bool>,
    ) -> Vec<(TaskId, E)>
    where
        F: Fn(TaskId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let visitor = Arc::new(visitor);
        let semaphore = if opts.parallel {
            None
        } else {
            Some(Arc::new(Semaphore::new(opts.concurrency.max(1))))
        };

        let mut dep_remaining: HashMap<TaskId, usize> = HashMap::new();
        let mut ready: BTreeSet<TaskId> = BTreeSet::new();
        for (id, node) in self.graph.nodes() {
            dep_remaining.insert(id.clone(), node.dependencies.len());
            if node.dependencies.is_empty() {
                ready.insert(id.clone());
            }
        }

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(TaskId, Result<(), E>)>();
        let mut cancel = cancel;
        let mut in_flight: usize = 0;
        let mut halted = false;
        let mut skipped: HashSet<TaskId> = HashSet::new();
        let mut errors: Vec<(TaskId, E)> = Vec::new();

        loop {
            // Issue ready tasks, lowest task ID first
            while !halted && !*cancel.borrow() {
                let Some(id) = ready.iter().next().cloned() else {
                    break;
                };

                let permit = match &semaphore {
                    Some(sem) => match sem.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        // Pool full: wait for a completion to free a slot
                        Err(_) => break,
                    },
                    None => None,
                };

                ready.remove(&id);
                in_flight += 1;
                debug!(task = %id, in_flight, "issuing task");

                let visitor = visitor.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = (visitor.as_ref())(id.clone()).await;
                    drop(permit);
                    let _ = done_tx.send((id, result));
                });
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                completed = done_rx.recv() => {
                    let Some((id, result)) = completed else { break };
                    in_flight -= 1;

                    match result {
                        Ok(()) => {
                            debug!(task = %id, "task visitor returned success");
                            for dependent in self.graph.descendants_direct(&id) {
                                if skipped.contains(&dependent) {
                                    continue;
                                }
                                if let Some(remaining) = dep_remaining.get_mut(&dependent) {
                                    *remaining = remaining.saturating_sub(1);
                                    if *remaining == 0 {
                                        ready.insert(dependent);
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            warn!(task = %id, "task visitor returned an error");
                            for descendant in self.graph.descendants(&id) {
                                if skipped.insert(descendant.clone()) {
                                    ready.remove(&descendant);
                                    info!(task = %descendant, "unreachable, upstream failed");
                                }
                            }
                            errors.push((id, err));
                            if !opts.continue_on_error {
                                halted = true;
                            }
                        }
                    }
                }
                _ = async {
                    // A dropped sender must not wake the loop forever
                    if cancel.changed().await.is_err() {
                        std::future::pending::<()>().await
                    }
                } => {
                    // Re-checked at the top of the loop; nothing new issues
                    info!("cancellation observed, no further tasks will be issued");
                }
            }
        }

        if !skipped.is_empty() {
            info!(count = skipped.len(), "tasks skipped due to upstream failures");
        }

        errors
    }
}

impl TaskGraph {
    /// Direct dependents, unsorted; scheduling order is decided by the
    /// ready set, not here
    fn descendants_direct(&self, id: &TaskId) -> Vec<TaskId> {
        self.get(id)
            .map(|n| n.dependents.iter().cloned().collect())
            .unwrap_or_default()
    }
}
