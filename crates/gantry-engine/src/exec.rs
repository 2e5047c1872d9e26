//! The per-task visitor
//!
//! The only component that sees both the cache and the supervisor. For each
//! ready task: upstream hashes -> task hash -> cache probe -> skip, restore,
//! or run-and-store -> record the summary. The summary is written before the
//! visitor returns, so descendants can rely on the recorded hash.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gantry_core::config::{PackageManager, RunSpec};

use crate::cache::ItemStatus;
use crate::graph::TaskGraph;
use crate::hash::{HashError, TaskHashTracker};
use crate::process::{OutputLine, ProcessError, ProcessManager};
use crate::reporter::{RunEvent, RunReporter};
use crate::run_state::{RunState, TaskOutcome};
use crate::runcache::RunCache;
use crate::summary::{TaskExecutionSummary, TaskSummary, TaskSummaryStore, NONEXISTENT_COMMAND};
use crate::task::{PackageTask, TaskId};

/// Environment variable announcing the task's fingerprint to the child
pub const TASK_HASH_ENV_VAR: &str = "TURBO_HASH";

/// Why a task failed. `AlreadyClosing` never becomes one of these; the
/// executor swallows it during shutdown.
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// Input hashing failed
    #[error("{task}: hashing error: {source}")]
    Hash {
        task: TaskId,
        #[source]
        source: HashError,
    },

    /// The child process failed to start, wait, or exited non-zero
    #[error("{task}: {source}")]
    Process {
        task: TaskId,
        #[source]
        source: ProcessError,
    },

    /// The on-disk log could not be opened
    #[error("{task}: could not open log file: {source}")]
    LogWriter {
        task: TaskId,
        #[source]
        source: std::io::Error,
    },
}

impl TaskFailure {
    /// The child's exit code, when the failure was a non-zero exit
    pub fn child_exit_code(&self) -> Option<i32> {
        match self {
            Self::Process {
                source: ProcessError::ChildExit { code },
                ..
            } => Some(*code),
            _ => None,
        }
    }
}

/// Shared state for all visitors of one run
pub struct ExecContext {
    pub repo_root: PathBuf,
    pub spec: RunSpec,
    pub package_manager: PackageManager,
    pub graph: Arc<TaskGraph>,
    pub tracker: Arc<TaskHashTracker>,
    pub run_cache: Arc<RunCache>,
    pub processes: Arc<ProcessManager>,
    pub run_state: Arc<RunState>,
    pub summaries: Arc<TaskSummaryStore>,
    pub reporter: Arc<dyn RunReporter>,
}

impl ExecContext {
    /// Visit one ready task
    pub async fn visit(&self, id: TaskId) -> Result<(), TaskFailure> {
        let node = match self.graph.get(&id) {
            Some(node) => node,
            None => return Ok(()),
        };
        let task = node.task.clone();
        let upstream = self.graph.dependencies(&id);
        let pass_through = self.spec.args_for_task(&id.task);
        let prefix = id.output_prefix(self.spec.opts.run_opts.single_package);

        let tracer = self.run_state.run(&id);

        let hash = match self
            .tracker
            .calculate_task_hash(&task, &upstream, &pass_through)
        {
            Ok(hash) => hash,
            Err(source) => {
                self.reporter.report(&RunEvent::Error {
                    message: format!("{}: hashing error: {}", prefix, source),
                });
                tracer.stop(TaskOutcome::BuildFailed);
                return Err(TaskFailure::Hash { task: id, source });
            }
        };
        debug!(task = %id, hash = %hash, "task hash");

        let cache_state = match self.run_cache.cache().exists(&hash) {
            Ok(status) => status,
            Err(err) => {
                self.reporter.report(&RunEvent::Warning {
                    message: format!("{}: error probing cache: {}", prefix, err),
                });
                ItemStatus::miss()
            }
        };

        let mut summary = self.base_summary(&id, &task, &hash, cache_state);

        // A package without the script is a no-op, recorded as skipped
        if task.command.is_none() {
            debug!(task = %id, "no command in package, skipping");
            let duration = tracer.stop(TaskOutcome::Skipped);
            summary.execution = Some(TaskExecutionSummary {
                duration_ms: duration.as_millis() as u64,
                outcome: TaskOutcome::Skipped,
            });
            self.summaries.insert(id, summary);
            return Ok(());
        }

        let task_cache = self.run_cache.task_cache(&task, &hash, prefix.clone());

        match task_cache.restore_outputs(self.reporter.as_ref()) {
            Ok(true) => {
                let duration = tracer.stop(TaskOutcome::Cached);
                summary.execution = Some(TaskExecutionSummary {
                    duration_ms: duration.as_millis() as u64,
                    outcome: TaskOutcome::Cached,
                });
                self.summaries.insert(id, summary);
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => {
                // Read errors degrade to a miss
                self.reporter.report(&RunEvent::Warning {
                    message: format!("{}: error fetching from cache: {}", prefix, err),
                });
            }
        }

        let log_writer = match task_cache.output_writer() {
            Ok(writer) => writer,
            Err(source) => {
                self.reporter.report(&RunEvent::Error {
                    message: format!("{}: could not open log file: {}", prefix, source),
                });
                let duration = tracer.stop(TaskOutcome::BuildFailed);
                summary.execution = Some(TaskExecutionSummary {
                    duration_ms: duration.as_millis() as u64,
                    outcome: TaskOutcome::BuildFailed,
                });
                self.summaries.insert(id.clone(), summary);
                return Err(TaskFailure::LogWriter { task: id, source });
            }
        };

        let mut cmd = Command::new(&self.package_manager.command);
        cmd.arg("run").arg(&id.task);
        if !pass_through.is_empty() {
            cmd.args(&self.package_manager.arg_separator);
            cmd.args(&pass_through);
        }
        cmd.current_dir(self.repo_root.join(&task.pkg.dir));
        cmd.env(TASK_HASH_ENV_VAR, &hash);

        // Tee child output: always to the on-disk log, to the terminal only
        // when the output mode streams
        let (tx, mut rx) = mpsc::channel::<OutputLine>(64);
        let stream = task_cache.should_stream();
        let drain_reporter = self.reporter.clone();
        let drain_id = id.clone();
        let drain_prefix = prefix.clone();
        let drain = tokio::spawn(async move {
            let mut writer = log_writer;
            while let Some(OutputLine { line, is_stderr }) = rx.recv().await {
                if let Err(err) = writer.write_line(&line) {
                    warn!(task = %drain_id, error = %err, "failed writing task log");
                }
                if stream {
                    drain_reporter.report(&RunEvent::TaskOutput {
                        id: drain_id.clone(),
                        prefix: drain_prefix.clone(),
                        line,
                        is_stderr,
                    });
                }
            }
            writer
        });

        let exec_result = self.processes.exec(cmd, tx).await;

        let close_result = match drain.await {
            Ok(writer) => writer.close(),
            Err(err) => {
                warn!(task = %id, error = %err, "log drain task failed");
                Ok(())
            }
        };

        match exec_result {
            Err(ProcessError::AlreadyClosing) => {
                // The run is shutting down; not a task failure
                debug!(task = %id, "run closing, task abandoned");
                Ok(())
            }
            Err(source) => {
                // Make suppressed output visible before reporting failure
                task_cache.on_error(self.reporter.as_ref());

                let duration = tracer.stop(TaskOutcome::BuildFailed);
                summary.execution = Some(TaskExecutionSummary {
                    duration_ms: duration.as_millis() as u64,
                    outcome: TaskOutcome::BuildFailed,
                });
                self.summaries.insert(id.clone(), summary);

                if self.spec.opts.run_opts.continue_on_error {
                    self.reporter.report(&RunEvent::Warning {
                        message: format!(
                            "{}: command finished with error, but continuing...",
                            prefix
                        ),
                    });
                } else {
                    self.reporter.report(&RunEvent::Error {
                        message: format!("{}: command finished with error: {}", prefix, source),
                    });
                }

                Err(TaskFailure::Process { task: id, source })
            }
            Ok(()) => {
                if let Err(err) = close_result {
                    self.reporter.report(&RunEvent::Warning {
                        message: format!("{}: could not flush log output: {}", prefix, err),
                    });
                }

                let duration = tracer.stop(TaskOutcome::Built);
                match task_cache.save_outputs(duration.as_millis() as u64) {
                    Ok(expanded) => summary.expanded_outputs = expanded,
                    Err(err) => {
                        // Store failures never fail the task
                        self.reporter.report(&RunEvent::Warning {
                            message: format!("{}: error caching output: {}", prefix, err),
                        });
                    }
                }

                summary.execution = Some(TaskExecutionSummary {
                    duration_ms: duration.as_millis() as u64,
                    outcome: TaskOutcome::Built,
                });
                self.summaries.insert(id, summary);
                Ok(())
            }
        }
    }

    fn base_summary(
        &self,
        id: &TaskId,
        task: &PackageTask,
        hash: &str,
        cache_state: ItemStatus,
    ) -> TaskSummary {
        let to_strings = |ids: Vec<TaskId>| ids.iter().map(|t| t.to_string()).collect();

        TaskSummary {
            task_id: id.to_string(),
            task: id.task.clone(),
            package: id.package.clone(),
            hash: hash.to_string(),
            cache_state,
            command: task
                .command
                .clone()
                .unwrap_or_else(|| NONEXISTENT_COMMAND.to_string()),
            dir: crate::hash::unix_path(&task.pkg.dir),
            outputs: task.definition.outputs.inclusions.clone(),
            excluded_outputs: task.definition.outputs.exclusions.clone(),
            log_file: crate::hash::unix_path(&task.log_file()),
            dependencies: to_strings(self.graph.ancestors(id)),
            dependents: to_strings(self.graph.descendants(id)),
            resolved_task_definition: task.definition.clone(),
            expanded_inputs: self.tracker.expanded_inputs(id),
            expanded_outputs: Vec::new(),
            environment: self.tracker.env_pairs(id),
            framework: task.pkg.framework.clone(),
            execution: None,
        }
    }
}
