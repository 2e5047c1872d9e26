//! The run facade: wires the hasher, cache, supervisor, and scheduler
//! together for one invocation and aggregates the result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use gantry_core::config::{PackageManager, RunSpec};
use gantry_core::error::GraphError;
use gantry_core::package::{PackageGraph, PackageInfo};
use gantry_core::pipeline::Pipeline;

use crate::cache::{Cache, CacheStack, FsCache, RemoteClient};
use crate::exec::ExecContext;
use crate::graph::TaskGraph;
use crate::hash::{calculate_global_hash, GlobalHashInputs, HashError, TaskHashTracker};
use crate::process::ProcessManager;
use crate::reporter::{RunEvent, RunReporter};
use crate::run_state::{RunState, RunStateError, TaskOutcome};
use crate::runcache::RunCache;
use crate::scheduler::{Engine, ExecutionOptions};
use crate::summary::{RunSummary, TaskSummaryStore};

/// Hard upper bound on the end-of-run cache flush
pub const CACHE_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1500);

/// Errors that abort a run before or after task execution
#[derive(Debug, Error)]
pub enum RunError {
    /// Graph construction failed; no task ran
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The global hash could not be computed; no task ran
    #[error("global hash error: {0}")]
    Hash(#[from] HashError),

    /// Run-state bookkeeping error
    #[error(transparent)]
    State(#[from] RunStateError),
}

/// The aggregate result of a run
#[derive(Debug)]
pub struct RunOutcome {
    /// `0` on full success, the maximum non-zero child exit code otherwise,
    /// `1` if any non-child error occurred
    pub exit_code: i32,
    /// The summary document, emitted as JSON on success
    pub summary: RunSummary,
}

/// A fully resolved run, ready to execute
pub struct Run {
    /// Absolute repository root
    pub repo_root: PathBuf,
    /// The resolved CLI request
    pub spec: RunSpec,
    /// Discovered workspace packages
    pub packages: Vec<PackageInfo>,
    /// The pipeline
    pub pipeline: Pipeline,
    /// Package manager settings
    pub package_manager: PackageManager,
    /// Global file-glob dependencies
    pub global_file_dependencies: Vec<String>,
    /// Global env-var dependencies
    pub global_env_dependencies: Vec<String>,
    /// Ignore globs applied when expanding global files
    pub workspace_ignores: Vec<String>,
    /// External-deps digest of the root package
    pub root_external_deps_hash: String,
    /// Parsed-lockfile digest, when available
    pub lockfile_digest: Option<String>,
    /// Snapshot of the process environment
    pub env: HashMap<String, String>,
    /// Optional remote cache layer
    pub remote_cache: Option<Box<dyn RemoteClient>>,
}

impl Run {
    /// Execute the run to completion.
    ///
    /// `processes` must be the program-wide supervisor; `cancel` is the
    /// run-wide cancellation signal (flipped by the signal handler).
    pub async fn execute(
        self,
        processes: Arc<ProcessManager>,
        reporter: Arc<dyn RunReporter>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, RunError> {
        let package_graph = PackageGraph::build(&self.packages)?;

        let mut scope: Vec<String> = self.spec.filtered_pkgs.iter().cloned().collect();
        scope.sort();

        let single_package = self.spec.opts.run_opts.single_package;
        reporter.report(&RunEvent::RunStarted {
            packages: scope.clone(),
            targets: self.spec.targets.clone(),
            single_package,
        });

        let remote_enabled =
            !self.spec.opts.cache_opts.skip_remote && self.remote_cache.is_some();
        reporter.report(&RunEvent::RemoteCache {
            enabled: remote_enabled,
        });

        let graph = Arc::new(TaskGraph::build(
            &package_graph,
            &self.pipeline,
            &self.spec.targets,
            &scope,
        )?);

        let global = calculate_global_hash(GlobalHashInputs {
            repo_root: &self.repo_root,
            root_external_deps_hash: &self.root_external_deps_hash,
            pipeline: &self.pipeline,
            env_var_dependencies: &self.global_env_dependencies,
            global_file_dependencies: &self.global_file_dependencies,
            workspace_ignores: &self.workspace_ignores,
            package_manager: &self.package_manager,
            lockfile_digest: self.lockfile_digest.as_deref(),
            env: &self.env,
        })?;
        info!(global_hash = %global.value, "global hash");

        let tracker = Arc::new(TaskHashTracker::new(
            self.repo_root.clone(),
            global.value.clone(),
            self.env.clone(),
        ));

        let local = FsCache::new(self.repo_root.join(&self.spec.opts.cache_opts.dir));
        let remote = if self.spec.opts.cache_opts.skip_remote {
            None
        } else {
            self.remote_cache
        };
        let cache: Arc<dyn Cache> = Arc::new(CacheStack::new(Some(local), remote));
        let run_cache = Arc::new(RunCache::new(
            cache.clone(),
            self.repo_root.clone(),
            self.spec.opts.runcache_opts.clone(),
        ));

        let run_state = Arc::new(RunState::new());
        let summaries = Arc::new(TaskSummaryStore::new());

        let exec_opts = ExecutionOptions {
            parallel: self.spec.opts.run_opts.parallel,
            concurrency: self.spec.opts.run_opts.concurrency,
            continue_on_error: self.spec.opts.run_opts.continue_on_error,
        };

        let ctx = Arc::new(ExecContext {
            repo_root: self.repo_root.clone(),
            spec: self.spec,
            package_manager: self.package_manager,
            graph: graph.clone(),
            tracker,
            run_cache,
            processes,
            run_state: run_state.clone(),
            summaries: summaries.clone(),
            reporter: reporter.clone(),
        });

        let engine = Engine::new(graph);
        let visitor_ctx = ctx.clone();
        let errors = engine
            .execute(
                move |id| {
                    let ctx = visitor_ctx.clone();
                    async move { ctx.visit(id).await }
                },
                &exec_opts,
                cancel,
            )
            .await;

        // Flush the cache with a bounded wait; an overrun is logged, never
        // fatal
        let shutdown_cache = cache.clone();
        let flush = tokio::task::spawn_blocking(move || shutdown_cache.shutdown());
        if tokio::time::timeout(CACHE_SHUTDOWN_TIMEOUT, flush).await.is_err() {
            warn!(
                timeout_ms = CACHE_SHUTDOWN_TIMEOUT.as_millis() as u64,
                "cache shutdown timed out"
            );
            reporter.report(&RunEvent::Warning {
                message: "timed out writing to cache".to_string(),
            });
        }

        let mut child_exit_max = 0;
        let mut saw_non_child_error = false;
        for (_task, err) in &errors {
            match err.child_exit_code() {
                Some(code) => child_exit_max = child_exit_max.max(code),
                None => saw_non_child_error = true,
            }
            reporter.report(&RunEvent::Error {
                message: err.to_string(),
            });
        }
        let exit_code = if child_exit_max > 0 {
            child_exit_max
        } else if saw_non_child_error || !errors.is_empty() {
            1
        } else {
            0
        };

        run_state.close()?;

        let attempted = summaries.len();
        let cached = summaries.count_outcome(TaskOutcome::Cached);
        let failed = summaries.count_outcome(TaskOutcome::BuildFailed);
        let successful = attempted.saturating_sub(failed);
        let full_turbo = attempted > 0 && cached == attempted;

        reporter.report(&RunEvent::RunFinished {
            successful,
            cached,
            attempted,
            duration: run_state.elapsed(),
            full_turbo,
        });

        let summary = summaries.finalize(exit_code);
        Ok(RunOutcome { exit_code, summary })
    }
}
