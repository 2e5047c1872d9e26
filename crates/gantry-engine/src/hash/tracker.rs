//! Per-task hash calculation and the run-wide hash store

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use crate::capsule::{Capsule, Fingerprint};
use crate::task::{PackageTask, TaskId};

use super::{expand_globs, hash_files, task_env_pairs, HashError};

/// Input globs used when a task declares none
const DEFAULT_INPUTS: &[&str] = &["**/*"];

/// Directories never considered task inputs
const IMPLICIT_INPUT_IGNORES: &[&str] = &["**/.gantry/**", "**/node_modules/**"];

/// Computes task hashes and remembers them for downstream lookups.
///
/// Writes happen before any dependent task reads: the scheduler only marks a
/// task ready once every prerequisite's visitor has returned, so the mutex
/// here guards the map itself, not the ordering.
#[derive(Debug)]
pub struct TaskHashTracker {
    repo_root: PathBuf,
    global_hash: Fingerprint,
    env: HashMap<String, String>,
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    hashes: HashMap<TaskId, Fingerprint>,
    env_pairs: HashMap<TaskId, Vec<String>>,
    expanded_inputs: HashMap<TaskId, BTreeMap<String, String>>,
}

impl TaskHashTracker {
    /// Create a tracker parameterised by the run's global hash and an
    /// environment snapshot
    pub fn new(
        repo_root: PathBuf,
        global_hash: Fingerprint,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            repo_root,
            global_hash,
            env,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Compute and record the fingerprint for one package task.
    ///
    /// `upstream` must be the task's direct prerequisites; their hashes must
    /// already be recorded.
    pub fn calculate_task_hash(
        &self,
        task: &PackageTask,
        upstream: &[TaskId],
        pass_through_args: &[String],
    ) -> Result<Fingerprint, HashError> {
        let input_globs: Vec<String> = if task.definition.inputs.is_empty() {
            DEFAULT_INPUTS.iter().map(|s| s.to_string()).collect()
        } else {
            task.definition.inputs.clone()
        };
        let ignores: Vec<String> = IMPLICIT_INPUT_IGNORES
            .iter()
            .map(|s| s.to_string())
            .collect();

        let pkg_base = self.repo_root.join(&task.pkg.dir);
        let files = expand_globs(&self.repo_root, &pkg_base, &input_globs, &ignores)?;
        let input_hashes = hash_files(&self.repo_root, &files)?;

        let env_pairs = task_env_pairs(&task.definition.env, &self.env);

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut upstream_hashes: Vec<Fingerprint> = upstream
            .iter()
            .map(|id| {
                state
                    .hashes
                    .get(id)
                    .cloned()
                    .ok_or_else(|| HashError::MissingUpstreamHash(id.to_string()))
            })
            .collect::<Result<_, _>>()?;
        upstream_hashes.sort();

        let mut cap = Capsule::new();
        cap.string(&task.id.package)
            .string(&task.id.task)
            .string(task.command.as_deref().unwrap_or_default())
            .seq(&task.definition.outputs.inclusions)
            .seq(&task.definition.outputs.exclusions)
            .seq(&env_pairs)
            .seq(&upstream_hashes)
            .map(input_hashes.clone())
            .seq(pass_through_args)
            .string(&self.global_hash);

        let hash = cap.fingerprint();
        debug!(task = %task.id, hash = %hash, inputs = input_hashes.len(), "task hash");

        state.hashes.insert(task.id.clone(), hash.clone());
        state.env_pairs.insert(task.id.clone(), env_pairs);
        state.expanded_inputs.insert(task.id.clone(), input_hashes);

        Ok(hash)
    }

    /// The recorded hash for a task, if computed
    pub fn hash(&self, id: &TaskId) -> Option<Fingerprint> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .hashes
            .get(id)
            .cloned()
    }

    /// Env pairs that went into a task's hash
    pub fn env_pairs(&self, id: &TaskId) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .env_pairs
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Expanded input files (path -> content hash) for a task
    pub fn expanded_inputs(&self, id: &TaskId) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .expanded_inputs
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}
