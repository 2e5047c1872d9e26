//! Pipeline task definitions and their canonical (pristine) form

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Prefix marking a dependency on the same task in upstream packages
/// (`"^build"` = build of every workspace dependency).
pub const TOPOLOGICAL_PREFIX: char = '^';

/// Output file globs for a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutputs {
    /// Globs selecting files produced by the task, relative to the package
    #[serde(default)]
    pub inclusions: Vec<String>,
    /// Globs excluded from the inclusion set
    #[serde(default)]
    pub exclusions: Vec<String>,
}

impl TaskOutputs {
    /// True when the task declares no outputs at all
    pub fn is_empty(&self) -> bool {
        self.inclusions.is_empty() && self.exclusions.is_empty()
    }
}

/// Definition of a task in the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Task IDs that must complete first. Entries starting with `^` refer to
    /// the same task in upstream packages; plain entries refer to tasks in
    /// the same package.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Input glob patterns, relative to the package (empty = every file)
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Output globs captured into the cache on success
    #[serde(default)]
    pub outputs: TaskOutputs,

    /// Environment variable names this task's hash depends on.
    /// A trailing `*` makes the entry a prefix wildcard.
    #[serde(default)]
    pub env: Vec<String>,

    /// Whether results may be cached at all
    #[serde(default = "default_true")]
    pub cache: bool,
}

fn default_true() -> bool {
    true
}

impl TaskDefinition {
    /// Create an empty definition
    pub fn new() -> Self {
        Self {
            cache: true,
            ..Self::default()
        }
    }

    /// Add a dependency entry
    pub fn with_depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Set input globs
    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Set output inclusion globs
    pub fn with_outputs(mut self, inclusions: Vec<String>) -> Self {
        self.outputs.inclusions = inclusions;
        self
    }

    /// Set env-var dependencies
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Same-package dependency task names (entries without the `^` prefix)
    pub fn task_dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .map(String::as_str)
            .filter(|d| !d.starts_with(TOPOLOGICAL_PREFIX))
    }

    /// Upstream-package dependency task names (entries with the `^` prefix,
    /// returned without it)
    pub fn topological_dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .filter_map(|d| d.strip_prefix(TOPOLOGICAL_PREFIX))
    }
}

/// The declarative pipeline: task name -> definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline(pub BTreeMap<String, TaskDefinition>);

impl Pipeline {
    /// Look up a task definition
    pub fn get(&self, task: &str) -> Option<&TaskDefinition> {
        self.0.get(task)
    }

    /// The canonical form used for hashing. Task keys are already sorted by
    /// the backing map; the clone decouples the hashed snapshot from later
    /// mutation.
    pub fn pristine(&self) -> PristinePipeline {
        PristinePipeline(self.0.clone())
    }
}

impl FromIterator<(String, TaskDefinition)> for Pipeline {
    fn from_iter<I: IntoIterator<Item = (String, TaskDefinition)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Canonical pipeline snapshot fed into the global hash.
///
/// Byte-for-byte stability of its encoding is part of the cache-key
/// contract; see the capsule encoder in the engine crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PristinePipeline(pub BTreeMap<String, TaskDefinition>);
