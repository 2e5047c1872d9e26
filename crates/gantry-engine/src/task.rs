//! Task identifiers and the per-run package-task view

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use gantry_core::package::PackageInfo;
use gantry_core::pipeline::TaskDefinition;

/// Directory under each package where task logs are written
const LOG_DIR: &str = ".gantry";

/// Unique identifier for a task within the workspace, `<package>#<task>`
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Package name (the root sentinel `//` for repo-root tasks)
    pub package: String,
    /// Task name (e.g. "build", "test", "lint")
    pub task: String,
}

impl TaskId {
    /// Create a new task ID
    pub fn new(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
        }
    }

    /// Parse a task ID from `package#task` format
    pub fn parse(s: &str) -> Option<Self> {
        let (package, task) = s.split_once('#')?;
        if package.is_empty() || task.is_empty() {
            return None;
        }
        Some(Self::new(package, task))
    }

    /// The prefix used for terminal output lines, `package:task`
    pub fn output_prefix(&self, single_package: bool) -> String {
        if single_package {
            self.task.clone()
        } else {
            format!("{}:{}", self.package, self.task)
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.package, self.task)
    }
}

/// A task bound to a concrete package for one run
#[derive(Debug, Clone)]
pub struct PackageTask {
    /// The task identifier
    pub id: TaskId,
    /// The owning package
    pub pkg: PackageInfo,
    /// The resolved shell command, if the package declares the script
    pub command: Option<String>,
    /// The pipeline rule this task resolved to
    pub definition: TaskDefinition,
}

impl PackageTask {
    /// Build the per-run view of a task from its package and pipeline rule
    pub fn new(id: TaskId, pkg: PackageInfo, definition: TaskDefinition) -> Self {
        let command = pkg.command(&id.task).map(str::to_string);
        Self {
            id,
            pkg,
            command,
            definition,
        }
    }

    /// Repo-relative path of the on-disk log for this task
    pub fn log_file(&self) -> PathBuf {
        self.pkg
            .dir
            .join(LOG_DIR)
            .join(format!("gantry-{}.log", self.id.task))
    }
}
