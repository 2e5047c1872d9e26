//! Run options and the `gantry.json` configuration file

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};
use crate::package::PackageInfo;
use crate::pipeline::Pipeline;

/// Name of the configuration file at the repo root
pub const CONFIG_FILE_NAME: &str = "gantry.json";

/// How task log output is surfaced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    /// Replay everything, always
    Full,
    /// Only the per-task status line with the hash
    #[default]
    HashOnly,
    /// Full output for executed tasks, status line only for cache hits
    NewOnly,
    /// Output only for tasks that fail
    ErrorsOnly,
    /// No task output at all
    None,
}

/// Prefixing of task output lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogPrefix {
    /// `pkg:task: ` before every line
    #[default]
    Task,
    /// No prefix
    None,
}

/// Options governing scheduling and failure semantics
#[derive(Debug, Clone)]
pub struct RunOpts {
    /// Lift the concurrency bound (prerequisite edges still apply)
    pub parallel: bool,
    /// Maximum in-flight tasks
    pub concurrency: usize,
    /// Keep running sibling subtrees after a failure
    pub continue_on_error: bool,
    /// Output line prefixing
    pub log_prefix: LogPrefix,
    /// Single-package repository (no scope line, bare task IDs)
    pub single_package: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            parallel: false,
            concurrency: default_concurrency(),
            continue_on_error: false,
            log_prefix: LogPrefix::default(),
            single_package: false,
        }
    }
}

/// Default pool size when the caller does not set one. Visitors block on
/// I/O, so this is a starting point rather than a CPU-count bound.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Options for cache backends
#[derive(Debug, Clone)]
pub struct CacheOpts {
    /// Do not consult the remote cache layer
    pub skip_remote: bool,
    /// Local cache directory, relative to the repo root
    pub dir: PathBuf,
}

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            skip_remote: true,
            dir: PathBuf::from(".gantry/cache"),
        }
    }
}

/// Options for the per-run cache layer
#[derive(Debug, Clone, Default)]
pub struct RunCacheOpts {
    /// Never read from the cache (`--force`)
    pub skip_reads: bool,
    /// Never write to the cache
    pub skip_writes: bool,
    /// Log replay behaviour
    pub output_logs: OutputLogsMode,
}

/// Fully resolved run request handed to the engine by the CLI
#[derive(Debug, Clone, Default)]
pub struct RunSpecOpts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
    pub runcache_opts: RunCacheOpts,
}

/// A resolved run request: which tasks, which packages, which options
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Task names to run (e.g. `["build", "test"]`)
    pub targets: Vec<String>,
    /// Packages in scope for this run
    pub filtered_pkgs: HashSet<String>,
    /// Arguments after `--`, forwarded to the target tasks
    pub pass_through_args: Vec<String>,
    /// Option bundles
    pub opts: RunSpecOpts,
}

impl RunSpec {
    /// Pass-through args apply only to the named targets
    pub fn args_for_task(&self, task: &str) -> Vec<String> {
        if self.targets.iter().any(|t| t == task) {
            self.pass_through_args.clone()
        } else {
            Vec::new()
        }
    }
}

/// The package manager driving task commands. Gantry shells out through it
/// (`<command> run <task> [sep] [args…]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManager {
    /// Binary name, e.g. `npm`
    pub command: String,
    /// Separator inserted before pass-through args, e.g. `["--"]`
    #[serde(default)]
    pub arg_separator: Vec<String>,
    /// Manifest file name, e.g. `package.json`
    pub specfile: String,
    /// Lockfile name, e.g. `package-lock.json`
    pub lockfile: String,
}

impl Default for PackageManager {
    fn default() -> Self {
        Self {
            command: "npm".to_string(),
            arg_separator: vec!["--".to_string()],
            specfile: "package.json".to_string(),
            lockfile: "package-lock.json".to_string(),
        }
    }
}

/// The `gantry.json` file at the repo root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// The task pipeline
    #[serde(default)]
    pub pipeline: Pipeline,

    /// Globs whose contents feed the global hash
    #[serde(default)]
    pub global_dependencies: Vec<String>,

    /// Env var names that feed the global hash
    #[serde(default)]
    pub global_env: Vec<String>,

    /// Workspace packages (stand-in for manifest-based discovery)
    #[serde(default)]
    pub workspace: Vec<PackageInfo>,

    /// Glob patterns ignored when expanding global dependencies
    #[serde(default)]
    pub workspace_ignores: Vec<String>,

    /// Package manager settings
    #[serde(default)]
    pub package_manager: PackageManager,
}

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    info!(path = %path.display(), "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: ConfigFile =
        serde_json::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;

    debug!(path = %path.display(), tasks = config.pipeline.0.len(), "config loaded");
    Ok(config)
}

/// Find the configuration file in `start_dir` or a parent directory
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load configuration or fall back to defaults
pub fn load_config_or_default(dir: &Path) -> (ConfigFile, Option<PathBuf>) {
    match find_config(dir) {
        Some(path) => match load_config(&path) {
            Ok(config) => (config, Some(path)),
            Err(err) => {
                warn!(error = %err, "failed to load config, using defaults");
                (ConfigFile::default(), None)
            }
        },
        None => {
            debug!(dir = %dir.display(), "no config file found, using defaults");
            (ConfigFile::default(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_args_for_task() {
        let spec = RunSpec {
            targets: vec!["build".to_string()],
            filtered_pkgs: HashSet::new(),
            pass_through_args: vec!["--watch".to_string()],
            opts: RunSpecOpts::default(),
        };

        assert_eq!(spec.args_for_task("build"), vec!["--watch"]);
        assert!(spec.args_for_task("test").is_empty());
    }

    #[test]
    fn test_load_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "pipeline": { "build": { "dependsOn": ["^build"] } },
                "globalDependencies": ["tsconfig.json"],
                "globalEnv": ["CI"]
            }"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(config.pipeline.get("build").is_some());
        assert_eq!(config.global_dependencies, vec!["tsconfig.json"]);
        assert_eq!(config.global_env, vec!["CI"]);
    }

    #[test]
    fn test_find_config_walks_up() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE_NAME), "{}").unwrap();
        let nested = temp.path().join("packages/app");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, temp.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_load_config_or_default_missing() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path());
        assert!(path.is_none());
        assert!(config.pipeline.0.is_empty());
    }
}
