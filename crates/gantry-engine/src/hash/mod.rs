//! Fingerprint computation: global hash and per-task hashes

mod global;
mod tracker;

pub use global::{
    calculate_global_hash, GlobalHash, GlobalHashInputs, DEFAULT_ENV_VARS, ENV_HASH_WILDCARD,
    GLOBAL_CACHE_KEY,
};
pub use tracker::TaskHashTracker;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Hashing errors; fatal for the task (or run) being hashed
#[derive(Debug, Error)]
pub enum HashError {
    /// Cannot read an input file
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed glob pattern
    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// Filesystem error while walking a glob
    #[error("glob walk failed: {0}")]
    Glob(#[from] glob::GlobError),

    /// A prerequisite's hash was not recorded before this task hashed.
    /// The scheduler's topological order makes this unreachable; seeing it
    /// means the DAG contract was violated.
    #[error("missing hash for upstream task {0}")]
    MissingUpstreamHash(String),
}

/// Repo-relative path with forward slashes, the form used as hash-map keys
pub(crate) fn unix_path(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

/// Expand glob patterns under `base`, returning sorted repo-relative paths.
/// `ignores` are glob patterns matched against the repo-relative unix path.
pub(crate) fn expand_globs(
    repo_root: &Path,
    base: &Path,
    patterns: &[String],
    ignores: &[String],
) -> Result<Vec<PathBuf>, HashError> {
    let ignore_patterns: Vec<glob::Pattern> = ignores
        .iter()
        .map(|ig| {
            glob::Pattern::new(ig).map_err(|source| HashError::Pattern {
                pattern: ig.clone(),
                source,
            })
        })
        .collect::<Result<_, _>>()?;

    let mut out: BTreeSet<PathBuf> = BTreeSet::new();

    for pattern in patterns {
        let full = base.join(pattern);
        let full = full.to_string_lossy();
        let paths = glob::glob(&full).map_err(|source| HashError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;

        for entry in paths {
            let path = entry?;
            if !path.is_file() {
                continue;
            }
            let rel = path
                .strip_prefix(repo_root)
                .unwrap_or(&path)
                .to_path_buf();
            let rel_unix = unix_path(&rel);
            if ignore_patterns.iter().any(|p| p.matches(&rel_unix)) {
                continue;
            }
            out.insert(rel);
        }
    }

    debug!(count = out.len(), "expanded input globs");
    Ok(out.into_iter().collect())
}

/// Hash the contents of repo-relative files, keyed by unix path
pub(crate) fn hash_files(
    repo_root: &Path,
    files: &[PathBuf],
) -> Result<BTreeMap<String, String>, HashError> {
    let mut out = BTreeMap::new();

    for rel in files {
        let abs = repo_root.join(rel);
        let contents = std::fs::read(&abs).map_err(|source| HashError::FileRead {
            path: abs.clone(),
            source,
        })?;
        let digest = Sha256::digest(&contents);
        out.insert(unix_path(rel), format!("{:x}", digest));
    }

    Ok(out)
}

/// Env pairs for a task: literal names contribute `NAME=value` with the
/// empty string when absent; names with a trailing `*` are prefix wildcards
/// and contribute only variables actually set.
pub(crate) fn task_env_pairs(declared: &[String], env: &HashMap<String, String>) -> Vec<String> {
    let mut selected: BTreeMap<String, String> = BTreeMap::new();

    for name in declared {
        if let Some(prefix) = name.strip_suffix('*') {
            for (key, value) in env {
                if key.starts_with(prefix) {
                    selected.insert(key.clone(), value.clone());
                }
            }
        } else {
            let value = env.get(name).cloned().unwrap_or_default();
            selected.insert(name.clone(), value);
        }
    }

    selected
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unix_path() {
        assert_eq!(unix_path(Path::new("a/b/c.txt")), "a/b/c.txt");
    }

    #[test]
    fn test_expand_globs_with_ignores() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::create_dir_all(temp.path().join("dist")).unwrap();
        std::fs::write(temp.path().join("src/main.ts"), "x").unwrap();
        std::fs::write(temp.path().join("dist/main.js"), "y").unwrap();

        let files = expand_globs(
            temp.path(),
            temp.path(),
            &["**/*".to_string()],
            &["dist/**".to_string()],
        )
        .unwrap();

        assert_eq!(files, vec![PathBuf::from("src/main.ts")]);
    }

    #[test]
    fn test_hash_files_stable() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "hello").unwrap();

        let files = vec![PathBuf::from("a.txt")];
        let one = hash_files(temp.path(), &files).unwrap();
        let two = hash_files(temp.path(), &files).unwrap();

        assert_eq!(one, two);
        assert_eq!(one.len(), 1);
        assert!(one.contains_key("a.txt"));
    }

    #[test]
    fn test_hash_files_missing_is_fatal() {
        let temp = TempDir::new().unwrap();
        let files = vec![PathBuf::from("nope.txt")];
        assert!(hash_files(temp.path(), &files).is_err());
    }

    #[test]
    fn test_task_env_pairs_literal_absent_is_empty() {
        let env = HashMap::from([("SET".to_string(), "yes".to_string())]);
        let pairs = task_env_pairs(&["SET".to_string(), "UNSET".to_string()], &env);
        assert_eq!(pairs, vec!["SET=yes", "UNSET="]);
    }

    #[test]
    fn test_task_env_pairs_prefix_wildcard() {
        let env = HashMap::from([
            ("NEXT_PUBLIC_URL".to_string(), "u".to_string()),
            ("NEXT_PUBLIC_KEY".to_string(), "k".to_string()),
            ("OTHER".to_string(), "o".to_string()),
        ]);
        let pairs = task_env_pairs(&["NEXT_PUBLIC_*".to_string()], &env);
        assert_eq!(pairs, vec!["NEXT_PUBLIC_KEY=k", "NEXT_PUBLIC_URL=u"]);
    }
}
