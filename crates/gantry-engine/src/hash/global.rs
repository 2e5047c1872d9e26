//! The run-wide global hash

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

use gantry_core::config::PackageManager;
use gantry_core::pipeline::Pipeline;

use crate::capsule::{Capsule, Fingerprint};

use super::{expand_globs, hash_files, HashError};

/// Schema salt. Bumping it invalidates every cache entry repo-wide.
pub const GLOBAL_CACHE_KEY: &str =
    "Buffalo buffalo Buffalo buffalo buffalo buffalo Buffalo buffalo";

/// Env var names that always contribute to the global hash when set
pub const DEFAULT_ENV_VARS: &[&str] = &["VERCEL_ANALYTICS_ID"];

/// Any env var whose name contains this substring contributes when set
pub const ENV_HASH_WILDCARD: &str = "THASH";

/// Everything the global hash is computed from
#[derive(Debug)]
pub struct GlobalHashInputs<'a> {
    /// Absolute repository root
    pub repo_root: &'a Path,
    /// External-dependency digest of the root package
    pub root_external_deps_hash: &'a str,
    /// The pipeline, hashed in pristine form
    pub pipeline: &'a Pipeline,
    /// User-declared global env var names
    pub env_var_dependencies: &'a [String],
    /// User-declared global file globs
    pub global_file_dependencies: &'a [String],
    /// Workspace ignore globs applied during file expansion
    pub workspace_ignores: &'a [String],
    /// Package manager, for the specfile/lockfile fallback
    pub package_manager: &'a PackageManager,
    /// Digest of the parsed lockfile, when the collaborator has one.
    /// When absent the specfile and lockfile contents are hashed instead.
    pub lockfile_digest: Option<&'a str>,
    /// Snapshot of the process environment
    pub env: &'a HashMap<String, String>,
}

/// The computed global hash plus the intermediates surfaced in summaries
#[derive(Debug, Clone)]
pub struct GlobalHash {
    /// 16-char fingerprint parameterising every task hash
    pub value: Fingerprint,
    /// Repo-relative path -> content hash for the global file set
    pub file_hash_map: BTreeMap<String, String>,
    /// Sorted `NAME=value` pairs that contributed
    pub env_pairs: Vec<String>,
}

/// Compute the global hash for a run.
///
/// Encoding order is fixed: file-hash map, root external-deps hash, env
/// pairs, salt, pristine pipeline.
pub fn calculate_global_hash(inputs: GlobalHashInputs<'_>) -> Result<GlobalHash, HashError> {
    let env_pairs = global_env_pairs(inputs.env_var_dependencies, inputs.env);
    debug!(count = env_pairs.len(), "global hash env pairs");

    let mut files = expand_globs(
        inputs.repo_root,
        inputs.repo_root,
        inputs.global_file_dependencies,
        inputs.workspace_ignores,
    )?;

    if inputs.lockfile_digest.is_none() {
        // Without a parsed lockfile the manifest files themselves stand in
        // for the external-dependency state.
        for name in [
            inputs.package_manager.specfile.as_str(),
            inputs.package_manager.lockfile.as_str(),
        ] {
            let rel = PathBuf::from(name);
            if inputs.repo_root.join(&rel).is_file() {
                files.push(rel);
            }
        }
    }

    let file_hash_map = hash_files(inputs.repo_root, &files)?;

    let mut cap = Capsule::new();
    cap.map(file_hash_map.clone())
        .string(inputs.root_external_deps_hash)
        .seq(&env_pairs)
        .string(GLOBAL_CACHE_KEY)
        .nested(&inputs.pipeline.pristine());

    let value = cap.fingerprint();
    debug!(global_hash = %value, files = file_hash_map.len(), "computed global hash");

    Ok(GlobalHash {
        value,
        file_hash_map,
        env_pairs,
    })
}

/// Env pairs for the global hash: declared names contribute `NAME=value`
/// (empty value when absent); the default allowlist and any name containing
/// the wildcard substring contribute only when actually set.
fn global_env_pairs(declared: &[String], env: &HashMap<String, String>) -> Vec<String> {
    let mut selected: BTreeMap<String, String> = BTreeMap::new();

    for name in declared {
        let value = env.get(name).cloned().unwrap_or_default();
        selected.insert(name.clone(), value);
    }

    for name in DEFAULT_ENV_VARS {
        if let Some(value) = env.get(*name) {
            selected.insert((*name).to_string(), value.clone());
        }
    }

    for (key, value) in env {
        if key.contains(ENV_HASH_WILDCARD) {
            selected.insert(key.clone(), value.clone());
        }
    }

    selected
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}
