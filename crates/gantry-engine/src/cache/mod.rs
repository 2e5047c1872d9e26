//! Content-addressed task artifact cache
//!
//! A cache entry is keyed by a task fingerprint and holds the task's output
//! file tree, its captured log, and a small metadata record. Lookups consult
//! the local layer before the remote one; remote read failures degrade to a
//! miss rather than failing the task.

mod fs;
mod remote;

pub use fs::FsCache;
pub use remote::RemoteClient;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization error
    #[error("cache serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Entry present but unreadable
    #[error("corrupt cache entry {hash}: {reason}")]
    Corrupt { hash: String, reason: String },

    /// Output globs could not be expanded
    #[error("failed to expand outputs: {0}")]
    Outputs(String),

    /// Remote transport error
    #[error("remote cache error: {0}")]
    Remote(String),
}

/// Where (if anywhere) a fingerprint was found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatus {
    /// Present in the local cache
    pub local: bool,
    /// Present in the remote cache
    pub remote: bool,
    /// Recorded duration of the original execution, the time a hit saves
    pub time_saved_ms: u64,
}

impl ItemStatus {
    /// A plain miss
    pub fn miss() -> Self {
        Self::default()
    }

    /// Whether any layer has the entry
    pub fn is_hit(&self) -> bool {
        self.local || self.remote
    }
}

/// Metadata stored alongside a cached artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// The fingerprint this entry is keyed by
    pub hash: String,
    /// Task that produced it
    pub task_id: String,
    /// Wall time of the original execution
    pub duration_ms: u64,
    /// Exit status of the original execution; entries are only written on
    /// success so this is always zero
    pub exit_code: i32,
    /// RFC-3339 creation timestamp
    pub created_at: String,
}

/// One output file captured from the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    /// Repo-relative unix path
    pub path: String,
    /// Raw contents
    pub contents: Vec<u8>,
}

/// A complete cache entry, fully materialised in memory.
///
/// Restores hand the whole artifact to the caller before any workspace
/// write, so a truncated or corrupt entry surfaces before files land.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub metadata: CacheMetadata,
    pub files: Vec<CachedFile>,
    pub log: Vec<u8>,
}

/// The keyed store gating each task
pub trait Cache: Send + Sync {
    /// Probe for a fingerprint without fetching contents
    fn exists(&self, hash: &str) -> Result<ItemStatus, CacheError>;

    /// Fetch the full artifact, `None` on miss
    fn fetch(&self, hash: &str) -> Result<Option<CachedArtifact>, CacheError>;

    /// Store an artifact. Only called after the task exited zero.
    fn put(&self, hash: &str, artifact: &CachedArtifact) -> Result<(), CacheError>;

    /// Flush pending writes. Called exactly once at end of run; the caller
    /// bounds the wait.
    fn shutdown(&self) {}
}

/// Local-before-remote composition of cache layers
pub struct CacheStack {
    local: Option<FsCache>,
    remote: Option<Box<dyn RemoteClient>>,
}

impl CacheStack {
    pub fn new(local: Option<FsCache>, remote: Option<Box<dyn RemoteClient>>) -> Self {
        Self { local, remote }
    }

    /// Whether a remote layer is configured
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }
}

impl Cache for CacheStack {
    fn exists(&self, hash: &str) -> Result<ItemStatus, CacheError> {
        let mut status = ItemStatus::miss();

        if let Some(local) = &self.local {
            let local_status = local.exists(hash)?;
            status.local = local_status.local;
            status.time_saved_ms = local_status.time_saved_ms;
        }

        if let Some(remote) = &self.remote {
            match remote.exists(hash) {
                Ok(true) => status.remote = true,
                Ok(false) => {}
                Err(err) => {
                    warn!(hash, error = %err, "remote cache probe failed, treating as miss");
                }
            }
        }

        Ok(status)
    }

    fn fetch(&self, hash: &str) -> Result<Option<CachedArtifact>, CacheError> {
        if let Some(local) = &self.local {
            if let Some(artifact) = local.fetch(hash)? {
                debug!(hash, "cache hit (local)");
                return Ok(Some(artifact));
            }
        }

        if let Some(remote) = &self.remote {
            match remote.fetch(hash) {
                Ok(Some(artifact)) => {
                    debug!(hash, "cache hit (remote)");
                    // Backfill the local layer so the next run stays off
                    // the network.
                    if let Some(local) = &self.local {
                        if let Err(err) = local.put(hash, &artifact) {
                            warn!(hash, error = %err, "failed to backfill local cache");
                        }
                    }
                    return Ok(Some(artifact));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(hash, error = %err, "remote cache fetch failed, treating as miss");
                }
            }
        }

        Ok(None)
    }

    fn put(&self, hash: &str, artifact: &CachedArtifact) -> Result<(), CacheError> {
        if let Some(local) = &self.local {
            local.put(hash, artifact)?;
        }

        if let Some(remote) = &self.remote {
            if let Err(err) = remote.put(hash, artifact) {
                warn!(hash, error = %err, "remote cache store failed");
            }
        }

        Ok(())
    }

    fn shutdown(&self) {
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.flush() {
                warn!(error = %err, "remote cache flush failed during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn artifact(hash: &str) -> CachedArtifact {
        CachedArtifact {
            metadata: CacheMetadata {
                hash: hash.to_string(),
                task_id: "util#build".to_string(),
                duration_ms: 1200,
                exit_code: 0,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
            files: vec![CachedFile {
                path: "packages/util/dist/index.js".to_string(),
                contents: b"js".to_vec(),
            }],
            log: b"build output\n".to_vec(),
        }
    }

    /// Remote fake whose operations all fail
    struct BrokenRemote;

    impl RemoteClient for BrokenRemote {
        fn exists(&self, _hash: &str) -> Result<bool, CacheError> {
            Err(CacheError::Remote("connection refused".to_string()))
        }
        fn fetch(&self, _hash: &str) -> Result<Option<CachedArtifact>, CacheError> {
            Err(CacheError::Remote("connection refused".to_string()))
        }
        fn put(&self, _hash: &str, _artifact: &CachedArtifact) -> Result<(), CacheError> {
            Err(CacheError::Remote("connection refused".to_string()))
        }
    }

    /// Remote fake that records flushes
    struct FlushProbe(std::sync::Arc<AtomicBool>);

    impl RemoteClient for FlushProbe {
        fn exists(&self, _hash: &str) -> Result<bool, CacheError> {
            Ok(false)
        }
        fn fetch(&self, _hash: &str) -> Result<Option<CachedArtifact>, CacheError> {
            Ok(None)
        }
        fn put(&self, _hash: &str, _artifact: &CachedArtifact) -> Result<(), CacheError> {
            Ok(())
        }
        fn flush(&self) -> Result<(), CacheError> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_stack_local_roundtrip() {
        let temp = TempDir::new().unwrap();
        let stack = CacheStack::new(Some(FsCache::new(temp.path().join("cache"))), None);

        let hash = "0011223344556677";
        assert!(!stack.exists(hash).unwrap().is_hit());

        stack.put(hash, &artifact(hash)).unwrap();

        let status = stack.exists(hash).unwrap();
        assert!(status.local);
        assert!(!status.remote);
        assert_eq!(status.time_saved_ms, 1200);

        let fetched = stack.fetch(hash).unwrap().unwrap();
        assert_eq!(fetched.files.len(), 1);
        assert_eq!(fetched.log, b"build output\n");
    }

    #[test]
    fn test_remote_errors_degrade_to_miss() {
        let temp = TempDir::new().unwrap();
        let stack = CacheStack::new(
            Some(FsCache::new(temp.path().join("cache"))),
            Some(Box::new(BrokenRemote)),
        );

        let status = stack.exists("0011223344556677").unwrap();
        assert!(!status.is_hit());
        assert!(stack.fetch("0011223344556677").unwrap().is_none());

        // Writes still land locally even when the remote is down
        stack.put("0011223344556677", &artifact("0011223344556677")).unwrap();
        assert!(stack.exists("0011223344556677").unwrap().local);
    }

    #[test]
    fn test_shutdown_flushes_remote() {
        let flushed = std::sync::Arc::new(AtomicBool::new(false));
        let stack = CacheStack::new(None, Some(Box::new(FlushProbe(flushed.clone()))));

        stack.shutdown();
        assert!(flushed.load(Ordering::SeqCst));
    }
}
