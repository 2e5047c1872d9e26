//! Remote cache layer interface
//!
//! The transport itself (HTTP, OCI, …) lives outside the engine; embedders
//! hand the stack an implementation of this trait. Reads that fail degrade
//! to a miss at the stack level, writes are fire-and-forget.

use super::{CacheError, CachedArtifact};

/// A remote artifact store consulted after the local layer
pub trait RemoteClient: Send + Sync {
    /// Probe for a fingerprint
    fn exists(&self, hash: &str) -> Result<bool, CacheError>;

    /// Fetch the full artifact, `None` on miss
    fn fetch(&self, hash: &str) -> Result<Option<CachedArtifact>, CacheError>;

    /// Upload an artifact
    fn put(&self, hash: &str, artifact: &CachedArtifact) -> Result<(), CacheError>;

    /// Flush buffered uploads; called once during cache shutdown with a
    /// bounded wait
    fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
