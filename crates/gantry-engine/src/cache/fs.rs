//! Local filesystem cache

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Cache, CacheError, CacheMetadata, CachedArtifact, CachedFile, ItemStatus};

const METADATA_FILE: &str = "metadata.json";
const OUTPUTS_DIR: &str = "outputs";
const LOG_FILE: &str = "log";

/// Disk-backed cache: one directory per fingerprint holding the metadata
/// record, the captured output tree, and the task log.
///
/// The metadata file is written last, so its presence marks a committed
/// entry; readers treat a directory without it as a miss.
#[derive(Debug, Clone)]
pub struct FsCache {
    cache_dir: PathBuf,
}

impl FsCache {
    /// Create a cache rooted at `cache_dir` (created lazily on first store)
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// The cache root
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_dir(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(hash)
    }

    fn read_metadata(&self, hash: &str) -> Result<Option<CacheMetadata>, CacheError> {
        let path = self.entry_dir(hash).join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let metadata: CacheMetadata = serde_json::from_str(&contents)?;
        Ok(Some(metadata))
    }

    fn collect_files(
        dir: &Path,
        base: &Path,
        out: &mut Vec<CachedFile>,
    ) -> Result<(), CacheError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_files(&path, base, out)?;
            } else {
                let rel = path.strip_prefix(base).unwrap_or(&path);
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(CachedFile {
                    path: rel,
                    contents: fs::read(&path)?,
                });
            }
        }
        Ok(())
    }
}

impl Cache for FsCache {
    fn exists(&self, hash: &str) -> Result<ItemStatus, CacheError> {
        match self.read_metadata(hash)? {
            Some(metadata) => Ok(ItemStatus {
                local: true,
                remote: false,
                time_saved_ms: metadata.duration_ms,
            }),
            None => Ok(ItemStatus::miss()),
        }
    }

    fn fetch(&self, hash: &str) -> Result<Option<CachedArtifact>, CacheError> {
        let metadata = match self.read_metadata(hash)? {
            Some(m) => m,
            None => {
                debug!(hash, "cache miss");
                return Ok(None);
            }
        };

        let entry_dir = self.entry_dir(hash);
        let outputs_dir = entry_dir.join(OUTPUTS_DIR);
        let mut files = Vec::new();
        if outputs_dir.is_dir() {
            Self::collect_files(&outputs_dir, &outputs_dir, &mut files)?;
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let log_path = entry_dir.join(LOG_FILE);
        let log = if log_path.is_file() {
            fs::read(&log_path)?
        } else {
            Vec::new()
        };

        debug!(hash, files = files.len(), "cache hit");
        Ok(Some(CachedArtifact {
            metadata,
            files,
            log,
        }))
    }

    fn put(&self, hash: &str, artifact: &CachedArtifact) -> Result<(), CacheError> {
        let entry_dir = self.entry_dir(hash);
        let outputs_dir = entry_dir.join(OUTPUTS_DIR);
        fs::create_dir_all(&outputs_dir)?;

        for file in &artifact.files {
            let dest = outputs_dir.join(&file.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &file.contents)?;
        }

        fs::write(entry_dir.join(LOG_FILE), &artifact.log)?;

        // Metadata last: commits the entry
        let json = serde_json::to_string_pretty(&artifact.metadata)?;
        fs::write(entry_dir.join(METADATA_FILE), json)?;

        debug!(hash, files = artifact.files.len(), "stored cache entry");
        Ok(())
    }
}
