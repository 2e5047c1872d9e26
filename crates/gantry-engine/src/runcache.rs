//! Per-task cache orchestration
//!
//! `RunCache` binds the artifact cache to one run's options; `TaskCache`
//! binds it to one task + fingerprint and handles output restoration, the
//! on-disk log the executor tees child output into, artifact capture after
//! a successful build, and log replay on both hits and failures.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use gantry_core::config::{OutputLogsMode, RunCacheOpts};

use crate::cache::{Cache, CacheError, CacheMetadata, CachedArtifact, CachedFile};
use crate::hash::{expand_globs, unix_path};
use crate::reporter::{CacheStatusLine, RunEvent, RunReporter};
use crate::task::PackageTask;

/// The run-scoped cache facade
pub struct RunCache {
    cache: Arc<dyn Cache>,
    repo_root: PathBuf,
    opts: RunCacheOpts,
}

impl RunCache {
    pub fn new(cache: Arc<dyn Cache>, repo_root: PathBuf, opts: RunCacheOpts) -> Self {
        Self {
            cache,
            repo_root,
            opts,
        }
    }

    /// The underlying cache, for existence probes and shutdown
    pub fn cache(&self) -> Arc<dyn Cache> {
        self.cache.clone()
    }

    /// Bind to one task and its fingerprint
    pub fn task_cache(&self, task: &PackageTask, hash: &str, prefix: String) -> TaskCache {
        TaskCache {
            cache: self.cache.clone(),
            repo_root: self.repo_root.clone(),
            opts: self.opts.clone(),
            caching_disabled: !task.definition.cache,
            task: task.clone(),
            hash: hash.to_string(),
            prefix,
        }
    }
}

/// Cache operations for a single task
pub struct TaskCache {
    cache: Arc<dyn Cache>,
    repo_root: PathBuf,
    opts: RunCacheOpts,
    caching_disabled: bool,
    task: PackageTask,
    hash: String,
    prefix: String,
}

impl TaskCache {
    /// Whether live child output should be streamed to the terminal
    pub fn should_stream(&self) -> bool {
        matches!(
            self.opts.output_logs,
            OutputLogsMode::Full | OutputLogsMode::NewOnly
        )
    }

    /// Try to restore this task's outputs from the cache.
    ///
    /// On a hit every output file and the captured log are written back into
    /// the workspace before `Ok(true)` is returned. Emits the task's cache
    /// status line.
    pub fn restore_outputs(&self, reporter: &dyn RunReporter) -> Result<bool, CacheError> {
        if self.caching_disabled || self.opts.skip_reads {
            self.emit_status(reporter, CacheStatusLine::Bypass);
            return Ok(false);
        }

        let artifact = match self.cache.fetch(&self.hash)? {
            Some(artifact) => artifact,
            None => {
                self.emit_status(reporter, CacheStatusLine::Miss);
                return Ok(false);
            }
        };

        for file in &artifact.files {
            let dest = self.repo_root.join(&file.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(CacheError::Io)?;
            }
            fs::write(&dest, &file.contents).map_err(CacheError::Io)?;
        }

        let log_path = self.repo_root.join(self.task.log_file());
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).map_err(CacheError::Io)?;
        }
        fs::write(&log_path, &artifact.log).map_err(CacheError::Io)?;

        match self.opts.output_logs {
            OutputLogsMode::Full | OutputLogsMode::NewOnly => {
                self.emit_status(reporter, CacheStatusLine::HitReplayed);
                self.replay_log(reporter, &artifact.log);
            }
            OutputLogsMode::HashOnly => {
                self.emit_status(reporter, CacheStatusLine::HitSuppressed);
            }
            OutputLogsMode::ErrorsOnly | OutputLogsMode::None => {}
        }

        debug!(task = %self.task.id, hash = %self.hash, files = artifact.files.len(), "outputs restored");
        Ok(true)
    }

    /// Open the on-disk log for this execution. The executor tees child
    /// output into it; the file is captured into the cache afterwards.
    pub fn output_writer(&self) -> std::io::Result<LogWriter> {
        let path = self.repo_root.join(self.task.log_file());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&path)?;
        Ok(LogWriter {
            writer: BufWriter::new(file),
        })
    }

    /// Capture the task's outputs and log into the cache after a zero exit.
    ///
    /// Returns the expanded output paths either way; storing is skipped when
    /// writes are disabled.
    pub fn save_outputs(&self, duration_ms: u64) -> Result<Vec<String>, CacheError> {
        let pkg_base = self.repo_root.join(&self.task.pkg.dir);
        let pkg_prefix = unix_path(&self.task.pkg.dir);
        let exclusions: Vec<String> = self
            .task
            .definition
            .outputs
            .exclusions
            .iter()
            .map(|e| format!("{}/{}", pkg_prefix, e))
            .collect();

        let files = expand_globs(
            &self.repo_root,
            &pkg_base,
            &self.task.definition.outputs.inclusions,
            &exclusions,
        )
        .map_err(|err| CacheError::Outputs(err.to_string()))?;

        let expanded: Vec<String> = files.iter().map(|p| unix_path(p)).collect();

        if self.caching_disabled || self.opts.skip_writes {
            debug!(task = %self.task.id, "cache writes disabled, not storing");
            return Ok(expanded);
        }

        let mut cached_files = Vec::with_capacity(files.len());
        for rel in &files {
            let contents = fs::read(self.repo_root.join(rel)).map_err(CacheError::Io)?;
            cached_files.push(CachedFile {
                path: unix_path(rel),
                contents,
            });
        }

        let log_path = self.repo_root.join(self.task.log_file());
        let log = if log_path.is_file() {
            fs::read(&log_path).map_err(CacheError::Io)?
        } else {
            Vec::new()
        };

        let artifact = CachedArtifact {
            metadata: CacheMetadata {
                hash: self.hash.clone(),
                task_id: self.task.id.to_string(),
                duration_ms,
                exit_code: 0,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
            files: cached_files,
            log,
        };

        self.cache.put(&self.hash, &artifact)?;
        debug!(task = %self.task.id, hash = %self.hash, outputs = expanded.len(), "outputs stored");
        Ok(expanded)
    }

    /// Surface the buffered log after a failed execution, so suppressed
    /// output becomes visible exactly when it matters
    pub fn on_error(&self, reporter: &dyn RunReporter) {
        if self.opts.output_logs == OutputLogsMode::None {
            return;
        }
        if self.should_stream() {
            // Output was already live
            return;
        }

        let log_path = self.repo_root.join(self.task.log_file());
        match fs::read(&log_path) {
            Ok(log) => self.replay_log(reporter, &log),
            Err(err) => {
                warn!(task = %self.task.id, error = %err, "could not replay log after failure");
            }
        }
    }

    fn emit_status(&self, reporter: &dyn RunReporter, status: CacheStatusLine) {
        if matches!(
            self.opts.output_logs,
            OutputLogsMode::ErrorsOnly | OutputLogsMode::None
        ) {
            return;
        }
        reporter.report(&RunEvent::TaskStatus {
            id: self.task.id.clone(),
            prefix: self.prefix.clone(),
            hash: self.hash.clone(),
            status,
        });
    }

    fn replay_log(&self, reporter: &dyn RunReporter, log: &[u8]) {
        for line in String::from_utf8_lossy(log).lines() {
            reporter.report(&RunEvent::ReplayLine {
                id: self.task.id.clone(),
                prefix: self.prefix.clone(),
                line: line.to_string(),
            });
        }
    }
}

/// Buffered writer over the task's on-disk log
pub struct LogWriter {
    writer: BufWriter<fs::File>,
}

impl LogWriter {
    /// Append one line
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    /// Flush and close
    pub fn close(mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
