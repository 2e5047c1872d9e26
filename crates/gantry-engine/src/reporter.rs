//! Run progress reporting
//!
//! Events flow through the [`RunReporter`] trait; the line constructors
//! below produce the byte-stable strings consumed by tooling and are kept
//! as pure functions so tests can pin the exact bytes.

use std::time::Duration;

use crate::task::TaskId;

/// How a cache probe resolved, for the per-task status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatusLine {
    /// Entry found, log replay suppressed
    HitSuppressed,
    /// Entry found, log replayed
    HitReplayed,
    /// No entry, the task will run
    Miss,
    /// Reads disabled for this run or task, the task will run
    Bypass,
}

/// Events emitted during a run
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Scope and target announcement at run start
    RunStarted {
        packages: Vec<String>,
        targets: Vec<String>,
        single_package: bool,
    },
    /// Whether a remote cache layer is in play
    RemoteCache { enabled: bool },
    /// A task's cache probe resolved
    TaskStatus {
        id: TaskId,
        prefix: String,
        hash: String,
        status: CacheStatusLine,
    },
    /// A line of live task output
    TaskOutput {
        id: TaskId,
        prefix: String,
        line: String,
        is_stderr: bool,
    },
    /// A line replayed from a captured log
    ReplayLine {
        id: TaskId,
        prefix: String,
        line: String,
    },
    /// A non-fatal problem worth surfacing
    Warning { message: String },
    /// A task or run error
    Error { message: String },
    /// The run finished
    RunFinished {
        successful: usize,
        cached: usize,
        attempted: usize,
        duration: Duration,
        full_turbo: bool,
    },
}

/// Sink for run events
pub trait RunReporter: Send + Sync {
    fn report(&self, event: &RunEvent);
}

/// Reporter that forwards everything to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl RunReporter for TracingReporter {
    fn report(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                packages, targets, ..
            } => {
                tracing::info!(?targets, packages = packages.len(), "run started");
            }
            RunEvent::RemoteCache { enabled } => {
                tracing::info!(enabled, "remote caching");
            }
            RunEvent::TaskStatus {
                id, hash, status, ..
            } => {
                tracing::info!(task = %id, hash = %hash, ?status, "cache status");
            }
            RunEvent::TaskOutput {
                id, line, is_stderr, ..
            } => {
                if *is_stderr {
                    tracing::warn!(task = %id, "{}", line);
                } else {
                    tracing::debug!(task = %id, "{}", line);
                }
            }
            RunEvent::ReplayLine { id, line, .. } => {
                tracing::debug!(task = %id, "{}", line);
            }
            RunEvent::Warning { message } => tracing::warn!("{}", message),
            RunEvent::Error { message } => tracing::error!("{}", message),
            RunEvent::RunFinished {
                successful,
                cached,
                attempted,
                duration,
                ..
            } => {
                tracing::info!(
                    successful,
                    cached,
                    attempted,
                    duration_ms = duration.as_millis() as u64,
                    "run finished"
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: std::sync::Mutex<Vec<RunEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RunReporter for CollectingReporter {
    fn report(&self, event: &RunEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

// --- byte-stable line constructors -------------------------------------

/// `• Packages in scope: a, b, c`
pub fn packages_in_scope_line(packages: &[String]) -> String {
    format!("• Packages in scope: {}", packages.join(", "))
}

/// `• Running build, test in 3 packages`
pub fn running_line(targets: &[String], package_count: usize) -> String {
    format!(
        "• Running {} in {} packages",
        targets.join(", "),
        package_count
    )
}

/// Single-package variant: `• Running build, test`
pub fn running_line_single(targets: &[String]) -> String {
    format!("• Running {}", targets.join(", "))
}

/// `• Remote caching enabled` / `• Remote caching disabled`
pub fn remote_caching_line(enabled: bool) -> String {
    if enabled {
        "• Remote caching enabled".to_string()
    } else {
        "• Remote caching disabled".to_string()
    }
}

/// The per-task cache status line, e.g.
/// `util:build: cache miss, executing 0123456789abcdef`
pub fn cache_status_line(prefix: &str, status: CacheStatusLine, hash: &str) -> String {
    let middle = match status {
        CacheStatusLine::HitSuppressed => "cache hit, suppressing output",
        CacheStatusLine::HitReplayed => "cache hit, replaying output",
        CacheStatusLine::Miss => "cache miss, executing",
        CacheStatusLine::Bypass => "cache bypass, force executing",
    };
    format!("{}: {}, {}", prefix, middle, hash)
}

/// The three footer lines; the time line carries the full-turbo marker when
/// every task was a cache hit
pub fn footer_lines(
    successful: usize,
    cached: usize,
    attempted: usize,
    duration: Duration,
    full_turbo: bool,
) -> [String; 3] {
    let time = if full_turbo {
        format!("Time: {} >>> FULL TURBO", format_duration(duration))
    } else {
        format!("Time: {}", format_duration(duration))
    };
    [
        format!("Tasks: {} successful, {} total", successful, attempted),
        format!("Cached: {} cached, {} total", cached, attempted),
        time,
    ]
}

/// Sub-second durations in milliseconds, everything else in seconds with
/// one decimal
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis < 1000 {
        format!("{}ms", millis)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_lines() {
        assert_eq!(
            packages_in_scope_line(&["app".to_string(), "util".to_string()]),
            "• Packages in scope: app, util"
        );
        assert_eq!(
            running_line(&["build".to_string()], 2),
            "• Running build in 2 packages"
        );
        assert_eq!(
            running_line_single(&["build".to_string(), "test".to_string()]),
            "• Running build, test"
        );
    }

    #[test]
    fn test_remote_caching_lines() {
        assert_eq!(remote_caching_line(true), "• Remote caching enabled");
        assert_eq!(remote_caching_line(false), "• Remote caching disabled");
    }

    #[test]
    fn test_cache_status_lines() {
        assert_eq!(
            cache_status_line("util:build", CacheStatusLine::Miss, "0123456789abcdef"),
            "util:build: cache miss, executing 0123456789abcdef"
        );
        assert_eq!(
            cache_status_line(
                "util:build",
                CacheStatusLine::HitSuppressed,
                "0123456789abcdef"
            ),
            "util:build: cache hit, suppressing output 0123456789abcdef"
        );
        assert_eq!(
            cache_status_line(
                "util:build",
                CacheStatusLine::HitReplayed,
                "0123456789abcdef"
            ),
            "util:build: cache hit, replaying output 0123456789abcdef"
        );
        assert_eq!(
            cache_status_line("util:build", CacheStatusLine::Bypass, "0123456789abcdef"),
            "util:build: cache bypass, force executing 0123456789abcdef"
        );
    }

    #[test]
    fn test_footer_lines() {
        let lines = footer_lines(1, 0, 1, Duration::from_millis(250), false);
        assert_eq!(lines[0], "Tasks: 1 successful, 1 total");
        assert_eq!(lines[1], "Cached: 0 cached, 1 total");
        assert_eq!(lines[2], "Time: 250ms");
    }

    #[test]
    fn test_footer_full_turbo() {
        let lines = footer_lines(2, 2, 2, Duration::from_millis(90), true);
        assert_eq!(lines[2], "Time: 90ms >>> FULL TURBO");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(999)), "999ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    }

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();
        reporter.report(&RunEvent::RemoteCache { enabled: false });
        reporter.report(&RunEvent::Warning {
            message: "slow disk".to_string(),
        });

        assert_eq!(reporter.events().len(), 2);
    }
}
