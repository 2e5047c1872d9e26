//! Process supervision
//!
//! One `ProcessManager` instance owns every child process started during a
//! run. It is created at program start and passed explicitly so tests can
//! substitute their own; signal handling is wired up once via
//! [`spawn_signal_handler`].

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Process supervision errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Child finished with a non-zero exit code
    #[error("command exited with code {code}")]
    ChildExit { code: i32 },

    /// The manager is shutting down; not a task failure
    #[error("process manager is shutting down")]
    AlreadyClosing,

    /// The command could not be started
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the child failed
    #[error("failed waiting for child: {0}")]
    Wait(#[source] std::io::Error),
}

/// A line of child output, forwarded as it is read
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub line: String,
    pub is_stderr: bool,
}

/// Manager lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting new children
    Open,
    /// Shutdown requested, children still draining
    Closing,
    /// Shutdown requested and no children remain
    Closed,
}

/// Owns the set of live child processes for a run
#[derive(Debug)]
pub struct ProcessManager {
    close_tx: watch::Sender<bool>,
    live: AtomicUsize,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    /// Create an open manager
    pub fn new() -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            close_tx,
            live: AtomicUsize::new(0),
        }
    }

    /// Whether shutdown has been requested
    pub fn is_closing(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        if !self.is_closing() {
            Lifecycle::Open
        } else if self.live.load(Ordering::SeqCst) > 0 {
            Lifecycle::Closing
        } else {
            Lifecycle::Closed
        }
    }

    /// Number of live children
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Request shutdown: every in-flight `exec` kills its child and returns
    /// [`ProcessError::AlreadyClosing`]; subsequent `exec` calls fail
    /// immediately.
    pub fn close(&self) {
        let already = self.close_tx.send_replace(true);
        if !already {
            warn!(live = self.live_count(), "process manager closing");
        }
    }

    /// Spawn `cmd`, stream its output lines to `output_tx`, and wait for it
    /// to exit.
    ///
    /// The command's working directory, environment, and stdin must already
    /// be configured; stdout/stderr are claimed here.
    pub async fn exec(
        &self,
        mut cmd: Command,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<(), ProcessError> {
        let mut close_rx = self.close_tx.subscribe();
        if *close_rx.borrow() {
            return Err(ProcessError::AlreadyClosing);
        }

        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(live = self.live_count(), "child spawned");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, false, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, true, output_tx.clone()));
        }
        drop(output_tx);

        let result = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(ProcessError::ChildExit {
                    code: status.code().unwrap_or(-1),
                }),
                Err(err) => Err(ProcessError::Wait(err)),
            },
            _ = close_rx.changed() => {
                debug!("shutdown requested, killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(ProcessError::AlreadyClosing)
            }
        };

        // Let the readers drain what the child wrote before it exited
        for reader in readers {
            let _ = reader.await;
        }

        self.live.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn spawn_line_reader<R>(
    stream: R,
    is_stderr: bool,
    tx: mpsc::Sender<OutputLine>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(OutputLine { line, is_stderr }).await.is_err() {
                break;
            }
        }
    })
}

/// Install the run-wide SIGINT/SIGTERM handler: closes the manager and
/// signals scheduler cancellation. Installed once at program start.
pub fn spawn_signal_handler(manager: Arc<ProcessManager>, cancel_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_interrupt().await;
        warn!("interrupt received, shutting down");
        manager.close();
        let _ = cancel_tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn sink() -> (mpsc::Sender<OutputLine>, mpsc::Receiver<OutputLine>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn test_exec_success() {
        let manager = ProcessManager::new();
        let (tx, _rx) = sink();

        let result = manager.exec(shell("true"), tx).await;
        assert!(result.is_ok());
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit() {
        let manager = ProcessManager::new();
        let (tx, _rx) = sink();

        let err = manager.exec(shell("exit 3"), tx).await.unwrap_err();
        assert!(matches!(err, ProcessError::ChildExit { code: 3 }));
    }

    #[tokio::test]
    async fn test_exec_streams_output() {
        let manager = ProcessManager::new();
        let (tx, mut rx) = sink();

        manager
            .exec(shell("echo out; echo err >&2"), tx)
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }

        assert!(lines.iter().any(|l| l.line == "out" && !l.is_stderr));
        assert!(lines.iter().any(|l| l.line == "err" && l.is_stderr));
    }

    #[tokio::test]
    async fn test_exec_after_close_fails_immediately() {
        let manager = ProcessManager::new();
        manager.close();
        assert_eq!(manager.lifecycle(), Lifecycle::Closed);

        let (tx, _rx) = sink();
        let err = manager.exec(shell("true"), tx).await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyClosing));
    }

    #[tokio::test]
    async fn test_close_kills_running_child() {
        let manager = Arc::new(ProcessManager::new());
        let (tx, _rx) = sink();

        let exec = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.exec(shell("sleep 30"), tx).await })
        };

        // Give the child a moment to start, then pull the plug
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.lifecycle(), Lifecycle::Open);
        manager.close();

        let result = tokio::time::timeout(Duration::from_secs(5), exec)
            .await
            .expect("close must interrupt the wait")
            .unwrap();
        assert!(matches!(result, Err(ProcessError::AlreadyClosing)));
        assert_eq!(manager.lifecycle(), Lifecycle::Closed);
    }
}
