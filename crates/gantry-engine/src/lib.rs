//! Gantry Engine - the task execution core
//!
//! Computes content-addressed fingerprints per task, gates execution on a
//! local/remote artifact cache, and runs misses under a process supervisor
//! while walking the task graph in parallel with bounded concurrency.

pub mod cache;
pub mod capsule;
pub mod exec;
pub mod graph;
pub mod hash;
pub mod process;
pub mod reporter;
pub mod run;
pub mod run_state;
pub mod runcache;
pub mod scheduler;
pub mod summary;
pub mod task;

pub use cache::{Cache, CacheError, CacheStack, FsCache, ItemStatus, RemoteClient};
pub use capsule::{Capsule, Fingerprint};
pub use exec::{ExecContext, TaskFailure, TASK_HASH_ENV_VAR};
pub use graph::{TaskGraph, TaskNode};
pub use hash::{
    calculate_global_hash, GlobalHash, GlobalHashInputs, HashError, TaskHashTracker,
    DEFAULT_ENV_VARS, ENV_HASH_WILDCARD, GLOBAL_CACHE_KEY,
};
pub use process::{spawn_signal_handler, Lifecycle, OutputLine, ProcessError, ProcessManager};
pub use reporter::{CollectingReporter, RunEvent, RunReporter, TracingReporter};
pub use run::{Run, RunError, RunOutcome, CACHE_SHUTDOWN_TIMEOUT};
pub use run_state::{RunState, RunStateError, TaskOutcome, Tracer};
pub use runcache::{LogWriter, RunCache, TaskCache};
pub use scheduler::{Engine, ExecutionOptions};
pub use summary::{RunSummary, TaskSummary, TaskSummaryStore};
pub use task::{PackageTask, TaskId};
