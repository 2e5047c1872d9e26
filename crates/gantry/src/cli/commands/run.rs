//! Run command — execute tasks across the workspace

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use console::style;
use tokio::sync::watch;

use gantry_core::config::{
    default_concurrency, load_config_or_default, CacheOpts, LogPrefix, OutputLogsMode,
    RunCacheOpts, RunOpts, RunSpec, RunSpecOpts, CONFIG_FILE_NAME,
};
use gantry_core::package::ROOT_PACKAGE_NAME;
use gantry_engine::reporter::{
    cache_status_line, footer_lines, packages_in_scope_line, remote_caching_line, running_line,
    running_line_single,
};
use gantry_engine::{spawn_signal_handler, ProcessManager, Run, RunEvent, RunReporter};

use crate::cli::Cli;
use crate::exit_codes;

/// Output log modes accepted on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputLogsArg {
    Full,
    #[default]
    HashOnly,
    NewOnly,
    ErrorsOnly,
    None,
}

impl From<OutputLogsArg> for OutputLogsMode {
    fn from(arg: OutputLogsArg) -> Self {
        match arg {
            OutputLogsArg::Full => Self::Full,
            OutputLogsArg::HashOnly => Self::HashOnly,
            OutputLogsArg::NewOnly => Self::NewOnly,
            OutputLogsArg::ErrorsOnly => Self::ErrorsOnly,
            OutputLogsArg::None => Self::None,
        }
    }
}

/// Log prefix modes accepted on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogPrefixArg {
    #[default]
    Task,
    None,
}

impl From<LogPrefixArg> for LogPrefix {
    fn from(arg: LogPrefixArg) -> Self {
        match arg {
            LogPrefixArg::Task => Self::Task,
            LogPrefixArg::None => Self::None,
        }
    }
}

/// Run tasks across the workspace
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Tasks to run (e.g., build test lint)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Filter to specific packages (can be repeated)
    #[arg(long)]
    pub filter: Vec<String>,

    /// Ignore the concurrency bound and run everything eligible at once
    #[arg(long)]
    pub parallel: bool,

    /// Maximum concurrent tasks
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Continue running sibling tasks when one fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Treat the repository as a single package
    #[arg(long)]
    pub single_package: bool,

    /// Do not consult the remote cache
    #[arg(long)]
    pub skip_remote: bool,

    /// Ignore existing cache entries and re-run everything
    #[arg(long)]
    pub force: bool,

    /// Do not write new cache entries
    #[arg(long)]
    pub no_cache: bool,

    /// How task logs are surfaced
    #[arg(long, value_enum, default_value = "hash-only")]
    pub output_logs: OutputLogsArg,

    /// Prefixing of task output lines
    #[arg(long, value_enum, default_value = "task")]
    pub log_prefix: LogPrefixArg,

    /// Arguments forwarded to the target tasks
    #[arg(last = true)]
    pub pass_through: Vec<String>,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<i32> {
        let cwd = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&cwd);
        let repo_root = config_path
            .as_deref()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf())
            .unwrap_or(cwd);

        if config.workspace.is_empty() {
            anyhow::bail!(
                "no packages declared in {}; nothing to run",
                CONFIG_FILE_NAME
            );
        }

        // Determine which packages are in scope
        let known: HashSet<&str> = config
            .workspace
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        let filtered_pkgs: HashSet<String> = if self.filter.is_empty() {
            known.iter().map(|n| n.to_string()).collect()
        } else {
            for name in &self.filter {
                if !known.contains(name.as_str()) && name != ROOT_PACKAGE_NAME {
                    anyhow::bail!("filtered package '{}' not found in workspace", name);
                }
            }
            self.filter.iter().cloned().collect()
        };

        let spec = RunSpec {
            targets: self.tasks.clone(),
            filtered_pkgs,
            pass_through_args: self.pass_through.clone(),
            opts: RunSpecOpts {
                run_opts: RunOpts {
                    parallel: self.parallel,
                    concurrency: self.concurrency.unwrap_or_else(default_concurrency),
                    continue_on_error: self.continue_on_error,
                    log_prefix: self.log_prefix.into(),
                    single_package: self.single_package,
                },
                cache_opts: CacheOpts {
                    skip_remote: self.skip_remote,
                    ..CacheOpts::default()
                },
                runcache_opts: RunCacheOpts {
                    skip_reads: self.force,
                    skip_writes: self.no_cache,
                    // --verbose always streams and replays everything
                    output_logs: if cli.verbose {
                        OutputLogsMode::Full
                    } else {
                        self.output_logs.into()
                    },
                },
            },
        };

        let root_external_deps_hash = config
            .workspace
            .iter()
            .find(|p| p.name == ROOT_PACKAGE_NAME)
            .map(|p| p.external_deps_hash.clone())
            .unwrap_or_default();

        let run = Run {
            repo_root,
            spec,
            packages: config.workspace.clone(),
            pipeline: config.pipeline.clone(),
            package_manager: config.package_manager.clone(),
            global_file_dependencies: config.global_dependencies.clone(),
            global_env_dependencies: config.global_env.clone(),
            workspace_ignores: config.workspace_ignores.clone(),
            root_external_deps_hash,
            lockfile_digest: None,
            env: std::env::vars().collect(),
            remote_cache: None,
        };

        // One supervisor per program, wired to SIGINT/SIGTERM
        let processes = Arc::new(ProcessManager::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        spawn_signal_handler(processes.clone(), cancel_tx);

        let reporter: Arc<dyn RunReporter> = if cli.quiet {
            Arc::new(gantry_engine::TracingReporter)
        } else {
            Arc::new(ConsoleReporter::new(self.log_prefix.into()))
        };

        let outcome = run
            .execute(processes, reporter, cancel_rx)
            .await
            .context("run failed before any task executed")?;

        if outcome.exit_code == exit_codes::SUCCESS && !cli.quiet {
            println!("{}", serde_json::to_string_pretty(&outcome.summary)?);
        }

        Ok(outcome.exit_code)
    }
}

/// Console reporter emitting the stable terminal lines
struct ConsoleReporter {
    log_prefix: LogPrefix,
}

impl ConsoleReporter {
    fn new(log_prefix: LogPrefix) -> Self {
        Self { log_prefix }
    }

    fn prefixed(&self, prefix: &str, line: &str) -> String {
        match self.log_prefix {
            LogPrefix::None => line.to_string(),
            LogPrefix::Task => format!("{}: {}", prefix, line),
        }
    }
}

impl RunReporter for ConsoleReporter {
    fn report(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                packages,
                targets,
                single_package,
            } => {
                if *single_package {
                    println!("{}", style(running_line_single(targets)).dim());
                } else {
                    println!("{}", style(packages_in_scope_line(packages)).dim());
                    println!("{}", style(running_line(targets, packages.len())).dim());
                }
            }
            RunEvent::RemoteCache { enabled } => {
                println!("{}", style(remote_caching_line(*enabled)).dim());
            }
            RunEvent::TaskStatus {
                prefix,
                hash,
                status,
                ..
            } => {
                println!("{}", cache_status_line(prefix, *status, hash));
            }
            RunEvent::TaskOutput {
                prefix,
                line,
                is_stderr,
                ..
            } => {
                if *is_stderr {
                    eprintln!("{}", self.prefixed(prefix, line));
                } else {
                    println!("{}", self.prefixed(prefix, line));
                }
            }
            RunEvent::ReplayLine { prefix, line, .. } => {
                println!("{}", self.prefixed(prefix, line));
            }
            RunEvent::Warning { message } => {
                eprintln!("{} {}", style("WARNING").yellow().bold(), message);
            }
            RunEvent::Error { message } => {
                eprintln!("{} {}", style("ERROR").red().bold(), message);
            }
            RunEvent::RunFinished {
                successful,
                cached,
                attempted,
                duration,
                full_turbo,
            } => {
                println!();
                for line in footer_lines(*successful, *cached, *attempted, *duration, *full_turbo)
                {
                    println!("{}", line);
                }
            }
        }
    }
}
