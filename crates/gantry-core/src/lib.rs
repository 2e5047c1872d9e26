//! Gantry Core - shared data model for the task runner
//!
//! This crate holds the workspace/package model, the pipeline types, the
//! resolved run options, and the error hierarchy shared by the engine and
//! the CLI.

pub mod config;
pub mod error;
pub mod package;
pub mod pipeline;

pub use config::{
    load_config_or_default, CacheOpts, ConfigFile, LogPrefix, OutputLogsMode, PackageManager,
    RunCacheOpts, RunOpts, RunSpec, RunSpecOpts,
};
pub use error::{ConfigError, CoreError, GraphError, Result};
pub use package::{PackageGraph, PackageInfo, ROOT_PACKAGE_NAME};
pub use pipeline::{Pipeline, PristinePipeline, TaskDefinition, TaskOutputs};
