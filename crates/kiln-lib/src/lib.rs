//! Wiring for kiln: configuration, logging, signal handling and the
//! orchestration of a build invocation over a finished work graph.
//!
//! A caller resolves a [`ConfigurationOptions`] with [`KilnConfigBuilder`],
//! describes its work as a graph of [`kiln_work::NodeDescriptor`]s, and hands
//! the graph to a [`RunBuilder`]. Each [`Run::run`] call brings the requested
//! nodes up to date and returns a [`kiln_run_summary::RunSummary`].

pub mod config;
mod run;
pub mod signal;
pub mod tracing;

use miette::Diagnostic;
use thiserror::Error;

pub use crate::{
    config::{CacheConfig, ConfigurationOptions, KilnConfigBuilder},
    run::{Run, RunBuilder, RUNS_DIR},
    signal::SignalHandler,
    tracing::KilnSubscriber,
};

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] kiln_engine::BuilderError),
    #[error("execution stopped: {0}")]
    Execute(#[from] kiln_engine::ExecuteError),
    #[error("failed to open execution history: {0}")]
    History(#[from] kiln_history::Error),
    #[error("failed to open build cache: {0}")]
    Cache(#[from] kiln_cache::CacheError),
    #[error("failed to open workspaces: {0}")]
    Workspace(#[from] kiln_workspace::Error),
    #[error(transparent)]
    Signal(#[from] signal::Error),
}
