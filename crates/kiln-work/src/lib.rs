//! Deciding whether a unit of work has to run, and running it.
//!
//! [`DecisionEngine`] compares the current fingerprints of a node against its
//! execution history. [`WorkExecutor`] drives one node end to end: it
//! fingerprints, decides, restores from the build cache or runs the node's
//! [`WorkAction`], and records the outcome for the next build.

mod action;
mod decision;
mod descriptor;
mod executor;

pub use action::{ActionContext, ActionError, CommandAction, FnAction, WorkAction};
pub use decision::{DecisionEngine, WorkDecision};
pub use descriptor::NodeDescriptor;
pub use executor::{CacheSettings, WorkExecutor, WorkResult};
use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Fingerprint(#[from] kiln_snapshot::Error),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Workspace(#[from] kiln_workspace::Error),
    #[error(transparent)]
    Cache(#[from] kiln_cache::CacheError),
    #[error("failed to remove {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}
