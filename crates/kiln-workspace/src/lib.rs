//! Exclusive, identity-keyed workspaces for immutable work.
//!
//! At most one holder per identity at a time, enforced with advisory file
//! locks so separate processes sharing a root cooperate too. Workspaces that
//! have not been used for a while are cleaned up.

mod metadata;
mod provider;

use camino::Utf8PathBuf;
pub use metadata::{ImmutableWorkspaceMetadata, Verification};
pub use provider::{CleanupPolicy, CleanupReport, Workspace, WorkspaceProvider};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("workspace I/O error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid workspace metadata at {path}: {source}")]
    Metadata {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}
