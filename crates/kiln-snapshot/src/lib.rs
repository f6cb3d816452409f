//! Snapshots of the file system and the fingerprints derived from them.
//!
//! A [`SnapshotCache`] is created per execution and handed to everything that
//! needs to look at files. Snapshots are recursive and content addressed;
//! fingerprints reduce them to a normalized list of `(path, hash)` entries
//! according to a [`NormalizationStrategy`].

mod fingerprint;
mod inputs;
mod snapshot;

use std::io;

use camino::Utf8PathBuf;
pub use fingerprint::{
    EntryKind, Fingerprint, FingerprintChange, FingerprintEntry, NormalizationStrategy,
};
pub use inputs::{combined_digest, InputFingerprinter, InputProperty};
pub use snapshot::{FileSystemSnapshot, SnapshotCache};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{directory} contains a file name that is not valid UTF-8: {name}")]
    NonUtf8Path { directory: Utf8PathBuf, name: String },
    #[error("failed to fingerprint property '{property}': {source}")]
    Property {
        property: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Name of the input or output property this error is attributed to, if
    /// any.
    pub fn property(&self) -> Option<&str> {
        match self {
            Error::Property { property, .. } => Some(property),
            _ => None,
        }
    }
}
