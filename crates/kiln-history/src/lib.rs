//! Execution history: what a unit of work looked like the last time it ran.
//!
//! Each identity has at most one [`HistoryEntry`]. Storing a new entry
//! replaces the previous one wholesale; entries are never merged.

mod fs;
mod memory;

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
pub use fs::FsHistoryStore;
use kiln_snapshot::Fingerprint;
use kiln_types::NodeId;
pub use memory::MemoryHistoryStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the persisted record format. Records with any other version
/// are rejected.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("history I/O error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("history record for {identity} is corrupt: {source}")]
    Corrupt {
        identity: NodeId,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "history record for {identity} has schema version {found}, only version {expected} is \
         supported"
    )]
    UnsupportedVersion {
        identity: NodeId,
        found: u32,
        expected: u32,
    },
    #[error("failed to serialize history record for {identity}: {source}")]
    Serialize {
        identity: NodeId,
        #[source]
        source: serde_json::Error,
    },
}

/// Fingerprints recorded after a successful execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub schema_version: u32,
    pub identity: NodeId,
    /// Id of the build invocation that produced the outputs.
    pub invocation_id: String,
    /// Identity of the action implementation, part of the cache key.
    pub implementation: String,
    pub inputs: BTreeMap<String, Fingerprint>,
    pub outputs: BTreeMap<String, Fingerprint>,
    pub cache_key: String,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl HistoryEntry {
    pub fn new(
        identity: NodeId,
        invocation_id: impl Into<String>,
        implementation: impl Into<String>,
        inputs: BTreeMap<String, Fingerprint>,
        outputs: BTreeMap<String, Fingerprint>,
        cache_key: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            identity,
            invocation_id: invocation_id.into(),
            implementation: implementation.into(),
            inputs,
            outputs,
            cache_key: cache_key.into(),
            recorded_at: Utc::now(),
            duration_ms,
        }
    }

    /// Where the recorded outputs came from, for diagnostics.
    pub fn origin(&self) -> String {
        format!(
            "outputs produced by invocation {} at {}",
            self.invocation_id,
            self.recorded_at.to_rfc3339()
        )
    }
}

/// Persistent store of one [`HistoryEntry`] per identity.
///
/// Implementations serialize access per identity; different identities may
/// be read and written concurrently.
pub trait HistoryStore: Send + Sync {
    fn load(&self, identity: &NodeId) -> Result<Option<HistoryEntry>, Error>;

    /// Replaces any previous entry for `identity`.
    fn store(&self, identity: &NodeId, entry: &HistoryEntry) -> Result<(), Error>;

    fn remove(&self, identity: &NodeId) -> Result<(), Error>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use kiln_snapshot::{Fingerprint, NormalizationStrategy};
    use kiln_types::NodeId;

    use crate::HistoryEntry;

    pub fn entry(identity: &str, invocation: &str) -> HistoryEntry {
        HistoryEntry::new(
            NodeId::new(identity),
            invocation,
            "impl@1",
            BTreeMap::from([(
                "sources".to_string(),
                Fingerprint::empty(NormalizationStrategy::RelativePath),
            )]),
            BTreeMap::from([(
                "classes".to_string(),
                Fingerprint::empty(NormalizationStrategy::AbsolutePath),
            )]),
            "cafe",
            42,
        )
    }
}
