use std::{collections::BTreeMap, fs};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// What an immutable workspace contained when it was created.
///
/// Outputs of immutable work must never change after the fact. The recorded
/// digests let a later run notice when something modified them anyway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmutableWorkspaceMetadata {
    pub invocation_id: String,
    pub created_at: DateTime<Utc>,
    /// Output property name to fingerprint digest.
    pub output_digests: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    Matches,
    /// Properties whose current digest differs from the recorded one, sorted.
    Modified(Vec<String>),
}

impl ImmutableWorkspaceMetadata {
    pub fn new(invocation_id: impl Into<String>, output_digests: BTreeMap<String, String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            created_at: Utc::now(),
            output_digests,
        }
    }

    pub fn verify(&self, current: &BTreeMap<String, String>) -> Verification {
        let mut modified: Vec<String> = self
            .output_digests
            .iter()
            .filter(|(property, digest)| current.get(*property) != Some(*digest))
            .map(|(property, _)| property.clone())
            .collect();
        modified.extend(
            current
                .keys()
                .filter(|property| !self.output_digests.contains_key(*property))
                .cloned(),
        );
        modified.sort();
        modified.dedup();
        if modified.is_empty() {
            Verification::Matches
        } else {
            Verification::Modified(modified)
        }
    }

    pub(crate) fn read(path: &Utf8Path) -> Result<Option<Self>, Error> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path)(e)),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| Error::Metadata {
                path: path.to_owned(),
                source,
            })
    }

    pub(crate) fn write(&self, path: &Utf8Path) -> Result<(), Error> {
        let contents = serde_json::to_vec_pretty(self).map_err(|source| Error::Metadata {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, contents).map_err(Error::io(path))
    }
}
