use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use kiln_hash::DigestBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Fingerprint, NormalizationStrategy, SnapshotCache};

/// A named set of input roots and how they are normalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputProperty {
    pub paths: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub strategy: NormalizationStrategy,
}

impl InputProperty {
    pub fn new(
        paths: impl IntoIterator<Item = impl Into<Utf8PathBuf>>,
        strategy: NormalizationStrategy,
    ) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            strategy,
        }
    }
}

pub struct InputFingerprinter<'a> {
    cache: &'a SnapshotCache,
}

impl<'a> InputFingerprinter<'a> {
    pub fn new(cache: &'a SnapshotCache) -> Self {
        Self { cache }
    }

    /// Fingerprints every property, failing on the first unreadable one.
    ///
    /// Failures are attributed to the property that could not be read.
    pub fn fingerprint_inputs(
        &self,
        inputs: &BTreeMap<String, InputProperty>,
    ) -> Result<BTreeMap<String, Fingerprint>, Error> {
        inputs
            .iter()
            .map(|(property, input)| {
                let fingerprint = Fingerprint::of_paths(self.cache, &input.paths, input.strategy)
                    .map_err(|source| Error::Property {
                        property: property.clone(),
                        source: Box::new(source),
                    })?;
                debug!(
                    "input property '{property}' fingerprinted to {}",
                    fingerprint.digest()
                );
                Ok((property.clone(), fingerprint))
            })
            .collect()
    }

    /// Output fingerprints always record absolute paths and missing entries.
    pub fn fingerprint_outputs(
        &self,
        outputs: &BTreeMap<String, Vec<Utf8PathBuf>>,
    ) -> Result<BTreeMap<String, Fingerprint>, Error> {
        outputs
            .iter()
            .map(|(property, paths)| {
                let fingerprint =
                    Fingerprint::of_paths(self.cache, paths, NormalizationStrategy::AbsolutePath)
                        .map_err(|source| Error::Property {
                            property: property.clone(),
                            source: Box::new(source),
                        })?;
                Ok((property.clone(), fingerprint))
            })
            .collect()
    }
}

/// Folds the input fingerprints and the implementation identity into a
/// single build cache key.
///
/// The map is already ordered by property name so the key does not depend on
/// declaration order.
pub fn combined_digest(implementation: &str, inputs: &BTreeMap<String, Fingerprint>) -> String {
    let mut digest = DigestBuilder::new();
    digest
        .put_str(implementation)
        .put_u64(inputs.len() as u64);
    for (property, fingerprint) in inputs {
        digest.put_str(property).put_str(fingerprint.digest());
    }
    digest.finish()
}
