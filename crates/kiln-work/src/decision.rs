use std::collections::{BTreeMap, BTreeSet};

use kiln_cache::BuildCache;
use kiln_history::HistoryEntry;
use kiln_snapshot::Fingerprint;
use kiln_types::WorkOutcome;
use tracing::{debug, warn};

use crate::NodeDescriptor;

/// What should happen to a node, and why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkDecision {
    pub outcome: WorkOutcome,
    /// The first difference found, or where up-to-date outputs came from.
    pub reasons: Vec<String>,
    /// Combined digest of the implementation and the input fingerprints.
    pub cache_key: String,
}

impl WorkDecision {
    fn new(outcome: WorkOutcome, reason: String, cache_key: String) -> Self {
        Self {
            outcome,
            reasons: vec![reason],
            cache_key,
        }
    }

    pub fn needs_work(&self) -> bool {
        self.outcome != WorkOutcome::UpToDate
    }

    /// Turns a decision into a plain execution, keeping the reasons.
    pub(crate) fn into_executed(mut self, reason: impl Into<String>) -> Self {
        self.outcome = WorkOutcome::Executed;
        self.reasons.push(reason.into());
        self
    }
}

/// Decides whether a node is up to date by comparing the current
/// fingerprints against its history.
pub struct DecisionEngine<'a> {
    cache: &'a dyn BuildCache,
    read_cache: bool,
}

impl<'a> DecisionEngine<'a> {
    pub fn new(cache: &'a dyn BuildCache, read_cache: bool) -> Self {
        Self { cache, read_cache }
    }

    /// Checks, in order: declared outputs, history, outputs, implementation,
    /// inputs. The first difference decides. Work that has to run is taken
    /// from the build cache when a matching entry exists.
    pub fn decide(
        &self,
        work: &NodeDescriptor,
        inputs: &BTreeMap<String, Fingerprint>,
        outputs: &BTreeMap<String, Fingerprint>,
        previous: Option<&HistoryEntry>,
    ) -> WorkDecision {
        let cache_key = kiln_snapshot::combined_digest(&work.implementation, inputs);

        let reason = match previous {
            _ if work.outputs.is_empty() => {
                return WorkDecision::new(
                    WorkOutcome::Executed,
                    "no declared outputs".to_string(),
                    cache_key,
                );
            }
            None => "no history".to_string(),
            Some(previous) => match Self::first_difference(work, inputs, outputs, previous) {
                Some(reason) => reason,
                None => {
                    return WorkDecision::new(WorkOutcome::UpToDate, previous.origin(), cache_key);
                }
            },
        };
        debug!("{} is out of date: {reason}", work.id);

        if work.cacheable && self.read_cache {
            match self.cache.exists(&cache_key) {
                Ok(true) => {
                    return WorkDecision::new(WorkOutcome::FromCache, reason, cache_key);
                }
                Ok(false) => {}
                Err(e) => warn!("failed to check build cache for {}: {e}", work.id),
            }
        }
        WorkDecision::new(WorkOutcome::Executed, reason, cache_key)
    }

    fn first_difference(
        work: &NodeDescriptor,
        inputs: &BTreeMap<String, Fingerprint>,
        outputs: &BTreeMap<String, Fingerprint>,
        previous: &HistoryEntry,
    ) -> Option<String> {
        for (property, current) in outputs {
            let Some(recorded) = previous.outputs.get(property) else {
                return Some(format!("output property '{property}' has been added"));
            };
            if let Some(change) = current.first_change_since(recorded) {
                return Some(format!(
                    "output property '{property}' changed since last execution: {change}"
                ));
            }
        }
        if let Some(property) = previous
            .outputs
            .keys()
            .find(|property| !outputs.contains_key(*property))
        {
            return Some(format!("output property '{property}' has been removed"));
        }

        if previous.implementation != work.implementation {
            return Some(format!(
                "implementation has changed from {} to {}",
                previous.implementation, work.implementation
            ));
        }

        let properties: BTreeSet<&String> = inputs.keys().chain(previous.inputs.keys()).collect();
        for property in properties {
            match (inputs.get(property), previous.inputs.get(property)) {
                (Some(current), Some(recorded)) => {
                    if let Some(change) = current.first_change_since(recorded) {
                        return Some(format!("input property '{property}': {change}"));
                    }
                }
                (Some(_), None) => {
                    return Some(format!("input property '{property}' has been added"));
                }
                (None, Some(_)) => {
                    return Some(format!("input property '{property}' has been removed"));
                }
                (None, None) => {}
            }
        }
        None
    }
}
