use dashmap::DashMap;
use kiln_types::NodeId;

use crate::{Error, HistoryEntry, HistoryStore};

/// In-process history, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: DashMap<NodeId, HistoryEntry>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self, identity: &NodeId) -> Result<Option<HistoryEntry>, Error> {
        Ok(self.entries.get(identity).map(|entry| entry.clone()))
    }

    fn store(&self, identity: &NodeId, entry: &HistoryEntry) -> Result<(), Error> {
        self.entries.insert(identity.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, identity: &NodeId) -> Result<(), Error> {
        self.entries.remove(identity);
        Ok(())
    }
}
