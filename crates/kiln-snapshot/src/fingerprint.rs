use std::{collections::HashMap, fmt};

use camino::Utf8Path;
use kiln_hash::DigestBuilder;
use serde::{Deserialize, Serialize};

use crate::{snapshot::FileSystemSnapshot, Error, SnapshotCache};

/// How paths are reduced before they take part in a fingerprint.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalizationStrategy {
    #[default]
    AbsolutePath,
    RelativePath,
    NameOnly,
    IgnorePath,
}

impl NormalizationStrategy {
    /// The normalized path recorded for `entry`, found under `root`.
    fn normalize(&self, root: &Utf8Path, entry: &FileSystemSnapshot) -> String {
        match self {
            NormalizationStrategy::AbsolutePath => entry.path().to_string(),
            NormalizationStrategy::RelativePath => {
                let base = root.parent().unwrap_or(root);
                match entry.path().strip_prefix(base) {
                    Ok(relative) if !relative.as_str().is_empty() => relative.to_string(),
                    _ => entry.name().to_string(),
                }
            }
            NormalizationStrategy::NameOnly => entry.name().to_string(),
            NormalizationStrategy::IgnorePath => String::new(),
        }
    }

    fn includes(&self, entry: &FileSystemSnapshot) -> bool {
        match self {
            NormalizationStrategy::IgnorePath => {
                matches!(entry, FileSystemSnapshot::RegularFile { .. })
            }
            _ => true,
        }
    }

    /// Whether the fingerprint depends on the order roots were declared in.
    pub fn is_order_sensitive(&self) -> bool {
        !matches!(self, NormalizationStrategy::IgnorePath)
    }

    fn tag(&self) -> &'static str {
        match self {
            NormalizationStrategy::AbsolutePath => "ABSOLUTE_PATH",
            NormalizationStrategy::RelativePath => "RELATIVE_PATH",
            NormalizationStrategy::NameOnly => "NAME_ONLY",
            NormalizationStrategy::IgnorePath => "IGNORE_PATH",
        }
    }
}

impl fmt::Display for NormalizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Missing,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub path: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl FingerprintEntry {
    fn describe(&self) -> String {
        match (&self.hash, self.path.is_empty()) {
            (Some(hash), true) => format!("content {}", &hash[..hash.len().min(12)]),
            _ => self.path.clone(),
        }
    }
}

/// Normalized digest of a set of files.
///
/// Two fingerprints are equal exactly when their strategy and entries are
/// equal; the digest is derived from both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    strategy: NormalizationStrategy,
    entries: Vec<FingerprintEntry>,
    digest: String,
}

impl Fingerprint {
    /// Fingerprints `roots` in declared order.
    pub fn of_paths(
        cache: &SnapshotCache,
        roots: &[impl AsRef<Utf8Path>],
        strategy: NormalizationStrategy,
    ) -> Result<Self, Error> {
        let mut snapshots = Vec::with_capacity(roots.len());
        for root in roots {
            snapshots.push(cache.snapshot(root.as_ref())?);
        }
        Ok(Self::of_snapshots(
            snapshots.iter().map(|snapshot| snapshot.as_ref()),
            strategy,
        ))
    }

    pub fn of_snapshots<'a>(
        roots: impl IntoIterator<Item = &'a FileSystemSnapshot>,
        strategy: NormalizationStrategy,
    ) -> Self {
        let mut entries = Vec::new();
        for root in roots {
            root.walk(&mut |entry| {
                if !strategy.includes(entry) {
                    return;
                }
                let kind = match entry {
                    FileSystemSnapshot::RegularFile { .. } => EntryKind::File,
                    FileSystemSnapshot::Directory { .. } => EntryKind::Directory,
                    FileSystemSnapshot::Missing { .. } => EntryKind::Missing,
                };
                // Directory identity comes from its children's entries.
                let hash = match kind {
                    EntryKind::File => entry.hash().map(str::to_owned),
                    EntryKind::Directory | EntryKind::Missing => None,
                };
                entries.push(FingerprintEntry {
                    path: strategy.normalize(root.path(), entry),
                    kind,
                    hash,
                });
            });
        }
        if !strategy.is_order_sensitive() {
            entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        }
        Self::from_entries(strategy, entries)
    }

    pub fn empty(strategy: NormalizationStrategy) -> Self {
        Self::from_entries(strategy, Vec::new())
    }

    fn from_entries(strategy: NormalizationStrategy, entries: Vec<FingerprintEntry>) -> Self {
        let mut digest = DigestBuilder::new();
        digest.put_str(strategy.tag()).put_u64(entries.len() as u64);
        for entry in &entries {
            digest
                .put_str(&entry.path)
                .put_u8(entry.kind as u8)
                .put_str(entry.hash.as_deref().unwrap_or_default());
        }
        Self {
            strategy,
            entries,
            digest: digest.finish(),
        }
    }

    pub fn strategy(&self) -> NormalizationStrategy {
        self.strategy
    }

    pub fn entries(&self) -> &[FingerprintEntry] {
        &self.entries
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// True when every entry is missing, or there are no entries at all.
    pub fn is_absent(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.kind == EntryKind::Missing)
    }

    /// First difference between `previous` and `self`, in entry order.
    ///
    /// Modifications and additions are reported before removals.
    pub fn first_change_since(&self, previous: &Fingerprint) -> Option<FingerprintChange> {
        if self.strategy != previous.strategy {
            return Some(FingerprintChange::Strategy {
                previous: previous.strategy,
                current: self.strategy,
            });
        }
        if self == previous {
            return None;
        }

        if self.strategy.is_order_sensitive() {
            let before: HashMap<&str, &FingerprintEntry> = previous
                .entries
                .iter()
                .map(|entry| (entry.path.as_str(), entry))
                .collect();
            for entry in &self.entries {
                match before.get(entry.path.as_str()) {
                    None => return Some(FingerprintChange::Added(entry.describe())),
                    Some(old) if old.kind == EntryKind::Missing && entry.kind != old.kind => {
                        return Some(FingerprintChange::Added(entry.describe()))
                    }
                    Some(old) if entry.kind == EntryKind::Missing && entry.kind != old.kind => {
                        return Some(FingerprintChange::Removed(entry.describe()))
                    }
                    Some(old) if *old != entry => {
                        return Some(FingerprintChange::Modified(entry.describe()))
                    }
                    Some(_) => {}
                }
            }
            let after: HashMap<&str, ()> = self
                .entries
                .iter()
                .map(|entry| (entry.path.as_str(), ()))
                .collect();
            if let Some(removed) = previous
                .entries
                .iter()
                .find(|entry| !after.contains_key(entry.path.as_str()))
            {
                return Some(FingerprintChange::Removed(removed.describe()));
            }
            // Same entries, different order.
            return Some(FingerprintChange::Reordered);
        }

        let mut remaining: HashMap<&Option<String>, usize> = HashMap::new();
        for entry in &previous.entries {
            *remaining.entry(&entry.hash).or_default() += 1;
        }
        for entry in &self.entries {
            match remaining.get_mut(&entry.hash) {
                Some(count) if *count > 0 => *count -= 1,
                _ => return Some(FingerprintChange::Added(entry.describe())),
            }
        }
        previous
            .entries
            .iter()
            .find(|entry| remaining.get(&entry.hash).copied().unwrap_or_default() > 0)
            .map(|entry| FingerprintChange::Removed(entry.describe()))
    }
}

/// Human readable description of how a fingerprint changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FingerprintChange {
    Strategy {
        previous: NormalizationStrategy,
        current: NormalizationStrategy,
    },
    Added(String),
    Removed(String),
    Modified(String),
    Reordered,
}

impl fmt::Display for FingerprintChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FingerprintChange::Strategy { previous, current } => {
                write!(f, "normalization changed from {previous} to {current}")
            }
            FingerprintChange::Added(path) => write!(f, "{path} has been added"),
            FingerprintChange::Removed(path) => write!(f, "{path} has been removed"),
            FingerprintChange::Modified(path) => write!(f, "{path} has changed"),
            FingerprintChange::Reordered => f.write_str("the order of files has changed"),
        }
    }
}
