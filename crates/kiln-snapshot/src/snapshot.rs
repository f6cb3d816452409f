use std::{
    fs, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use kiln_hash::DigestBuilder;
use tracing::{debug, trace};

use crate::Error;

const FILE_TAG: u8 = 0;
const DIRECTORY_TAG: u8 = 1;
const MISSING_TAG: u8 = 2;

/// Recursive, content addressed view of a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileSystemSnapshot {
    RegularFile {
        path: Utf8PathBuf,
        content_hash: String,
        length: u64,
    },
    Directory {
        path: Utf8PathBuf,
        /// Sorted by file name.
        children: Vec<Arc<FileSystemSnapshot>>,
        tree_hash: String,
    },
    Missing {
        path: Utf8PathBuf,
    },
}

impl FileSystemSnapshot {
    pub fn path(&self) -> &Utf8Path {
        match self {
            FileSystemSnapshot::RegularFile { path, .. }
            | FileSystemSnapshot::Directory { path, .. }
            | FileSystemSnapshot::Missing { path } => path,
        }
    }

    pub fn name(&self) -> &str {
        self.path().file_name().unwrap_or_else(|| self.path().as_str())
    }

    /// Content hash of a file, tree hash of a directory, `None` when missing.
    pub fn hash(&self) -> Option<&str> {
        match self {
            FileSystemSnapshot::RegularFile { content_hash, .. } => Some(content_hash),
            FileSystemSnapshot::Directory { tree_hash, .. } => Some(tree_hash),
            FileSystemSnapshot::Missing { .. } => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, FileSystemSnapshot::Missing { .. })
    }

    /// Visits this snapshot and every descendant, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a FileSystemSnapshot)) {
        visit(self);
        if let FileSystemSnapshot::Directory { children, .. } = self {
            for child in children {
                child.walk(visit);
            }
        }
    }

    fn tag(&self) -> u8 {
        match self {
            FileSystemSnapshot::RegularFile { .. } => FILE_TAG,
            FileSystemSnapshot::Directory { .. } => DIRECTORY_TAG,
            FileSystemSnapshot::Missing { .. } => MISSING_TAG,
        }
    }
}

/// Per-execution memo of snapshots keyed by path.
///
/// Nothing here is process global: a new cache is created for every run and
/// passed by reference to whoever needs to read the file system. Paths that a
/// node writes to must be [invalidated](SnapshotCache::invalidate) before
/// they are looked at again.
///
/// Every invalidation bumps a generation counter. A snapshot computed while
/// an invalidation happened is returned to its caller but never cached, so a
/// read racing a producer cannot resurrect stale content.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    snapshots: DashMap<Utf8PathBuf, Arc<FileSystemSnapshot>>,
    generation: AtomicU64,
    invalidation: RwLock<()>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot of `path`, computing and caching it on first use.
    ///
    /// Symlinks are followed. A dangling symlink is reported as missing, and
    /// so is a link back to a directory that is already being snapshotted.
    pub fn snapshot(&self, path: &Utf8Path) -> Result<Arc<FileSystemSnapshot>, Error> {
        self.snapshot_within(path, &[])
    }

    /// `ancestors` holds the canonical paths of the directories being
    /// snapshotted above `path`.
    fn snapshot_within(
        &self,
        path: &Utf8Path,
        ancestors: &[PathBuf],
    ) -> Result<Arc<FileSystemSnapshot>, Error> {
        if let Some(existing) = self.snapshots.get(path) {
            return Ok(existing.clone());
        }
        let generation = self.generation.load(Ordering::Acquire);
        // The map entry is not held while the tree is read: children go
        // through this same method and would otherwise contend on the shard.
        let Some(snapshot) = self.compute(path, ancestors)? else {
            // Depends on how the path was reached, so it is never cached.
            return Ok(Arc::new(FileSystemSnapshot::Missing {
                path: path.to_owned(),
            }));
        };
        Ok(self.remember(path, Arc::new(snapshot), generation))
    }

    fn remember(
        &self,
        path: &Utf8Path,
        snapshot: Arc<FileSystemSnapshot>,
        generation: u64,
    ) -> Arc<FileSystemSnapshot> {
        let _guard = self
            .invalidation
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            trace!("{path} was invalidated while it was read, not caching it");
            return snapshot;
        }
        self.snapshots
            .entry(path.to_owned())
            .or_insert(snapshot)
            .clone()
    }

    /// `None` when `path` is a directory link back into `ancestors`.
    fn compute(
        &self,
        path: &Utf8Path,
        ancestors: &[PathBuf],
    ) -> Result<Option<FileSystemSnapshot>, Error> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if fs::symlink_metadata(path).is_ok() {
                    debug!("dangling symlink at {path}, treating as missing");
                }
                return Ok(Some(FileSystemSnapshot::Missing {
                    path: path.to_owned(),
                }));
            }
            Err(e) => return Err(Error::io(path, e)),
        };

        if metadata.is_file() {
            trace!("hashing file {path}");
            let content_hash =
                kiln_hash::hash_file(path.as_std_path()).map_err(|e| Error::io(path, e))?;
            return Ok(Some(FileSystemSnapshot::RegularFile {
                path: path.to_owned(),
                content_hash,
                length: metadata.len(),
            }));
        }

        if metadata.is_dir() {
            let canonical = fs::canonicalize(path).map_err(|e| Error::io(path, e))?;
            if ancestors.contains(&canonical) {
                debug!(
                    "{path} links back to {}, treating as missing",
                    canonical.display()
                );
                return Ok(None);
            }
            let ancestors = ancestors
                .iter()
                .cloned()
                .chain(std::iter::once(canonical))
                .collect::<Vec<_>>();

            let mut names = Vec::new();
            for entry in fs::read_dir(path).map_err(|e| Error::io(path, e))? {
                let entry = entry.map_err(|e| Error::io(path, e))?;
                let name =
                    entry
                        .file_name()
                        .into_string()
                        .map_err(|name| Error::NonUtf8Path {
                            directory: path.to_owned(),
                            name: name.to_string_lossy().into_owned(),
                        })?;
                names.push(name);
            }
            names.sort();

            let mut children = Vec::with_capacity(names.len());
            let mut digest = DigestBuilder::new();
            for name in names {
                let child = self.snapshot_within(&path.join(&name), &ancestors)?;
                digest
                    .put_str(&name)
                    .put_u8(child.tag())
                    .put_str(child.hash().unwrap_or_default());
                children.push(child);
            }
            return Ok(Some(FileSystemSnapshot::Directory {
                path: path.to_owned(),
                children,
                tree_hash: digest.finish(),
            }));
        }

        debug!("{path} is neither a file nor a directory, treating as missing");
        Ok(Some(FileSystemSnapshot::Missing {
            path: path.to_owned(),
        }))
    }

    /// Forgets `path`, everything beneath it and every ancestor of it.
    ///
    /// Ancestors go too since their tree hash covers the changed entry.
    pub fn invalidate(&self, path: &Utf8Path) {
        let _guard = self
            .invalidation
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.snapshots
            .retain(|cached, _| !(cached.starts_with(path) || path.starts_with(cached)));
    }

    pub fn invalidate_all(&self) {
        let _guard = self
            .invalidation
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
