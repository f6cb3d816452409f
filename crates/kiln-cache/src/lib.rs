//! Build cache backends.
//!
//! A cache maps a key (the combined digest of a unit of work's inputs) to an
//! [`OutputBundle`]: the files the work produced, relative to an anchor
//! directory. [`FsCache`] is the local backend; [`NoopCache`] disables
//! caching entirely.

mod cache_archive;
mod fs;

use camino::{Utf8Path, Utf8PathBuf};
pub use fs::FsCache;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("invalid cache metadata: {0}")]
    InvalidMetadata(#[source] serde_json::Error),
    #[error("cannot untar file to {0}")]
    InvalidFilePath(String),
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType),
    #[error("{0} is outside of the cached directory")]
    OutsideOfAnchor(String),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: Utf8PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Files produced by a unit of work, relative to `anchor`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputBundle {
    anchor: Utf8PathBuf,
    files: Vec<Utf8PathBuf>,
    duration_ms: u64,
}

impl OutputBundle {
    /// Collects every directory and file under each of `roots`.
    ///
    /// Roots must live under `anchor`; missing roots contribute nothing.
    /// Entries are sorted so equal trees produce equal archives.
    pub fn collect(
        anchor: &Utf8Path,
        roots: &[Utf8PathBuf],
        duration_ms: u64,
    ) -> Result<Self, CacheError> {
        let mut files = Vec::new();
        for root in roots {
            let relative = root
                .strip_prefix(anchor)
                .map_err(|_| CacheError::OutsideOfAnchor(root.to_string()))?;
            if !root.exists() {
                continue;
            }
            // The anchor itself is never an entry, only its contents.
            if !relative.as_str().is_empty() {
                files.push(relative.to_owned());
            }
            for entry in WalkDir::new(root)
                .min_depth(1)
                .follow_links(true)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|source| CacheError::Walk {
                    path: root.clone(),
                    source,
                })?;
                let path = Utf8Path::from_path(entry.path())
                    .ok_or_else(|| CacheError::NonUtf8Path(entry.path().display().to_string()))?;
                let relative = path
                    .strip_prefix(anchor)
                    .map_err(|_| CacheError::OutsideOfAnchor(path.to_string()))?;
                files.push(relative.to_owned());
            }
        }
        files.dedup();
        Ok(Self {
            anchor: anchor.to_owned(),
            files,
            duration_ms,
        })
    }

    pub fn anchor(&self) -> &Utf8Path {
        &self.anchor
    }

    pub fn files(&self) -> &[Utf8PathBuf] {
        &self.files
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

/// Result of restoring a bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheHit {
    pub restored_files: Vec<Utf8PathBuf>,
    /// How long the cached work originally took.
    pub time_saved_ms: u64,
}

pub trait BuildCache: Send + Sync {
    /// Restores the bundle stored under `key` into `anchor`, if present.
    fn try_load(&self, key: &str, anchor: &Utf8Path) -> Result<Option<CacheHit>, CacheError>;

    fn store(&self, key: &str, bundle: &OutputBundle) -> Result<(), CacheError>;

    fn exists(&self, key: &str) -> Result<bool, CacheError>;
}

/// A cache that never hits and stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl BuildCache for NoopCache {
    fn try_load(&self, _key: &str, _anchor: &Utf8Path) -> Result<Option<CacheHit>, CacheError> {
        Ok(None)
    }

    fn store(&self, _key: &str, _bundle: &OutputBundle) -> Result<(), CacheError> {
        Ok(())
    }

    fn exists(&self, _key: &str) -> Result<bool, CacheError> {
        Ok(false)
    }
}
