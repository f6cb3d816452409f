use std::{
    fs::{self, File, OpenOptions},
    io,
    sync::Mutex,
    time::{Duration, Instant},
};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use kiln_types::NodeId;
use tracing::{debug, instrument, warn};

use crate::{Error, ImmutableWorkspaceMetadata};

const LOCK_SUFFIX: &str = ".lock";
const LAST_USE_SUFFIX: &str = ".used";
const OUTPUTS_DIR: &str = "outputs";
const METADATA_FILE: &str = "metadata.json";

/// When workspaces are evicted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Workspaces not used for longer than this are deleted.
    pub max_age: Duration,
    /// Beyond this many workspaces, the least recently used are deleted.
    pub max_entries: usize,
    /// Minimum time between opportunistic cleanups.
    pub cleanup_interval: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_entries: 1000,
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Entries that were due for eviction but locked by someone else.
    pub skipped_in_use: Vec<String>,
}

/// A locked workspace, valid for the duration of
/// [`WorkspaceProvider::with_workspace`].
#[derive(Debug)]
pub struct Workspace {
    identity: NodeId,
    dir: Utf8PathBuf,
}

impl Workspace {
    pub fn identity(&self) -> &NodeId {
        &self.identity
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Directory that relative output paths are resolved against.
    pub fn outputs_dir(&self) -> Utf8PathBuf {
        self.dir.join(OUTPUTS_DIR)
    }

    pub fn resolve_output(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.outputs_dir().join(path)
    }

    pub fn metadata(&self) -> Result<Option<ImmutableWorkspaceMetadata>, Error> {
        ImmutableWorkspaceMetadata::read(&self.dir.join(METADATA_FILE))
    }

    pub fn write_metadata(&self, metadata: &ImmutableWorkspaceMetadata) -> Result<(), Error> {
        metadata.write(&self.dir.join(METADATA_FILE))
    }

    /// Removes everything a previous execution left behind.
    pub fn clear(&self) -> Result<(), Error> {
        let outputs = self.outputs_dir();
        match fs::remove_dir_all(&outputs) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&outputs)(e)),
        }
        let metadata = self.dir.join(METADATA_FILE);
        match fs::remove_file(&metadata) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&metadata)(e)),
        }
        fs::create_dir_all(&outputs).map_err(Error::io(&outputs))
    }
}

/// Hands out exclusive workspaces under a shared root.
///
/// Layout: `<root>/<key>/` holds the workspace, `<root>/<key>.lock` guards
/// it and `<root>/<key>.used` records when it was last handed out. The key
/// is the SHA-256 of the identity.
#[derive(Debug)]
pub struct WorkspaceProvider {
    root: Utf8PathBuf,
    policy: CleanupPolicy,
    last_cleanup: Mutex<Option<Instant>>,
}

impl WorkspaceProvider {
    pub fn new(root: &Utf8Path, policy: CleanupPolicy) -> Result<Self, Error> {
        fs::create_dir_all(root).map_err(Error::io(root))?;
        Ok(Self {
            root: root.to_owned(),
            policy,
            last_cleanup: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn key(identity: &NodeId) -> String {
        kiln_hash::hash_bytes(identity.as_str())
    }

    fn open_lock(&self, key: &str) -> Result<File, Error> {
        let path = self.root.join(format!("{key}{LOCK_SUFFIX}"));
        #[allow(clippy::suspicious_open_options)]
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(Error::io(path))?;
        Ok(file)
    }

    /// Runs `action` with exclusive access to the workspace for `identity`.
    ///
    /// Blocks while another holder, in this or another process, has it.
    #[instrument(skip(self, action))]
    pub fn with_workspace<T>(
        &self,
        identity: &NodeId,
        action: impl FnOnce(&Workspace) -> T,
    ) -> Result<T, Error> {
        let key = Self::key(identity);
        let lock = self.open_lock(&key)?;
        lock.lock_exclusive()
            .map_err(Error::io(self.root.join(format!("{key}{LOCK_SUFFIX}"))))?;

        let dir = self.root.join(&key);
        fs::create_dir_all(dir.join(OUTPUTS_DIR)).map_err(Error::io(&dir))?;
        self.touch(&key)?;

        let workspace = Workspace {
            identity: identity.clone(),
            dir,
        };
        let result = action(&workspace);
        drop(lock);

        if self.cleanup_due() {
            if let Err(e) = self.cleanup() {
                warn!("workspace cleanup failed: {e}");
            }
        }
        Ok(result)
    }

    fn touch(&self, key: &str) -> Result<(), Error> {
        let path = self.root.join(format!("{key}{LAST_USE_SUFFIX}"));
        fs::write(&path, Utc::now().to_rfc3339()).map_err(Error::io(path))
    }

    fn last_used(&self, key: &str) -> Option<DateTime<Utc>> {
        let path = self.root.join(format!("{key}{LAST_USE_SUFFIX}"));
        let contents = fs::read_to_string(path).ok()?;
        DateTime::parse_from_rfc3339(contents.trim())
            .ok()
            .map(|time| time.with_timezone(&Utc))
    }

    fn cleanup_due(&self) -> bool {
        let Ok(mut last) = self.last_cleanup.lock() else {
            return false;
        };
        let due = last.map_or(true, |at| at.elapsed() >= self.policy.cleanup_interval);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// Evicts workspaces past `max_age`, then the least recently used beyond
    /// `max_entries`. Workspaces currently locked are left alone.
    #[instrument(skip(self))]
    pub fn cleanup(&self) -> Result<CleanupReport, Error> {
        self.cleanup_at(Utc::now())
    }

    pub(crate) fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport, Error> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(Error::io(&self.root))? {
            let entry = entry.map_err(Error::io(&self.root))?;
            if !entry.file_type().map_err(Error::io(&self.root))?.is_dir() {
                continue;
            }
            let Ok(key) = entry.file_name().into_string() else {
                continue;
            };
            // Entries without a marker were never completely set up; treat
            // them as the oldest.
            let last_used = self.last_used(&key).unwrap_or(DateTime::<Utc>::MIN_UTC);
            entries.push((key, last_used));
        }
        // Most recently used first, key as tie-break for a stable order.
        entries.sort_by(|(a_key, a_used), (b_key, b_used)| {
            b_used.cmp(a_used).then_with(|| a_key.cmp(b_key))
        });

        let max_age = chrono::Duration::from_std(self.policy.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let mut report = CleanupReport::default();
        let mut kept = 0;
        for (key, last_used) in entries {
            let expired = now.signed_duration_since(last_used) > max_age;
            if !expired && kept < self.policy.max_entries {
                kept += 1;
                continue;
            }
            if self.evict(&key)? {
                report.removed.push(key);
            } else {
                kept += 1;
                report.skipped_in_use.push(key);
            }
        }
        debug!(
            "workspace cleanup removed {} entries, {} in use",
            report.removed.len(),
            report.skipped_in_use.len()
        );
        Ok(report)
    }

    /// Deletes one workspace if nobody holds its lock.
    fn evict(&self, key: &str) -> Result<bool, Error> {
        let lock = self.open_lock(key)?;
        if lock.try_lock_exclusive().is_err() {
            return Ok(false);
        }
        let dir = self.root.join(key);
        fs::remove_dir_all(&dir).map_err(Error::io(&dir))?;
        let marker = self.root.join(format!("{key}{LAST_USE_SUFFIX}"));
        if let Err(e) = fs::remove_file(&marker) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(Error::io(marker)(e));
            }
        }
        Ok(true)
    }
}
