use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use kiln_types::NodeId;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{Error, HistoryEntry, HistoryStore, SCHEMA_VERSION};

/// History kept as one JSON file per identity under `<root>/history`.
///
/// File names are the SHA-256 of the identity. Every access to an identity
/// holds an advisory lock on `<key>.lock`; writes land in a temporary file
/// that is renamed over the record, so an interrupted write leaves the
/// previous record untouched.
#[derive(Debug, Clone)]
pub struct FsHistoryStore {
    directory: Utf8PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    schema_version: u32,
}

impl FsHistoryStore {
    pub fn new(root: &Utf8Path) -> Result<Self, Error> {
        let directory = root.join("history");
        fs::create_dir_all(&directory).map_err(|source| Error::Io {
            path: directory.clone(),
            source,
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    fn key(identity: &NodeId) -> String {
        kiln_hash::hash_bytes(identity.as_str())
    }

    fn record_path(&self, key: &str) -> Utf8PathBuf {
        self.directory.join(format!("{key}.json"))
    }

    fn lock(&self, key: &str, exclusive: bool) -> Result<File, Error> {
        let path = self.directory.join(format!("{key}.lock"));
        let io_err = |source| Error::Io {
            path: path.clone(),
            source,
        };
        #[allow(clippy::suspicious_open_options)]
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(io_err)?;
        if exclusive {
            file.lock_exclusive().map_err(io_err)?;
        } else {
            file.lock_shared().map_err(io_err)?;
        }
        Ok(file)
    }
}

impl HistoryStore for FsHistoryStore {
    #[instrument(skip(self))]
    fn load(&self, identity: &NodeId) -> Result<Option<HistoryEntry>, Error> {
        let key = Self::key(identity);
        let _lock = self.lock(&key, false)?;
        let path = self.record_path(&key);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no history recorded for {identity}");
                return Ok(None);
            }
            Err(source) => return Err(Error::Io { path, source }),
        };

        let probe: VersionProbe =
            serde_json::from_slice(&contents).map_err(|source| Error::Corrupt {
                identity: identity.clone(),
                source,
            })?;
        if probe.schema_version != SCHEMA_VERSION {
            return Err(Error::UnsupportedVersion {
                identity: identity.clone(),
                found: probe.schema_version,
                expected: SCHEMA_VERSION,
            });
        }

        let entry = serde_json::from_slice(&contents).map_err(|source| Error::Corrupt {
            identity: identity.clone(),
            source,
        })?;
        Ok(Some(entry))
    }

    #[instrument(skip(self, entry))]
    fn store(&self, identity: &NodeId, entry: &HistoryEntry) -> Result<(), Error> {
        let key = Self::key(identity);
        let _lock = self.lock(&key, true)?;
        let path = self.record_path(&key);
        let io_err = |source| Error::Io {
            path: path.clone(),
            source,
        };

        let temp = tempfile::NamedTempFile::new_in(&self.directory).map_err(io_err)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, entry).map_err(|source| {
                Error::Serialize {
                    identity: identity.clone(),
                    source,
                }
            })?;
            writer.flush().map_err(io_err)?;
        }
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(&path).map_err(|e| io_err(e.error))?;
        debug!("stored history for {identity}");
        Ok(())
    }

    fn remove(&self, identity: &NodeId) -> Result<(), Error> {
        let key = Self::key(identity);
        let _lock = self.lock(&key, true)?;
        let path = self.record_path(&key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::entry;

    fn store() -> (tempfile::TempDir, FsHistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let store = FsHistoryStore::new(&root).unwrap();
        (dir, store)
    }

    #[test]
    fn load_without_record() -> anyhow::Result<()> {
        let (_dir, store) = store();
        assert_eq!(store.load(&NodeId::new(":compile"))?, None);
        Ok(())
    }

    #[test]
    fn store_then_load() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let id = NodeId::new(":compile");
        let recorded = entry(":compile", "inv-1");
        store.store(&id, &recorded)?;
        assert_eq!(store.load(&id)?, Some(recorded));
        Ok(())
    }

    #[test]
    fn store_supersedes_previous_entry() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let id = NodeId::new(":compile");
        store.store(&id, &entry(":compile", "inv-1"))?;
        store.store(&id, &entry(":compile", "inv-2"))?;
        let loaded = store.load(&id)?.unwrap();
        assert_eq!(loaded.invocation_id, "inv-2");
        Ok(())
    }

    #[test]
    fn identities_do_not_collide() -> anyhow::Result<()> {
        let (_dir, store) = store();
        store.store(&NodeId::new("a"), &entry("a", "inv-a"))?;
        store.store(&NodeId::new("b"), &entry("b", "inv-b"))?;
        assert_eq!(store.load(&NodeId::new("a"))?.unwrap().invocation_id, "inv-a");
        store.remove(&NodeId::new("a"))?;
        assert_eq!(store.load(&NodeId::new("a"))?, None);
        assert!(store.load(&NodeId::new("b"))?.is_some());
        Ok(())
    }

    #[test]
    fn rejects_unknown_schema_version() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let id = NodeId::new(":compile");
        store.store(&id, &entry(":compile", "inv-1"))?;

        let path = store.record_path(&FsHistoryStore::key(&id));
        let mut json: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
        json["schemaVersion"] = serde_json::json!(99);
        fs::write(&path, serde_json::to_vec(&json)?)?;

        let err = store.load(&id).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedVersion {
                found: 99,
                expected: SCHEMA_VERSION,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn corrupt_record_is_an_error() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let id = NodeId::new(":compile");
        fs::write(store.record_path(&FsHistoryStore::key(&id)), "{ not json")?;
        assert!(matches!(store.load(&id), Err(Error::Corrupt { .. })));
        Ok(())
    }

    #[test]
    fn no_temp_files_left_behind() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let id = NodeId::new(":compile");
        store.store(&id, &entry(":compile", "inv-1"))?;
        let mut names: Vec<_> = fs::read_dir(store.directory())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        names.sort();
        let key = FsHistoryStore::key(&id);
        assert_eq!(names, vec![format!("{key}.json"), format!("{key}.lock")]);
        Ok(())
    }

    #[test]
    fn concurrent_writers_leave_a_whole_record() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let id = NodeId::new(":compile");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = id.clone();
                thread::spawn(move || {
                    store
                        .store(&id, &entry(":compile", &format!("inv-{i}")))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let loaded = store.load(&id)?.unwrap();
        assert!(loaded.invocation_id.starts_with("inv-"));
        Ok(())
    }
}
