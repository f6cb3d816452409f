use std::fs::{self, File};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    BuildCache, CacheError, CacheHit, OutputBundle,
};

/// Local cache: `<key>.tar.zst` next to `<key>-meta.json`.
#[derive(Debug, Clone)]
pub struct FsCache {
    cache_directory: Utf8PathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
}

impl CacheMetadata {
    fn read(path: &Utf8Path) -> Result<CacheMetadata, CacheError> {
        serde_json::from_reader(File::open(path)?).map_err(CacheError::InvalidMetadata)
    }
}

impl FsCache {
    pub fn new(cache_directory: &Utf8Path) -> Result<Self, CacheError> {
        fs::create_dir_all(cache_directory)?;
        Ok(FsCache {
            cache_directory: cache_directory.to_owned(),
        })
    }

    pub fn directory(&self) -> &Utf8Path {
        &self.cache_directory
    }

    fn archive_path(&self, hash: &str) -> Utf8PathBuf {
        self.cache_directory.join(format!("{hash}.tar.zst"))
    }

    fn metadata_path(&self, hash: &str) -> Utf8PathBuf {
        self.cache_directory.join(format!("{hash}-meta.json"))
    }

    pub fn fetch(&self, anchor: &Utf8Path, hash: &str) -> Result<CacheHit, CacheError> {
        let archive_path = self.archive_path(hash);
        let mut cache_reader = CacheReader::open(&archive_path)?;
        let restored_files = cache_reader.restore(anchor)?;
        let meta = CacheMetadata::read(&self.metadata_path(hash))?;
        Ok(CacheHit {
            restored_files,
            time_saved_ms: meta.duration,
        })
    }

    pub fn put(&self, hash: &str, bundle: &OutputBundle) -> Result<(), CacheError> {
        // Readers only ever see a complete archive: it is written under a
        // temporary name and renamed into place.
        let temp = tempfile::NamedTempFile::new_in(&self.cache_directory)?;
        let mut cache_item = CacheWriter::create(temp.reopen()?)?;
        for file in bundle.files() {
            cache_item.add_file(bundle.anchor(), file)?;
        }
        cache_item.finish()?;

        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration: bundle.duration_ms(),
        };
        let meta_temp = tempfile::NamedTempFile::new_in(&self.cache_directory)?;
        serde_json::to_writer(meta_temp.as_file(), &meta).map_err(CacheError::InvalidMetadata)?;

        temp.persist(self.archive_path(hash))
            .map_err(|e| CacheError::IO(e.error))?;
        meta_temp
            .persist(self.metadata_path(hash))
            .map_err(|e| CacheError::IO(e.error))?;
        debug!("stored {} files under {hash}", bundle.files().len());
        Ok(())
    }
}

impl BuildCache for FsCache {
    fn try_load(&self, key: &str, anchor: &Utf8Path) -> Result<Option<CacheHit>, CacheError> {
        if !self.exists(key)? {
            return Ok(None);
        }
        self.fetch(anchor, key).map(Some)
    }

    fn store(&self, key: &str, bundle: &OutputBundle) -> Result<(), CacheError> {
        self.put(key, bundle)
    }

    fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.archive_path(key).exists() && self.metadata_path(key).exists())
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: FsCache,
        project: Utf8PathBuf,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
        let cache = FsCache::new(&root.join("cache"))?;
        let project = root.join("project");
        fs::create_dir_all(project.join("build/classes/pkg"))?;
        fs::write(project.join("build/classes/pkg/A.class"), "A")?;
        fs::write(project.join("build/classes/empty.class"), "")?;
        Ok(Fixture {
            _dir: dir,
            cache,
            project,
        })
    }

    #[test]
    fn miss_before_put() -> anyhow::Result<()> {
        let fixture = fixture()?;
        assert!(!fixture.cache.exists("abc")?);
        assert_eq!(fixture.cache.try_load("abc", &fixture.project)?, None);
        Ok(())
    }

    #[test]
    fn put_then_restore_elsewhere() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let bundle = OutputBundle::collect(
            &fixture.project,
            &[fixture.project.join("build/classes")],
            1234,
        )?;
        fixture.cache.store("abc", &bundle)?;
        assert!(fixture.cache.exists("abc")?);

        let target = fixture.project.parent().unwrap().join("restored");
        let hit = fixture.cache.try_load("abc", &target)?.unwrap();
        assert_eq!(hit.time_saved_ms, 1234);
        assert_eq!(hit.restored_files, bundle.files().to_vec());
        assert_eq!(
            fs::read_to_string(target.join("build/classes/pkg/A.class"))?,
            "A"
        );
        assert_eq!(
            fs::read_to_string(target.join("build/classes/empty.class"))?,
            ""
        );
        Ok(())
    }

    #[test]
    fn archives_are_deterministic() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let bundle = OutputBundle::collect(
            &fixture.project,
            &[fixture.project.join("build/classes")],
            0,
        )?;
        fixture.cache.store("one", &bundle)?;
        fixture.cache.store("two", &bundle)?;
        assert_eq!(
            fs::read(fixture.cache.archive_path("one"))?,
            fs::read(fixture.cache.archive_path("two"))?
        );
        Ok(())
    }

    #[test]
    fn missing_metadata_is_a_miss() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let bundle = OutputBundle::collect(&fixture.project, &[], 0)?;
        fixture.cache.store("abc", &bundle)?;
        fs::remove_file(fixture.cache.metadata_path("abc"))?;
        assert!(!fixture.cache.exists("abc")?);
        Ok(())
    }
}
