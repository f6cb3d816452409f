use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read},
};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tar::{Entry, EntryType};
use tracing::debug;

use crate::CacheError;

pub struct CacheReader<'a> {
    reader: Box<dyn Read + 'a>,
}

impl<'a> CacheReader<'a> {
    pub fn open(path: &Utf8Path) -> Result<Self, CacheError> {
        let file = File::open(path)?;
        Ok(Self {
            reader: Box::new(zstd::Decoder::new(file)?),
        })
    }

    /// Unpacks every entry under `anchor`, returning the restored paths
    /// relative to it.
    pub fn restore(&mut self, anchor: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CacheError> {
        fs::create_dir_all(anchor)?;
        let mut restored = Vec::new();
        let mut archive = tar::Archive::new(&mut self.reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            restored.push(restore_entry(anchor, &mut entry)?);
        }
        Ok(restored)
    }
}

fn restore_entry(
    anchor: &Utf8Path,
    entry: &mut Entry<impl Read>,
) -> Result<Utf8PathBuf, CacheError> {
    // Long names live in extension entries, so the name comes from the entry
    // rather than the raw header.
    let raw_name = entry.path()?;
    let name = Utf8Path::from_path(&raw_name)
        .ok_or_else(|| CacheError::NonUtf8Path(raw_name.display().to_string()))?;
    let processed_name = canonicalize_name(name)?;

    match entry.header().entry_type() {
        EntryType::Directory => {
            safe_mkdir_all(anchor, &processed_name)?;
        }
        EntryType::Regular => {
            if let Some(parent) = processed_name.parent() {
                safe_mkdir_all(anchor, parent)?;
            }
            let resolved = anchor.join(&processed_name);
            let mut options = OpenOptions::new();
            options.write(true).truncate(true).create(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(entry.header().mode()?);
            }
            let mut file = options.open(&resolved)?;
            io::copy(entry, &mut file)?;
        }
        ty => return Err(CacheError::RestoreUnsupportedFileType(ty)),
    }
    debug!("restored {processed_name}");
    Ok(processed_name)
}

/// Rejects anything that could land outside the anchor.
fn canonicalize_name(name: &Utf8Path) -> Result<Utf8PathBuf, CacheError> {
    let mut processed = Utf8PathBuf::new();
    for component in name.components() {
        match component {
            Utf8Component::Normal(segment) => processed.push(segment),
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                return Err(CacheError::InvalidFilePath(name.to_string()))
            }
        }
    }
    if processed.as_str().is_empty() {
        return Err(CacheError::InvalidFilePath(name.to_string()));
    }
    Ok(processed)
}

/// Creates `relative` under `anchor`, refusing to pass through symlinks that
/// might point elsewhere.
fn safe_mkdir_all(anchor: &Utf8Path, relative: &Utf8Path) -> Result<(), CacheError> {
    let mut current = anchor.to_owned();
    for component in relative.components() {
        current.push(component.as_str());
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(CacheError::OutsideOfAnchor(current.to_string()))
            }
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                // A file where a directory is expected: replace it.
                fs::remove_file(&current)?;
                fs::create_dir(&current)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&current)?,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
