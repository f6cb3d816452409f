use std::{
    fs::{self, File},
    io::{BufWriter, Write},
};

use camino::Utf8Path;
use tar::{EntryType, Header};

use crate::CacheError;

/// Writes a zstd compressed tar of output files.
///
/// Headers are normalized (owner, timestamps) so the same files always
/// produce the same archive bytes.
pub struct CacheWriter<'a> {
    builder: tar::Builder<zstd::Encoder<'a, BufWriter<File>>>,
}

impl<'a> CacheWriter<'a> {
    pub fn create(file: File) -> Result<Self, CacheError> {
        // Flush to disk in 1mb chunks.
        let buffer = BufWriter::with_capacity(2usize.pow(20), file);
        let encoder = zstd::Encoder::new(buffer, 0)?;
        Ok(Self {
            builder: tar::Builder::new(encoder),
        })
    }

    /// Adds `file_path`, relative to `anchor`, to the archive.
    pub fn add_file(&mut self, anchor: &Utf8Path, file_path: &Utf8Path) -> Result<(), CacheError> {
        let source_path = anchor.join(file_path);
        // Symlinks are archived as what they point to.
        let file_info = fs::metadata(&source_path)?;

        let mut header = Header::new_gnu();
        if file_info.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
        } else {
            header.set_entry_type(EntryType::Regular);
            header.set_size(file_info.len());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            header.set_mode(file_info.mode());
        }
        #[cfg(not(unix))]
        header.set_mode(if file_info.is_dir() { 0o755 } else { 0o644 });

        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);

        // Tar paths always use forward slashes.
        let mut name = file_path.components().map(|c| c.as_str()).collect::<Vec<_>>().join("/");
        if file_info.is_dir() {
            name.push('/');
        }

        if file_info.is_file() && file_info.len() > 0 {
            let file = File::open(&source_path)?;
            self.builder.append_data(&mut header, name, file)?;
        } else {
            self.builder
                .append_data(&mut header, name, &mut std::io::empty())?;
        }
        Ok(())
    }

    pub fn finish(self) -> Result<(), CacheError> {
        let encoder = self.builder.into_inner()?;
        let mut buffer = encoder.finish()?;
        buffer.flush()?;
        Ok(())
    }
}
