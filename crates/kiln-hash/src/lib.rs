//! Hashing primitives shared by the snapshot engine, the history store and
//! the build cache.
//!
//! Everything in kiln that ends up compared across invocations (content
//! hashes, fingerprints, cache keys, history file names) goes through the
//! helpers in this crate so the digest algorithm and its encoding are defined
//! in exactly one place.

use std::{fs::File, io, path::Path};

use sha2::{Digest, Sha256};

/// Length in hex characters of every digest produced by this crate.
pub const DIGEST_LEN: usize = 64;

pub trait Sealed {}

/// A value that can contribute itself to a [`DigestBuilder`].
pub trait Hashable {
    fn hash_into(&self, builder: &mut DigestBuilder);
}

/// Produces the hex encoded SHA-256 of anything [`Hashable`].
pub trait KilnHash: Sealed {
    fn hash(&self) -> String;
}

impl<T: Hashable + ?Sized> Sealed for T {}

impl<T: Hashable + ?Sized> KilnHash for T {
    fn hash(&self) -> String {
        let mut builder = DigestBuilder::new();
        self.hash_into(&mut builder);
        builder.finish()
    }
}

/// Incremental SHA-256 builder.
///
/// Variable length fields are length prefixed so that `("ab", "c")` and
/// `("a", "bc")` never collide.
#[derive(Clone, Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.hasher.update([value]);
        self
    }

    pub fn put<H: Hashable + ?Sized>(&mut self, value: &H) -> &mut Self {
        value.hash_into(self);
        self
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Hashable for str {
    fn hash_into(&self, builder: &mut DigestBuilder) {
        builder.put_str(self);
    }
}

impl Hashable for String {
    fn hash_into(&self, builder: &mut DigestBuilder) {
        builder.put_str(self);
    }
}

impl<T: Hashable> Hashable for [T] {
    fn hash_into(&self, builder: &mut DigestBuilder) {
        builder.put_u64(self.len() as u64);
        for item in self {
            item.hash_into(builder);
        }
    }
}

impl<T: Hashable> Hashable for Vec<T> {
    fn hash_into(&self, builder: &mut DigestBuilder) {
        self.as_slice().hash_into(builder);
    }
}

/// Hex encoded SHA-256 of raw bytes, without any length prefix.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Streams a file through SHA-256.
///
/// Symlinks are followed by the open call; callers that need to tell a
/// dangling link apart from an unreadable file must stat first.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
