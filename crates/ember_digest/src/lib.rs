#![deny(missing_docs)]

//! Hashing utilities built on the [RustCrypto/hashes](https://github.com/RustCrypto/hashes)
//! family of crates.
//!
//! Bundle manifests address payloads and containers by their SHA-1 digest;
//! catalog files are addressed by SHA-256. The helpers in this crate compute
//! those digests over files and byte buffers and convert between the hex
//! representation used in manifests and the raw digest output.
//!
//! By utilizing the [`Digest`] trait, any hashing algorithm that implements
//! that trait can be used with the functions provided in this crate.

use std::io::Read;
use std::{fs::File, io::Write, path::Path};

use digest::{Digest, Output};

pub use digest;
pub use sha1::Sha1;
pub use sha2::Sha256;

/// A type alias for the output of a SHA-1 hash, the digest payloads carry in
/// the manifest.
pub type Sha1Hash = sha1::digest::Output<Sha1>;

/// A type alias for the output of a SHA-256 hash.
pub type Sha256Hash = sha2::digest::Output<Sha256>;

/// Compute a hash of the file at the specified location.
pub fn compute_file_digest<D: Digest + Default + Write>(
    path: impl AsRef<Path>,
) -> Result<Output<D>, std::io::Error> {
    let mut file = File::open(path)?;

    let mut hasher = D::default();
    std::io::copy(&mut file, &mut hasher)?;

    Ok(hasher.finalize())
}

/// Compute a hash of the specified bytes.
pub fn compute_bytes_digest<D: Digest + Default + Write>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::default();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parses a hash hex string to a digest.
pub fn parse_digest_from_hex<D: Digest>(str: &str) -> Option<Output<D>> {
    let mut hash = <Output<D>>::default();
    match hex::decode_to_slice(str, &mut hash) {
        Ok(_) => Some(hash),
        Err(_) => None,
    }
}

/// Formats a digest as the lowercase hex string used in manifests and log
/// output.
pub fn format_digest_hex<D: Digest>(digest: &Output<D>) -> String {
    hex::encode(digest)
}

/// A simple object that provides a [`Read`] implementation that also
/// immediately hashes the bytes read from it. Call [`HashingReader::finalize`]
/// to retrieve both the original `impl Read` object as well as the hash.
///
/// The cache engine uses this to verify a payload while streaming it into the
/// unverified staging area, so the file is read only once.
pub struct HashingReader<R, D: Digest> {
    reader: R,
    hasher: D,
}

impl<R, D: Digest + Default> HashingReader<R, D> {
    /// Constructs a new instance from a reader and a new (empty) hasher.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: Default::default(),
        }
    }
}

impl<R, D: Digest> HashingReader<R, D> {
    /// Consumes this instance and returns the original reader and the hash of
    /// all bytes read from this instance.
    pub fn finalize(self) -> (R, Output<D>) {
        (self.reader, self.hasher.finalize())
    }
}

impl<R: Read, D: Digest> Read for HashingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.hasher.update(&buf[..bytes_read]);
        Ok(bytes_read)
    }
}
