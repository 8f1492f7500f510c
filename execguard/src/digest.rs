//! Content hashing for executables.
//!
//! Every trust decision compares SHA-256 digests of full file content. The
//! same routine hashes files while the inventory is built and the live file
//! handle the kernel hands over with each permission event.

use anyhow::{Context, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 digest of a file's full content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Hash everything `reader` yields until EOF.
///
/// The reader is consumed from its current position. Short reads and
/// `Interrupted` are handled by the standard read loop; any other error
/// aborts the digest.
pub fn digest_reader<R: Read>(reader: R) -> Result<Digest> {
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, reader);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to read content"),
        };
        hasher.update(&buffer[..n]);
    }

    Ok(Digest(hasher.finalize().into()))
}

/// Open `path` and hash its content.
pub fn digest_path(path: &Path) -> Result<Digest> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    digest_reader(file).with_context(|| format!("Failed to hash {}", path.display()))
}

/// Hash an already-open file without moving ownership of it.
pub fn digest_file(file: &File) -> Result<Digest> {
    digest_reader(file)
}
