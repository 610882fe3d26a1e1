use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::errors::{HashError, Result};

/// Read buffer used when streaming file contents into the hasher
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// blake3 digest of an entity's content
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Lowercase hex, as stored in the index `digest` column
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parse a 64-character hex digest
    pub fn from_hex(digest: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digest, &mut bytes)?;
        Ok(Self::from_bytes(bytes))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentHash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Digest of an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_blake3(blake3::hash(data))
}

/// Digest of everything a reader yields until EOF
pub fn hash_reader<R: Read>(mut reader: R) -> Result<ContentHash> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(ContentHash::from_blake3(hasher.finalize()))
}

/// Digest of a file's contents.
///
/// This is blocking IO; async callers should run it on a blocking thread.
pub fn hash_file(path: impl AsRef<Path>) -> Result<ContentHash> {
    let file = File::open(path.as_ref())?;
    hash_reader(file)
}
