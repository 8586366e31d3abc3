//! Content identity: the SHA-256 digest that names every sample.
//!
//! An [`ObjectKey`] is both the storage key and the remote resource id, so
//! byte-identical samples always land in the same place. This is the whole
//! deduplication mechanism.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const KEY_LEN: usize = 64;
const READ_CHUNK: usize = 64 * 1024;

/// Lowercase hex SHA-256 of an object's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parses a key typed or pasted by an operator: surrounding whitespace is
/// dropped and upper-case hex is accepted.
impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.len() != KEY_LEN || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!(
                "not a SHA-256 hex digest: {trimmed:?}"
            )));
        }
        Ok(ObjectKey(trimmed.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.0
    }
}

/// SHA-256 over the full content.
pub fn hash(bytes: &[u8]) -> ObjectKey {
    ObjectKey(hex::encode(Sha256::digest(bytes)))
}

/// Same digest as [`hash`], computed from a reader in fixed-size chunks.
pub async fn hash_reader<R>(reader: &mut R) -> Result<ObjectKey>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ObjectKey(hex::encode(hasher.finalize())))
}

pub async fn hash_file(path: &Path) -> Result<ObjectKey> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        tracing::error!(error = ?e, path = %path.display(), "Failed to open file for hashing");
        Error::from(e)
    })?;
    let key = hash_reader(&mut file).await?;
    tracing::debug!(path = %path.display(), key = %key, "Hashed file");
    Ok(key)
}
