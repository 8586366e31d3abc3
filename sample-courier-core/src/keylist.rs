//! Plain-text key lists: one content hash per line.
//!
//! Used both as batch input (`--txt`) and as the snapshot written by the list
//! commands for later diffing.

use std::collections::HashSet;
use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::identity::ObjectKey;

/// Parse one key per line. Blank lines (and `\r\n` endings) are skipped,
/// repeated keys keep their first position, malformed lines are an error
/// naming the line.
pub fn parse_key_list(text: &str) -> Result<Vec<ObjectKey>> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let key: ObjectKey = line.parse().map_err(|e| {
            Error::InvalidInput(format!("line {}: {e}", index + 1))
        })?;
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    Ok(keys)
}

pub async fn read_key_list(path: &Path) -> Result<Vec<ObjectKey>> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        tracing::error!(error = ?e, path = %path.display(), "Failed to read key list");
        Error::InvalidInput(format!("cannot read key list {}: {e}", path.display()))
    })?;
    let keys = parse_key_list(&text)?;
    tracing::info!(path = %path.display(), count = keys.len(), "Read key list");
    Ok(keys)
}

/// Write `keys` one per line, replacing `path`.
pub async fn write_key_list<I, K>(path: &Path, keys: I) -> Result<usize>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut content = String::new();
    let mut count = 0;
    for key in keys {
        content.push_str(key.as_ref());
        content.push('\n');
        count += 1;
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    tracing::info!(path = %path.display(), count, "Wrote key list");
    Ok(count)
}

/// Keys of `a` that are not in `b`, in `a`'s order.
pub fn difference<'a>(a: &'a [ObjectKey], b: &[ObjectKey]) -> Vec<&'a ObjectKey> {
    let known: HashSet<&ObjectKey> = b.iter().collect();
    a.iter().filter(|k| !known.contains(k)).collect()
}
