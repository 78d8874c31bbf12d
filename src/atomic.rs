//! Crash-safe file replacement
//!
//! Writes go to a sibling `<name>.tmp` file which is flushed and then renamed
//! over the target. A crash before the rename leaves the previous file intact.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::DispatchError;

/// Replace `path` with `bytes` atomically.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DispatchError> {
    let staged = stage(path, bytes).await?;
    commit(&staged, path).await
}

/// Write `bytes` to the temporary sibling of `path` and return its location.
pub async fn stage(path: &Path, bytes: &[u8]) -> Result<PathBuf, DispatchError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(tmp)
}

/// Move a staged file over its target.
pub async fn commit(staged: &Path, path: &Path) -> Result<(), DispatchError> {
    tokio::fs::rename(staged, path).await?;
    Ok(())
}

/// `creds.json` -> `creds.json.tmp`
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "courier".into());
    name.push(".tmp");
    path.with_file_name(name)
}
