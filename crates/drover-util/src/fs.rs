//! Hashed working directories. Fanning job directories out under three
//! two-hex-character levels keeps any single parent listing small even with
//! hundreds of thousands of simultaneous jobs rooted at one path.

use anyhow::{Context as _, Result};
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};

/// Create `<root>/<aa>/<bb>/<cc>/<key>/cwd` and a sibling `tmp`, where
/// `aa`/`bb`/`cc` are the leading hex pairs of the key's sha256. Returns the
/// two created paths.
pub fn mk_hashed_dir(root: impl AsRef<Path>, key: &str) -> Result<(PathBuf, PathBuf)> {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    let dir = root
        .as_ref()
        .join(&digest[0..2])
        .join(&digest[2..4])
        .join(&digest[4..6])
        .join(key);
    let cwd = dir.join("cwd");
    let tmp = dir.join("tmp");
    std::fs::create_dir_all(&cwd)
        .with_context(|| format!("could not create {}", cwd.display()))?;
    std::fs::create_dir_all(&tmp)
        .with_context(|| format!("could not create {}", tmp.display()))?;
    Ok((cwd, tmp))
}

/// Removes a directory tree when dropped. Used for job tmp directories,
/// which must go away on every exit path.
#[derive(Debug)]
pub struct RemoveOnDrop(pub PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
