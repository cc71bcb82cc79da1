//! Node identity persistence, grounded in the teacher's
//! `load_or_create_headless_network_keypair` (`cli/src/main.rs`) — create
//! the storage directory, decode an existing key file or rotate a fresh
//! one on decode failure, and restrict the file to the owner on unix.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use meshvault_core::NodeIdentity;

fn identity_path(base_dir: &Path) -> PathBuf {
    base_dir.join("identity.key")
}

pub fn load_or_create(base_dir: &Path) -> Result<NodeIdentity> {
    std::fs::create_dir_all(base_dir).context("failed to create node storage directory")?;
    let key_path = identity_path(base_dir);

    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("failed to read node identity file")?;
        match NodeIdentity::from_bytes(&bytes) {
            Ok(identity) => return Ok(identity),
            Err(err) => {
                tracing::warn!(error = %err, path = %key_path.display(), "node identity decode failed, rotating key file");
            }
        }
    }

    let identity = NodeIdentity::generate();
    std::fs::write(&key_path, identity.to_bytes().as_slice()).context("failed to persist node identity")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
    }

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_then_reloads_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create(dir.path()).unwrap();
        let second = load_or_create(dir.path()).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn rotates_on_corrupt_key_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("identity.key"), b"not a valid key").unwrap();
        let identity = load_or_create(dir.path()).unwrap();
        let reloaded = load_or_create(dir.path()).unwrap();
        assert_eq!(identity.node_id(), reloaded.node_id());
    }
}
