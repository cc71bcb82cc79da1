//! Peer Directory — the in-memory node-id → peer mapping fed by the
//! Beacon Transport, with a periodically re-sealed disk snapshot
//! (`spec.md` §4.2).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub api_port: u16,
    pub hostname: String,
    /// Monotonic timestamp (millis); never goes backwards for a given id.
    pub last_seen: u64,
    pub mix_public_key: [u8; 32],
}

#[derive(Debug, Error)]
pub enum PeerDirectoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed peer snapshot")]
    BadFormat,
}

/// Concurrent-read, serialized-write peer directory. Snapshots returned
/// by `list()` are value copies — callers cannot mutate the live map.
#[derive(Default)]
pub struct PeerDirectory {
    inner: RwLock<HashMap<NodeId, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer record. `last_seen` only ever advances —
    /// an upsert carrying an older timestamp than what's on file updates
    /// every other field but leaves `last_seen` untouched.
    pub fn upsert(&self, mut record: PeerRecord) {
        let mut guard = self.inner.write();
        match guard.get(&record.node_id) {
            Some(existing) if existing.last_seen > record.last_seen => {
                record.last_seen = existing.last_seen;
            }
            _ => {}
        }
        guard.insert(record.node_id.clone(), record);
    }

    pub fn get(&self, node_id: &NodeId) -> Option<PeerRecord> {
        self.inner.read().get(node_id).cloned()
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge a snapshot (e.g. fetched from another node) into the
    /// directory. Returns the number of records actually inserted or
    /// updated with a newer `last_seen`.
    pub fn merge(&self, snapshot: &[PeerRecord]) -> usize {
        let mut changed = 0;
        let mut guard = self.inner.write();
        for record in snapshot {
            match guard.get(&record.node_id) {
                Some(existing) if existing.last_seen >= record.last_seen => continue,
                _ => {
                    guard.insert(record.node_id.clone(), record.clone());
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Peers other than `local_id` and the peer identified by `exclude`
    /// (the node that just sent us something, to avoid bouncing it back
    /// immediately).
    pub fn fanout_targets(&self, local_id: &NodeId, exclude: Option<&NodeId>) -> Vec<PeerRecord> {
        self.inner
            .read()
            .values()
            .filter(|p| &p.node_id != local_id && Some(&p.node_id) != exclude)
            .cloned()
            .collect()
    }

    /// Seal the current snapshot to disk under the File Key.
    pub fn seal_to(&self, path: &Path, file_key: &[u8; 32]) -> Result<(), PeerDirectoryError> {
        let snapshot = self.list();
        let json = serde_json::to_vec(&snapshot).map_err(|_| PeerDirectoryError::BadFormat)?;

        let mut nonce_bytes = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let cipher = XChaCha20Poly1305::new_from_slice(file_key).map_err(|_| PeerDirectoryError::BadFormat)?;
        let nonce = XNonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: &json, aad: &[] })
            .map_err(|_| PeerDirectoryError::BadFormat)?;

        let mut out = Vec::with_capacity(24 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, out)?;
        Ok(())
    }

    /// Best-effort startup load: any failure (missing file, bad AEAD, bad
    /// JSON) is swallowed — the directory starts empty, as `spec.md` §4.2
    /// requires.
    pub fn load_from(path: &Path, file_key: &[u8; 32]) -> Self {
        let directory = Self::new();
        match Self::try_load(path, file_key) {
            Ok(snapshot) => {
                directory.merge(&snapshot);
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "failed to load peer snapshot, starting empty");
            }
        }
        directory
    }

    fn try_load(path: &Path, file_key: &[u8; 32]) -> Result<Vec<PeerRecord>, PeerDirectoryError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 24 {
            return Err(PeerDirectoryError::BadFormat);
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(24);
        let cipher = XChaCha20Poly1305::new_from_slice(file_key).map_err(|_| PeerDirectoryError::BadFormat)?;
        let nonce = XNonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
            .map_err(|_| PeerDirectoryError::BadFormat)?;
        serde_json::from_slice(&plaintext).map_err(|_| PeerDirectoryError::BadFormat)
    }
}
