//! Replication Engine — content-addressed encrypt-once fanout with a
//! hash-linked chain and loop suppression (`spec.md` §4.5).

pub mod seen;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::chain::{ChainBlock, ChainError, ChainLog};
use crate::escrow::{EscrowClient, SaveKeyRequest};
use crate::events::{Event, EventSink};
use crate::identity::NodeId;
use crate::peer::PeerDirectory;
use crate::store::KvStore;
use seen::SeenSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationEnvelope {
    pub msg_id: String,
    pub origin_id: NodeId,
    pub name: String,
    pub hash_hex: String,
    pub prev_hash: String,
    pub cipher_b64: String,
    pub created_unix: u64,
    pub hops: u32,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("chain mismatch: expected tip {expected}, got {actual}")]
    ChainMismatch { expected: String, actual: String },
    #[error("hash mismatch: cipher hashes to {computed}, envelope claims {claimed}")]
    HashMismatch { computed: String, claimed: String },
    #[error("malformed base64 cipher payload")]
    BadCipher,
    #[error("blob not found for hash {0}")]
    NotFound(String),
    #[error("decryption failed, wrong key or tampered ciphertext")]
    DecryptionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginateOutcome {
    pub hash_hex: String,
    pub store_key: String,
    pub fanout: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    Seen,
    Accepted { hops: u32 },
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn fresh_msg_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn seal_artifact(plaintext: &[u8], key: &[u8; 32]) -> Result<(Vec<u8>, [u8; 32]), ReplicationError> {
    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| ReplicationError::DecryptionFailed)?;
    let nonce = XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| ReplicationError::DecryptionFailed)?;

    let mut cipher_bytes = Vec::with_capacity(24 + ciphertext.len());
    cipher_bytes.extend_from_slice(&nonce_bytes);
    cipher_bytes.extend_from_slice(&ciphertext);
    Ok((cipher_bytes, *key))
}

fn open_artifact(cipher_bytes: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, ReplicationError> {
    if cipher_bytes.len() < 24 {
        return Err(ReplicationError::BadCipher);
    }
    let (nonce_bytes, ciphertext) = cipher_bytes.split_at(24);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| ReplicationError::DecryptionFailed)?;
    let nonce = XNonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| ReplicationError::DecryptionFailed)
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default()
}

#[cfg(unix)]
fn harden_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(unix)]
fn harden_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

pub struct ReplicationEngine {
    local_id: NodeId,
    chain: Arc<ChainLog>,
    directory: Arc<PeerDirectory>,
    seen: Arc<SeenSet>,
    cache: Arc<dyn KvStore>,
    chunks_dir: PathBuf,
    keys_dir: PathBuf,
    escrow: EscrowClient,
    events: EventSink,
    http: reqwest::Client,
}

impl ReplicationEngine {
    pub fn new(
        local_id: NodeId,
        chain: Arc<ChainLog>,
        directory: Arc<PeerDirectory>,
        seen: Arc<SeenSet>,
        cache: Arc<dyn KvStore>,
        chunks_dir: PathBuf,
        keys_dir: PathBuf,
        escrow: EscrowClient,
        events: EventSink,
    ) -> Self {
        Self {
            local_id,
            chain,
            directory,
            seen,
            cache,
            chunks_dir,
            keys_dir,
            escrow,
            events,
            http: reqwest::Client::new(),
        }
    }

    /// Originate a new blob locally: seal, link into the chain, persist,
    /// escrow the key, and fan out to every known peer.
    pub async fn originate(&self, name: &str, plaintext: &[u8]) -> Result<OriginateOutcome, ReplicationError> {
        let mut artifact_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut artifact_key);
        let (cipher_bytes, key) = seal_artifact(plaintext, &artifact_key)?;

        let hash_hex = hex::encode(Sha256::digest(&cipher_bytes));

        std::fs::create_dir_all(&self.keys_dir)?;
        #[cfg(unix)]
        harden_dir(&self.keys_dir)?;
        let key_path = self.keys_dir.join(format!("{}{}.fkey", &hash_hex[..16], extension_of(name)));
        std::fs::write(&key_path, key)?;
        #[cfg(unix)]
        harden_file(&key_path)?;

        let save_request = SaveKeyRequest {
            hash: hash_hex.clone(),
            key_b64: STANDARD.encode(key),
            node_id: self.local_id.0.clone(),
            name: name.to_string(),
        };
        if let Err(err) = self.escrow.save(&save_request).await {
            tracing::warn!(error = %err, hash = %hash_hex, "escrow upload failed, local key file remains the fallback");
        }

        let prev_hash = self.chain.tip();
        let block = ChainBlock {
            hash: hash_hex.clone(),
            prev_hash: prev_hash.clone(),
            name: name.to_string(),
            size: cipher_bytes.len() as u64,
            created_unix: now_unix(),
            origin_id: self.local_id.clone(),
        };
        self.chain.append(&block)?;
        self.events.send(Event::BlockAppended { hash: hash_hex.clone(), prev_hash: prev_hash.clone() });

        std::fs::create_dir_all(&self.chunks_dir)?;
        let chunk_path = self.chunks_dir.join(format!("{hash_hex}.bin"));
        std::fs::write(&chunk_path, &cipher_bytes)?;
        #[cfg(unix)]
        harden_file(&chunk_path)?;

        let store_key = format!("blob-{hash_hex}-{name}");
        self.cache.put(&store_key, cipher_bytes.clone());

        let msg_id = fresh_msg_id();
        self.seen.mark(&msg_id);

        let envelope = ReplicationEnvelope {
            msg_id: msg_id.clone(),
            origin_id: self.local_id.clone(),
            name: name.to_string(),
            hash_hex: hash_hex.clone(),
            prev_hash,
            cipher_b64: URL_SAFE_NO_PAD.encode(&cipher_bytes),
            created_unix: now_unix(),
            hops: 0,
        };

        let targets = self.directory.fanout_targets(&self.local_id, None);
        let fanout = targets.len();
        for target in targets {
            let http = self.http.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                let url = format!("http://{}/replicate", target.address);
                if let Err(err) = http.post(&url).json(&envelope).send().await {
                    tracing::warn!(error = %err, peer = %target.node_id, "fanout to peer failed");
                }
            });
        }
        self.events.send(Event::EnvelopeForwarded { msg_id, peer_count: fanout });

        Ok(OriginateOutcome { hash_hex, store_key, fanout })
    }

    /// Admit an envelope received from a peer, per the five-step pipeline
    /// of `spec.md` §4.5 — chain-link check strictly precedes the
    /// seen-set check, so a legitimate out-of-order envelope still gets
    /// the precise `ChainMismatch`.
    pub async fn admit(&self, mut envelope: ReplicationEnvelope, from: NodeId) -> Result<AdmitOutcome, ReplicationError> {
        let tip = self.chain.tip();
        if envelope.prev_hash != tip {
            return Err(ReplicationError::ChainMismatch { expected: tip, actual: envelope.prev_hash });
        }

        if !self.seen.mark(&envelope.msg_id) {
            return Ok(AdmitOutcome::Seen);
        }

        let cipher_bytes = URL_SAFE_NO_PAD
            .decode(&envelope.cipher_b64)
            .map_err(|_| ReplicationError::BadCipher)?;
        let computed = hex::encode(Sha256::digest(&cipher_bytes));
        if computed != envelope.hash_hex {
            return Err(ReplicationError::HashMismatch { computed, claimed: envelope.hash_hex });
        }

        let block = ChainBlock {
            hash: envelope.hash_hex.clone(),
            prev_hash: envelope.prev_hash.clone(),
            name: envelope.name.clone(),
            size: cipher_bytes.len() as u64,
            created_unix: envelope.created_unix,
            origin_id: envelope.origin_id.clone(),
        };
        self.chain.append(&block)?;
        self.events.send(Event::BlockAppended { hash: block.hash.clone(), prev_hash: block.prev_hash.clone() });

        std::fs::create_dir_all(&self.chunks_dir)?;
        let chunk_path = self.chunks_dir.join(format!("{}.bin", envelope.hash_hex));
        std::fs::write(&chunk_path, &cipher_bytes)?;
        #[cfg(unix)]
        harden_file(&chunk_path)?;

        let store_key = format!("blob-{}-{}", envelope.hash_hex, envelope.name);
        self.cache.put(&store_key, cipher_bytes);

        envelope.hops += 1;
        let hops = envelope.hops;

        let targets = self.directory.fanout_targets(&self.local_id, Some(&from));
        for target in targets {
            let http = self.http.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                let url = format!("http://{}/replicate", target.address);
                if let Err(err) = http.post(&url).json(&envelope).send().await {
                    tracing::warn!(error = %err, peer = %target.node_id, "forward to peer failed");
                }
            });
        }

        Ok(AdmitOutcome::Accepted { hops })
    }

    /// Decrypt a locally stored chunk, locating the key either from the
    /// caller-supplied `key_b64` or the stashed key file derived from the
    /// hash and name's extension.
    pub fn decrypt(
        &self,
        hash_hex: &str,
        name: Option<&str>,
        key_b64: Option<&str>,
        out: Option<&Path>,
    ) -> Result<Vec<u8>, ReplicationError> {
        let chunk_path = self.chunks_dir.join(format!("{hash_hex}.bin"));
        let cipher_bytes = std::fs::read(&chunk_path).map_err(|_| ReplicationError::NotFound(hash_hex.to_string()))?;

        let key: [u8; 32] = if let Some(key_b64) = key_b64 {
            let bytes = STANDARD.decode(key_b64).map_err(|_| ReplicationError::BadCipher)?;
            bytes.try_into().map_err(|_| ReplicationError::BadCipher)?
        } else {
            let ext = name.map(extension_of).unwrap_or_default();
            let key_path = self.keys_dir.join(format!("{}{}.fkey", &hash_hex[..16.min(hash_hex.len())], ext));
            let bytes = std::fs::read(&key_path).map_err(|_| ReplicationError::NotFound(hash_hex.to_string()))?;
            bytes.try_into().map_err(|_| ReplicationError::BadCipher)?
        };

        let plaintext = open_artifact(&cipher_bytes, &key)?;

        if let Some(out_path) = out {
            std::fs::write(out_path, &plaintext)?;
        }

        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path, local_id: NodeId) -> ReplicationEngine {
        let chain = Arc::new(ChainLog::open(&dir.join("chain.jsonl")).unwrap());
        let directory = Arc::new(PeerDirectory::new());
        let seen = Arc::new(SeenSet::new());
        let cache: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let escrow = EscrowClient::new("http://127.0.0.1:1", None);
        ReplicationEngine::new(
            local_id,
            chain,
            directory,
            seen,
            cache,
            dir.join("chunks"),
            dir.join("keys"),
            escrow,
            EventSink::new(),
        )
    }

    #[tokio::test]
    async fn originate_writes_chunk_and_advances_chain() {
        let dir = tempdir().unwrap();
        let local_id = NodeId("aa".repeat(32));
        let eng = engine(dir.path(), local_id);

        let outcome = eng.originate("a.txt", b"hello").await.unwrap();
        assert_eq!(outcome.fanout, 0);
        assert_eq!(outcome.store_key, format!("blob-{}-a.txt", outcome.hash_hex));

        let chunk = std::fs::read(dir.path().join("chunks").join(format!("{}.bin", outcome.hash_hex))).unwrap();
        let computed = hex::encode(Sha256::digest(&chunk));
        assert_eq!(computed, outcome.hash_hex);

        assert_eq!(eng.chain.tip(), outcome.hash_hex);
    }

    #[tokio::test]
    async fn originate_then_decrypt_recovers_plaintext() {
        let dir = tempdir().unwrap();
        let local_id = NodeId("bb".repeat(32));
        let eng = engine(dir.path(), local_id);

        let outcome = eng.originate("a.txt", b"hello world").await.unwrap();
        let plaintext = eng.decrypt(&outcome.hash_hex, Some("a.txt"), None, None).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[tokio::test]
    async fn admit_rejects_chain_mismatch() {
        let dir = tempdir().unwrap();
        let local_id = NodeId("cc".repeat(32));
        let eng = engine(dir.path(), local_id.clone());

        let envelope = ReplicationEnvelope {
            msg_id: "m1".to_string(),
            origin_id: NodeId("dd".repeat(32)),
            name: "x.bin".to_string(),
            hash_hex: "deadbeef".to_string(),
            prev_hash: "ffffffff".to_string(),
            cipher_b64: URL_SAFE_NO_PAD.encode(b"irrelevant"),
            created_unix: now_unix(),
            hops: 0,
        };

        let result = eng.admit(envelope, NodeId("ee".repeat(32))).await;
        assert!(matches!(result, Err(ReplicationError::ChainMismatch { .. })));
    }

    #[tokio::test]
    async fn admit_same_envelope_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let local_id = NodeId("ff".repeat(32));
        let eng = engine(dir.path(), local_id.clone());

        let cipher_bytes = {
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            seal_artifact(b"payload", &key).unwrap().0
        };
        let hash_hex = hex::encode(Sha256::digest(&cipher_bytes));

        let envelope = ReplicationEnvelope {
            msg_id: "m-dup".to_string(),
            origin_id: NodeId("11".repeat(32)),
            name: "x.bin".to_string(),
            hash_hex: hash_hex.clone(),
            prev_hash: "".to_string(),
            cipher_b64: URL_SAFE_NO_PAD.encode(&cipher_bytes),
            created_unix: now_unix(),
            hops: 0,
        };

        let first = eng.admit(envelope.clone(), NodeId("22".repeat(32))).await.unwrap();
        assert!(matches!(first, AdmitOutcome::Accepted { hops: 1 }));

        let second = eng.admit(envelope, NodeId("22".repeat(32))).await.unwrap();
        assert_eq!(second, AdmitOutcome::Seen);
        assert_eq!(eng.chain.tip(), hash_hex);
    }

    #[tokio::test]
    async fn admit_rejects_hash_mismatch() {
        let dir = tempdir().unwrap();
        let local_id = NodeId("33".repeat(32));
        let eng = engine(dir.path(), local_id);

        let envelope = ReplicationEnvelope {
            msg_id: "m2".to_string(),
            origin_id: NodeId("44".repeat(32)),
            name: "x.bin".to_string(),
            hash_hex: "0000000000000000000000000000000000000000000000000000000000000000".to_string(),
            prev_hash: "".to_string(),
            cipher_b64: URL_SAFE_NO_PAD.encode(b"some bytes"),
            created_unix: now_unix(),
            hops: 0,
        };

        let result = eng.admit(envelope, NodeId("55".repeat(32))).await;
        assert!(matches!(result, Err(ReplicationError::HashMismatch { .. })));
    }
}
