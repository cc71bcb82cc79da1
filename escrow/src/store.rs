//! Key Escrow persistence — a transactional, single-node SQLite store for
//! per-artifact symmetric keys, sealed at rest under a server-wide master
//! key (`spec.md` §4.8), grounded in the teacher pack's `rusqlite` usage
//! in `botho-project-botho/infra/faucet/metrics-daemon/src/db.rs`
//! (`Connection::open` + `execute_batch` schema creation + `params!`
//! queries), generalized here to add master-key AEAD sealing and
//! explicit transactions per mutating call.

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum EscrowStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("key material is sealed with a different master key or is corrupt")]
    DecryptionFailed,
    #[error("no escrow record for hash {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct EscrowRow {
    pub hash: String,
    pub origin_node_id: String,
    pub name: String,
    pub created_at: u64,
}

/// Seal a raw 32-byte artifact key under the master key with a fresh
/// nonce. Stored blob layout is `nonce ‖ ciphertext`, matching every
/// other AEAD container in this system.
fn seal(master_key: &[u8; 32], key_bytes: &[u8]) -> Result<Vec<u8>, EscrowStoreError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = XChaCha20Poly1305::new_from_slice(master_key).map_err(|_| EscrowStoreError::DecryptionFailed)?;
    let nonce = XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: key_bytes, aad: &[] })
        .map_err(|_| EscrowStoreError::DecryptionFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(master_key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, EscrowStoreError> {
    if sealed.len() < NONCE_LEN {
        return Err(EscrowStoreError::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(master_key).map_err(|_| EscrowStoreError::DecryptionFailed)?;
    let nonce = XNonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| EscrowStoreError::DecryptionFailed)
}

/// SQLite-backed escrow store. Wrapped in a `Mutex` because `rusqlite`
/// connections are `Send` but not `Sync`; every warp handler acquires it
/// only for the duration of a single row operation.
pub struct EscrowStore {
    conn: Mutex<Connection>,
    master_key: Zeroizing<[u8; 32]>,
}

impl EscrowStore {
    pub fn open(path: &Path, master_key: [u8; 32]) -> Result<Self, EscrowStoreError> {
        let master_key = Zeroizing::new(master_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|_| EscrowStoreError::DecryptionFailed)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS escrow_keys (
                hash             TEXT PRIMARY KEY,
                origin_node_id   TEXT NOT NULL,
                key_encrypted    BLOB NOT NULL,
                file_name        TEXT NOT NULL,
                created_at       INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            master_key,
        })
    }

    /// In-memory store, used by tests.
    #[cfg(test)]
    pub fn open_in_memory(master_key: [u8; 32]) -> Result<Self, EscrowStoreError> {
        let master_key = Zeroizing::new(master_key);
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS escrow_keys (
                hash             TEXT PRIMARY KEY,
                origin_node_id   TEXT NOT NULL,
                key_encrypted    BLOB NOT NULL,
                file_name        TEXT NOT NULL,
                created_at       INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            master_key,
        })
    }

    /// Upsert a key row inside an explicit transaction.
    pub fn save(&self, hash: &str, origin_node_id: &str, key_bytes: &[u8], name: &str, created_at: u64) -> Result<(), EscrowStoreError> {
        let sealed = seal(&self.master_key, key_bytes)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO escrow_keys (hash, origin_node_id, key_encrypted, file_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(hash) DO UPDATE SET
                origin_node_id = excluded.origin_node_id,
                key_encrypted = excluded.key_encrypted,
                file_name = excluded.file_name,
                created_at = excluded.created_at",
            params![hash, origin_node_id, sealed, name, created_at as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Decrypted key material plus the record's metadata. `NotFound` for
    /// an unknown hash.
    pub fn get(&self, hash: &str) -> Result<(Vec<u8>, EscrowRow), EscrowStoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT origin_node_id, key_encrypted, file_name, created_at FROM escrow_keys WHERE hash = ?1",
                params![hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let (origin_node_id, sealed, name, created_at) = row.ok_or_else(|| EscrowStoreError::NotFound(hash.to_string()))?;
        let key_bytes = open(&self.master_key, &sealed)?;
        Ok((
            key_bytes,
            EscrowRow {
                hash: hash.to_string(),
                origin_node_id,
                name,
                created_at: created_at as u64,
            },
        ))
    }

    /// Records for a node, without key material.
    pub fn list(&self, node_id: &str) -> Result<Vec<EscrowRow>, EscrowStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT hash, origin_node_id, file_name, created_at FROM escrow_keys WHERE origin_node_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![node_id], |row| {
            Ok(EscrowRow {
                hash: row.get(0)?,
                origin_node_id: row.get(1)?,
                name: row.get(2)?,
                created_at: row.get::<_, i64>(3)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete a row, but only when `node_id` matches the row's origin.
    /// Returns whether a row was actually removed.
    pub fn delete(&self, hash: &str, node_id: &str) -> Result<bool, EscrowStoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM escrow_keys WHERE hash = ?1 AND origin_node_id = ?2",
            params![hash, node_id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_get_recovers_key() {
        let store = EscrowStore::open_in_memory([7u8; 32]).unwrap();
        store.save("h1", "n1", b"0123456789abcdef0123456789abcdef", "doc.txt", 100).unwrap();
        let (key, row) = store.get("h1").unwrap();
        assert_eq!(key, b"0123456789abcdef0123456789abcdef");
        assert_eq!(row.origin_node_id, "n1");
        assert_eq!(row.name, "doc.txt");
    }

    #[test]
    fn get_unknown_hash_is_not_found() {
        let store = EscrowStore::open_in_memory([1u8; 32]).unwrap();
        assert!(matches!(store.get("missing"), Err(EscrowStoreError::NotFound(_))));
    }

    #[test]
    fn delete_requires_matching_origin() {
        let store = EscrowStore::open_in_memory([2u8; 32]).unwrap();
        store.save("h2", "owner", b"key-bytes-here", "f.bin", 1).unwrap();

        assert!(!store.delete("h2", "not-owner").unwrap());
        assert!(store.get("h2").is_ok());

        assert!(store.delete("h2", "owner").unwrap());
        assert!(matches!(store.get("h2"), Err(EscrowStoreError::NotFound(_))));
    }

    #[test]
    fn list_returns_only_requested_node() {
        let store = EscrowStore::open_in_memory([3u8; 32]).unwrap();
        store.save("h3", "a", b"key-a", "a.bin", 1).unwrap();
        store.save("h4", "b", b"key-b", "b.bin", 2).unwrap();

        let rows = store.list("a").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hash, "h3");
    }

    #[test]
    fn save_upserts_existing_hash() {
        let store = EscrowStore::open_in_memory([4u8; 32]).unwrap();
        store.save("h5", "a", b"first-key-bytes-", "a.bin", 1).unwrap();
        store.save("h5", "a", b"second-key-bytes", "a.bin", 2).unwrap();

        let (key, row) = store.get("h5").unwrap();
        assert_eq!(key, b"second-key-bytes");
        assert_eq!(row.created_at, 2);
    }
}
