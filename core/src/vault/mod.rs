//! Sealed Envelope Store — the passphrase-sealed on-disk container for the
//! long-lived Beacon Key and File Key (`spec.md` §4.1, §6).
//!
//! On-disk layout (byte-exact): `"MENV1"` (5B) ‖ salt (16B) ‖ nonce (24B) ‖
//! reserved-length (4B big-endian) ‖ authenticated ciphertext
//! (XChaCha20-Poly1305, empty AAD). The KDF is Argon2id, seeded by the
//! salt — a memory-hard KDF as the spec requires, unlike the teacher's
//! `pbkdf2` dependency (see `DESIGN.md`).

use std::io::Read;
use std::path::Path;

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const MAGIC: &[u8; 5] = b"MENV1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("sealed envelope already exists")]
    AlreadyExists,
    #[error("malformed sealed envelope file")]
    BadFormat,
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("sealed envelope is corrupt")]
    Corrupt,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Argon2id tuning. Defaults follow the OWASP password-storage baseline.
#[derive(Debug, Clone, Copy)]
pub struct VaultParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for VaultParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 19_456,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Plaintext record sealed inside the envelope. Zeroized on drop so the
/// raw key material does not linger in memory longer than necessary.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SealedRecord {
    beacon_key: [u8; 32],
    file_key: [u8; 32],
}

/// The two long-lived symmetric keys held by a node.
pub struct Vault {
    pub beacon_key: Zeroizing<[u8; 32]>,
    pub file_key: Zeroizing<[u8; 32]>,
}

impl Vault {
    /// Generate fresh keys and write a new sealed envelope file.
    ///
    /// Fails with `AlreadyExists` unless `overwrite` is set, in which case
    /// any existing file is renamed to a `.backup` sibling first.
    pub fn provision(
        path: &Path,
        passphrase: &str,
        overwrite: bool,
    ) -> Result<Self, VaultError> {
        if path.exists() {
            if !overwrite {
                return Err(VaultError::AlreadyExists);
            }
            let backup = sibling_with_suffix(path, "backup");
            std::fs::rename(path, &backup)?;
        }

        let mut beacon_key = [0u8; 32];
        let mut file_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut beacon_key);
        rand::rngs::OsRng.fill_bytes(&mut file_key);

        let record = SealedRecord {
            beacon_key,
            file_key,
        };
        write_sealed(path, passphrase, &record, VaultParams::default())?;

        #[cfg(unix)]
        set_owner_only(path)?;

        Ok(Self {
            beacon_key: Zeroizing::new(beacon_key),
            file_key: Zeroizing::new(file_key),
        })
    }

    /// Open an existing sealed envelope file.
    pub fn open(path: &Path, passphrase: &str) -> Result<Self, VaultError> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        drop(file);

        let record = open_sealed(&buf, passphrase)?;
        Ok(Self {
            beacon_key: Zeroizing::new(record.beacon_key),
            file_key: Zeroizing::new(record.file_key),
        })
    }

    /// Re-write the sealed envelope under a (possibly new) passphrase,
    /// keeping the same keys.
    pub fn reseal(&self, path: &Path, passphrase: &str) -> Result<(), VaultError> {
        let record = SealedRecord {
            beacon_key: *self.beacon_key,
            file_key: *self.file_key,
        };
        write_sealed(path, passphrase, &record, VaultParams::default())?;
        #[cfg(unix)]
        set_owner_only(path)?;
        Ok(())
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN], params: VaultParams) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(params.mem_cost_kib, params.time_cost, params.parallelism, Some(32))
            .map_err(|_| VaultError::BadFormat)?,
    );
    let mut out = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, out.as_mut())
        .map_err(|_| VaultError::BadFormat)?;
    Ok(out)
}

fn write_sealed(
    path: &Path,
    passphrase: &str,
    record: &SealedRecord,
    params: VaultParams,
) -> Result<(), VaultError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt, params)?;
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_ref()).map_err(|_| VaultError::BadFormat)?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let plaintext = bincode::serialize(record).map_err(|_| VaultError::BadFormat)?;
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: &plaintext, aad: &[] })
        .map_err(|_| VaultError::BadFormat)?;

    let mut out = Vec::with_capacity(5 + SALT_LEN + NONCE_LEN + 4 + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(&ciphertext);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn open_sealed(buf: &[u8], passphrase: &str) -> Result<SealedRecord, VaultError> {
    let header_len = 5 + SALT_LEN + NONCE_LEN + 4;
    if buf.len() < header_len {
        return Err(VaultError::BadFormat);
    }
    if &buf[0..5] != MAGIC {
        return Err(VaultError::BadFormat);
    }
    let salt: [u8; SALT_LEN] = buf[5..5 + SALT_LEN].try_into().unwrap();
    let nonce_start = 5 + SALT_LEN;
    let nonce_bytes: [u8; NONCE_LEN] = buf[nonce_start..nonce_start + NONCE_LEN].try_into().unwrap();
    let len_start = nonce_start + NONCE_LEN;
    let reserved_len =
        u32::from_be_bytes(buf[len_start..len_start + 4].try_into().unwrap()) as usize;
    let ciphertext = &buf[len_start + 4..];
    if ciphertext.len() != reserved_len {
        return Err(VaultError::BadFormat);
    }

    let key = derive_key(passphrase, &salt, VaultParams::default())?;
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_ref()).map_err(|_| VaultError::BadFormat)?;
    let nonce = XNonce::from_slice(&nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| VaultError::WrongPassphrase)?;

    let mut record: SealedRecord =
        bincode::deserialize(&plaintext).map_err(|_| VaultError::Corrupt)?;
    let out = SealedRecord {
        beacon_key: record.beacon_key,
        file_key: record.file_key,
    };
    record.zeroize();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn provision_then_open_recovers_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.enc");

        let vault = Vault::provision(&path, "correct horse", false).unwrap();
        let beacon = *vault.beacon_key;
        let file_key = *vault.file_key;

        let reopened = Vault::open(&path, "correct horse").unwrap();
        assert_eq!(*reopened.beacon_key, beacon);
        assert_eq!(*reopened.file_key, file_key);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.enc");

        Vault::provision(&path, "right", false).unwrap();
        let result = Vault::open(&path, "wrong");
        assert!(matches!(result, Err(VaultError::WrongPassphrase)));
    }

    #[test]
    fn provision_twice_without_overwrite_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.enc");

        Vault::provision(&path, "p", false).unwrap();
        let result = Vault::provision(&path, "p", false);
        assert!(matches!(result, Err(VaultError::AlreadyExists)));
    }

    #[test]
    fn provision_with_overwrite_backs_up_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.enc");

        Vault::provision(&path, "first", false).unwrap();
        Vault::provision(&path, "second", true).unwrap();

        let backup = sibling_with_suffix(&path, "backup");
        assert!(backup.exists());
        // New file opens with the new passphrase.
        assert!(Vault::open(&path, "second").is_ok());
        // Old file still opens with the old passphrase.
        assert!(Vault::open(&backup, "first").is_ok());
    }

    #[test]
    fn tampered_file_fails_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.enc");
        Vault::provision(&path, "p", false).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        *bytes.last_mut().unwrap() ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let result = Vault::open(&path, "p");
        assert!(result.is_err());
    }

    #[test]
    fn bad_magic_is_bad_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.enc");
        std::fs::write(&path, b"NOTMAGIC_and_some_padding_bytes_to_pass_length_check_0000").unwrap();
        let result = Vault::open(&path, "p");
        assert!(matches!(result, Err(VaultError::BadFormat)));
    }

    #[test]
    fn reseal_preserves_keys_under_new_passphrase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.enc");
        let vault = Vault::provision(&path, "old", false).unwrap();

        vault.reseal(&path, "new").unwrap();

        assert!(Vault::open(&path, "old").is_err());
        let reopened = Vault::open(&path, "new").unwrap();
        assert_eq!(*reopened.beacon_key, *vault.beacon_key);
        assert_eq!(*reopened.file_key, *vault.file_key);
    }

    proptest::proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(8))]

        // Argon2id is memory-hard by design, so this is kept to a handful
        // of cases rather than proptest's default 256.
        #[test]
        fn seal_then_open_recovers_keys_for_any_passphrase(passphrase in "\\PC{1,64}") {
            let dir = tempdir().unwrap();
            let path = dir.path().join("env.enc");

            let vault = Vault::provision(&path, &passphrase, false).unwrap();
            let reopened = Vault::open(&path, &passphrase).unwrap();

            proptest::prop_assert_eq!(*reopened.beacon_key, *vault.beacon_key);
            proptest::prop_assert_eq!(*reopened.file_key, *vault.file_key);
        }
    }
}
