//! Node identity: an Ed25519 signing keypair whose verifying key hashes to
//! the node-id, plus an independent X25519 static key used only for mix
//! relay layer encryption (the spec's Peer Record carries both a node-id
//! and a separate 32-byte mix public key).

use std::fmt;

use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Stable cryptographic fingerprint for a node: the hex-encoded Blake3
/// hash of its Ed25519 verifying key (grounded in the teacher's
/// `IdentityKeys::identity_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let hash = blake3::hash(public_key);
        NodeId(hex::encode(hash.as_bytes()))
    }

    /// Big-endian byte decoding of the hex id, left-padded to equal length
    /// for XOR-distance comparisons (§4.6).
    pub fn as_bytes(&self) -> Vec<u8> {
        hex::decode(&self.0).unwrap_or_default()
    }

    /// XOR distance to another node-id, as a byte vector comparable with
    /// `Ord` (both operands are left-padded to the longer of the two
    /// lengths before XOR-ing, per the spec's "left-padding to equal
    /// length" instruction).
    pub fn xor_distance(&self, other: &NodeId) -> Vec<u8> {
        let mut a = self.as_bytes();
        let mut b = other.as_bytes();
        let len = a.len().max(b.len());
        while a.len() < len {
            a.insert(0, 0);
        }
        while b.len() < len {
            b.insert(0, 0);
        }
        a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// This node's full identity: a signing keypair (identity/authentication)
/// and a static X25519 keypair (mix relay encryption).
pub struct NodeIdentity {
    pub signing_key: SigningKey,
    pub mix_secret: StaticSecret,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let mix_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);

        Self {
            signing_key,
            mix_secret,
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.signing_key.verifying_key().to_bytes())
    }

    pub fn mix_public_key(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.mix_secret).as_bytes()
    }

    /// Serialize both secrets to a fixed 64-byte buffer (32-byte Ed25519
    /// seed ‖ 32-byte X25519 scalar) for storage alongside the vault.
    pub fn to_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.signing_key.to_bytes());
        out.extend_from_slice(&self.mix_secret.to_bytes());
        zeroize::Zeroizing::new(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != 64 {
            anyhow::bail!("invalid identity key length: {}", bytes.len());
        }
        let signing_key = SigningKey::from_bytes(bytes[0..32].try_into().unwrap());
        let mix_secret = StaticSecret::from(<[u8; 32]>::try_from(&bytes[32..64]).unwrap());
        Ok(Self {
            signing_key,
            mix_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_for_same_key() {
        let identity = NodeIdentity::generate();
        let id1 = identity.node_id();
        let id2 = identity.node_id();
        assert_eq!(id1, id2);
        assert_eq!(id1.0.len(), 64);
    }

    #[test]
    fn distinct_keys_produce_distinct_ids() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.node_id(), b.node_id());
    }

    #[test]
    fn xor_distance_is_zero_for_identical_ids() {
        let identity = NodeIdentity::generate();
        let id = identity.node_id();
        let distance = id.xor_distance(&id);
        assert!(distance.iter().all(|b| *b == 0));
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let a = NodeIdentity::generate().node_id();
        let b = NodeIdentity::generate().node_id();
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
    }

    #[test]
    fn identity_roundtrips_through_bytes() {
        let identity = NodeIdentity::generate();
        let id = identity.node_id();
        let bytes = identity.to_bytes();
        let restored = NodeIdentity::from_bytes(&bytes).unwrap();
        assert_eq!(id, restored.node_id());
        assert_eq!(identity.mix_public_key(), restored.mix_public_key());
    }
}
