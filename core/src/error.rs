//! Shared error taxonomy used across the engines.
//!
//! Each component defines its own `thiserror` enum (see `vault`, `chain`,
//! `replication`, `mix`, `escrow`); this module holds the handful of
//! classifications that are common to more than one component and the
//! mapping helpers the HTTP surfaces use to translate them into status
//! codes, following the teacher's `OnionError`/`DriftError` style of one
//! enum per component rather than a single monolithic error type.

use thiserror::Error;

/// Coarse-grained classification a binary's HTTP layer maps to a status
/// code. Individual component errors implement `AsRef<ErrorClass>` (or are
/// matched explicitly at the call site) rather than this crate forcing a
/// single error type on every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fatal at startup — missing passphrase, malformed address, etc.
    Config,
    /// AEAD authentication failure, wrong passphrase, bad key length.
    Crypto,
    /// Bad request body, bad JSON, bad base64, hash mismatch.
    Protocol,
    /// `prev_hash` does not match the local tip.
    ChainMismatch,
    /// Not an error — the envelope was already processed.
    DuplicateSuppressed,
    /// Missing blob / escrow key / peer.
    NotFound,
    /// Loopback-only endpoint reached remotely, or bearer auth failed.
    Forbidden,
    /// Peer unreachable during fanout — logged, never retried inline.
    Transient,
    /// Local I/O failure while persisting a locally originated artifact.
    Fatal,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration value: {0}")]
    Missing(&'static str),
    #[error("malformed configuration value for {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("no usable network interface found")]
    NoInterface,
}
