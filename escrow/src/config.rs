//! Startup configuration for the Key Escrow Service (`spec.md` §4.8): the
//! master key and bearer tokens are read from the environment, not CLI
//! flags, so they never show up in `ps`/shell history — only the network
//! surface (bind address, TLS material, db path) is a `clap` flag,
//! mirroring the teacher's config module's split between persisted
//! settings and process-only secrets.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use meshvault_core::ConfigError;
use zeroize::Zeroizing;

const MASTER_KEY_ENV: &str = "MESHVAULT_ESCROW_MASTER_KEY";
const TOKENS_ENV: &str = "MESHVAULT_ESCROW_TOKENS";

#[derive(Parser, Debug)]
#[command(name = "meshvault-escrow")]
#[command(about = "Key Escrow Service for a MeshVault mesh", long_about = None)]
#[command(version)]
pub struct Args {
    /// Address the escrow HTTP surface binds to.
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub bind: SocketAddr,

    /// Path to the SQLite database file.
    #[arg(long, default_value = "escrow.sqlite3")]
    pub db_path: PathBuf,

    /// PEM certificate chain for TLS. Required unless `--insecure-http`.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for TLS. Required unless `--insecure-http`.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Serve plaintext HTTP instead of TLS. Development only.
    #[arg(long, default_value_t = false)]
    pub insecure_http: bool,
}

pub struct ResolvedConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub master_key: Zeroizing<[u8; 32]>,
    pub tokens: HashSet<String>,
    pub tls: Option<(PathBuf, PathBuf)>,
}

/// Parse the 32-byte master key from `MESHVAULT_ESCROW_MASTER_KEY` (hex).
/// Missing or all-zero is a fatal configuration error, as `spec.md` §4.8
/// requires.
fn load_master_key() -> Result<[u8; 32], ConfigError> {
    let hex_value = std::env::var(MASTER_KEY_ENV).map_err(|_| ConfigError::Missing(MASTER_KEY_ENV))?;
    let bytes = hex::decode(hex_value.trim()).map_err(|err| ConfigError::Malformed {
        field: MASTER_KEY_ENV,
        reason: err.to_string(),
    })?;
    let key: [u8; 32] = bytes.try_into().map_err(|_| ConfigError::Malformed {
        field: MASTER_KEY_ENV,
        reason: "master key must be exactly 32 bytes (64 hex characters)".to_string(),
    })?;
    if key == [0u8; 32] {
        return Err(ConfigError::Malformed {
            field: MASTER_KEY_ENV,
            reason: "all-zero master key is not permitted".to_string(),
        });
    }
    Ok(key)
}

fn load_tokens() -> HashSet<String> {
    std::env::var(TOKENS_ENV)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Args {
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        let master_key = load_master_key()?;
        let tokens = load_tokens();
        if tokens.is_empty() {
            tracing::warn!("no bearer tokens configured ({TOKENS_ENV} unset) — escrow is running in open mode");
        }

        let tls = if self.insecure_http {
            tracing::warn!("--insecure-http set: serving plaintext HTTP, do not use in production");
            None
        } else {
            let cert = self.tls_cert.ok_or(ConfigError::Missing("tls_cert"))?;
            let key = self.tls_key.ok_or(ConfigError::Missing("tls_key"))?;
            Some((cert, key))
        };

        Ok(ResolvedConfig {
            bind: self.bind,
            db_path: self.db_path,
            master_key: Zeroizing::new(master_key),
            tokens,
            tls,
        })
    }
}
