//! Key Escrow wire types and the client used by the Replication Engine to
//! archive per-artifact keys (`spec.md` §4.8). The service side lives in
//! the `meshvault-escrow` binary; this module only carries the shared
//! request/response shapes and a thin `reqwest`-based client, following
//! the teacher's pattern of keeping wire structs in the library crate and
//! the HTTP plumbing in the binaries.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveKeyRequest {
    pub hash: String,
    pub key_b64: String,
    pub node_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetKeyResponse {
    pub key_b64: String,
    pub name: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyListEntry {
    pub hash: String,
    pub node_id: String,
    pub name: String,
    pub created_at: u64,
}

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("escrow request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("escrow key not found")]
    NotFound,
    #[error("escrow rejected the request as forbidden")]
    Forbidden,
    #[error("escrow returned an unexpected status: {0}")]
    UnexpectedStatus(u16),
}

/// Thin client for the Key Escrow Service's HTTP surface. Escrow
/// unavailability is never fatal to the Replication Engine — callers log
/// and continue, per `spec.md` §4.5's "also uploaded to the Key Escrow"
/// note, which does not make escrow a hard dependency.
#[derive(Clone)]
pub struct EscrowClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl EscrowClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            token,
            http,
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn save(&self, request: &SaveKeyRequest) -> Result<(), EscrowError> {
        let url = format!("{}/keys/save", self.base_url);
        let response = self.authed(self.http.post(&url).json(request)).send().await?;
        match response.status().as_u16() {
            200 | 201 => Ok(()),
            403 => Err(EscrowError::Forbidden),
            status => Err(EscrowError::UnexpectedStatus(status)),
        }
    }

    pub async fn get(&self, hash: &str) -> Result<GetKeyResponse, EscrowError> {
        let url = format!("{}/keys/get", self.base_url);
        let response = self
            .authed(self.http.get(&url).query(&[("hash", hash)]))
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            404 => Err(EscrowError::NotFound),
            403 => Err(EscrowError::Forbidden),
            status => Err(EscrowError::UnexpectedStatus(status)),
        }
    }

    pub async fn list(&self, node_id: &str) -> Result<Vec<KeyListEntry>, EscrowError> {
        let url = format!("{}/keys/list", self.base_url);
        let response = self
            .authed(self.http.get(&url).query(&[("node_id", node_id)]))
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            403 => Err(EscrowError::Forbidden),
            status => Err(EscrowError::UnexpectedStatus(status)),
        }
    }

    pub async fn delete(&self, hash: &str, node_id: &str) -> Result<bool, EscrowError> {
        let url = format!("{}/keys/delete", self.base_url);
        let response = self
            .authed(
                self.http
                    .delete(&url)
                    .query(&[("hash", hash), ("node_id", node_id)]),
            )
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            403 => Err(EscrowError::Forbidden),
            status => Err(EscrowError::UnexpectedStatus(status)),
        }
    }

    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(self.http.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_and_without_token() {
        let _ = EscrowClient::new("http://127.0.0.1:9090", None);
        let _ = EscrowClient::new("http://127.0.0.1:9090", Some("tok".to_string()));
    }
}
