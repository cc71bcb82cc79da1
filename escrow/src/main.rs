//! `meshvault-escrow` — the Key Escrow Service binary (`spec.md` §4.8):
//! a durable, access-controlled custodian of per-artifact symmetric keys,
//! sealed at rest under a server-wide master key. HTTP plumbing follows
//! the teacher's `warp`-filter composition in `cli/src/server.rs`
//! (`warp::any().map(move || ...)` state injection, `.and_then` handlers,
//! `.or()`-chained routes), generalized to the escrow wire contract.

mod config;
mod store;

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use clap::Parser;
use meshvault_core::escrow::{GetKeyResponse, KeyListEntry, SaveKeyRequest};
use serde::Serialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use config::Args;
use store::{EscrowStore, EscrowStoreError};

struct AppState {
    store: EscrowStore,
    tokens: HashSet<String>,
}

#[derive(Debug)]
struct Forbidden;
impl warp::reject::Reject for Forbidden {}

#[derive(Debug)]
struct NotFound;
impl warp::reject::Reject for NotFound {}

#[derive(Debug)]
struct StoreFailure(String);
impl warp::reject::Reject for StoreFailure {}

fn with_state(state: Arc<AppState>) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Bearer-token gate. An empty token set is open mode — every request
/// passes, per `spec.md` §4.8's "absence of tokens means open mode".
fn authenticated(state: Arc<AppState>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_state(state))
        .and_then(|header: Option<String>, state: Arc<AppState>| async move {
            if state.tokens.is_empty() {
                return Ok(());
            }
            let token = header.as_deref().and_then(|h| h.strip_prefix("Bearer "));
            match token {
                Some(token) if state.tokens.contains(token) => Ok(()),
                _ => Err(warp::reject::custom(Forbidden)),
            }
        })
        .untuple_one()
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

async fn handle_save(request: SaveKeyRequest, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let key_bytes = STANDARD
        .decode(&request.key_b64)
        .map_err(|err| warp::reject::custom(StoreFailure(err.to_string())))?;

    state
        .store
        .save(&request.hash, &request.node_id, &key_bytes, &request.name, now_unix())
        .map_err(|err| warp::reject::custom(StoreFailure(err.to_string())))?;

    Ok(warp::reply::with_status(warp::reply::json(&serde_json::json!({"status": "ok"})), StatusCode::CREATED))
}

#[derive(serde::Deserialize)]
struct HashQuery {
    hash: String,
}

async fn handle_get(query: HashQuery, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let (key_bytes, row) = state.store.get(&query.hash).map_err(|err| match err {
        EscrowStoreError::NotFound(_) => warp::reject::custom(NotFound),
        other => warp::reject::custom(StoreFailure(other.to_string())),
    })?;

    let response = GetKeyResponse {
        key_b64: STANDARD.encode(key_bytes),
        name: row.name,
        node_id: row.origin_node_id,
    };
    Ok(warp::reply::json(&response))
}

#[derive(serde::Deserialize)]
struct NodeQuery {
    node_id: String,
}

async fn handle_list(query: NodeQuery, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let rows = state
        .store
        .list(&query.node_id)
        .map_err(|err| warp::reject::custom(StoreFailure(err.to_string())))?;

    let entries: Vec<KeyListEntry> = rows
        .into_iter()
        .map(|row| KeyListEntry {
            hash: row.hash,
            node_id: row.origin_node_id,
            name: row.name,
            created_at: row.created_at,
        })
        .collect();
    Ok(warp::reply::json(&entries))
}

#[derive(serde::Deserialize)]
struct DeleteQuery {
    hash: String,
    node_id: String,
}

async fn handle_delete(query: DeleteQuery, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let removed = state
        .store
        .delete(&query.hash, &query.node_id)
        .map_err(|err| warp::reject::custom(StoreFailure(err.to_string())))?;

    let status = if removed { StatusCode::OK } else { StatusCode::NOT_FOUND };
    let body = if removed { "deleted" } else { "not_found" };
    Ok(warp::reply::with_status(warp::reply::json(&serde_json::json!({"status": body})), status))
}

async fn handle_health() -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({"status": "ok"})))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if rejection.find::<Forbidden>().is_some() {
        (StatusCode::FORBIDDEN, "forbidden".to_string())
    } else if rejection.find::<NotFound>().is_some() {
        (StatusCode::NOT_FOUND, "escrow key not found".to_string())
    } else if let Some(StoreFailure(reason)) = rejection.find::<StoreFailure>() {
        (StatusCode::BAD_REQUEST, reason.clone())
    } else if rejection.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        (StatusCode::BAD_REQUEST, "malformed request body".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    Ok(warp::reply::with_status(warp::reply::json(&ErrorBody { error: message }), status))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let resolved = args.resolve().map_err(|err| anyhow::anyhow!(err))?;

    let store = EscrowStore::open(&resolved.db_path, *resolved.master_key)?;
    let state = Arc::new(AppState {
        store,
        tokens: resolved.tokens,
    });

    let save_route = warp::path!("keys" / "save")
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(warp::body::content_length_limit(1024 * 64))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_save)
        .boxed();

    let get_route = warp::path!("keys" / "get")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and(warp::query::<HashQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_get)
        .boxed();

    let list_route = warp::path!("keys" / "list")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and(warp::query::<NodeQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_list)
        .boxed();

    let delete_route = warp::path!("keys" / "delete")
        .and(warp::delete())
        .and(authenticated(state.clone()))
        .and(warp::query::<DeleteQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_delete)
        .boxed();

    let health_route = warp::path("health")
        .and(warp::get())
        .and_then(handle_health)
        .boxed();

    let routes = save_route
        .or(get_route)
        .or(list_route)
        .or(delete_route)
        .or(health_route)
        .recover(handle_rejection)
        .boxed();

    match resolved.tls {
        Some((cert, key)) => {
            tracing::info!(bind = %resolved.bind, "starting escrow service with TLS");
            // warp's rustls acceptor only negotiates TLS 1.2/1.3 ECDHE AEAD
            // suites by default, satisfying the restricted-cipher-suite
            // requirement without extra configuration here.
            warp::serve(routes)
                .tls()
                .cert_path(&cert)
                .key_path(&key)
                .run(resolved.bind)
                .await;
        }
        None => {
            tracing::info!(bind = %resolved.bind, "starting escrow service over plaintext HTTP (insecure)");
            warp::serve(routes).run(resolved.bind).await;
        }
    }

    Ok(())
}
