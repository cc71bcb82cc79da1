//! Loopback-only HTTP surface — bound to 127.0.0.1, default port 8081
//! (`spec.md` §4.7). Every route sits behind a `loopback_only` filter
//! that rejects any remote address other than 127.0.0.1/::1 before the
//! request reaches a handler, per the spec's explicit MUST. Filter
//! composition otherwise follows the same `warp` pattern as
//! `server_peer.rs`, grounded in the teacher's `cli/src/server.rs`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::FutureExt;
use meshvault_core::command::CommandKind;
use meshvault_core::{mix, NodeId};
use rand::RngCore;
use serde::Deserialize;
use warp::{Filter, Rejection, Reply};

use crate::http_error::{self, forbidden_remote, handle_rejection, mix_error, replication_error};
use crate::state::AppState;

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

fn with_state(state: Arc<AppState>) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Rejects any request whose remote address is not loopback. Warp only
/// knows the remote address when the server is bound over TCP (true for
/// both surfaces here).
fn loopback_only() -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::addr::remote()
        .and_then(|remote: Option<SocketAddr>| async move {
            match remote {
                Some(addr) if addr.ip().is_loopback() => Ok(()),
                _ => Err(forbidden_remote()),
            }
        })
        .untuple_one()
}

fn fresh_msg_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

async fn handle_status(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "node_id": state.identity.node_id().0,
        "hostname": state.node_config.hostname,
        "peer_port": state.node_config.peer_port,
        "loopback_port": state.node_config.loopback_port,
        "peer_count": state.directory.len(),
        "tip": state.chain.tip(),
    })))
}

async fn handle_peers(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&state.directory.list()))
}

async fn handle_sync_status(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "tip": state.chain.tip(),
        "peer_count": state.directory.len(),
        "pending_commands": state.pending_commands.lock().len(),
    })))
}

async fn handle_chain_list(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let blocks = state.chain.list().map_err(|err| http_error::reject(warp::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(warp::reply::json(&blocks))
}

#[derive(Deserialize)]
struct SendTextQuery {
    to: String,
}

async fn handle_mix_send_text(query: SendTextQuery, body: bytes::Bytes, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let destination = NodeId(query.to);
    let path = mix::select_path(&state.directory, &state.identity.node_id(), &destination, state.node_config.max_onion_path_len)
        .map_err(mix_error)?;

    let msg_id = fresh_msg_id();
    let sealed = mix::seal_text(&body, &mix::text_key(&state.beacon_key)).map_err(mix_error)?;
    let envelope = mix::FinalEnvelope {
        kind: mix::FinalEnvelopeKind::Text,
        sender_id: state.identity.node_id(),
        receiver_id: destination,
        msg_id: msg_id.clone(),
        name: None,
        data_b64: STANDARD.encode(&sealed),
    };

    let ttl = path.len() as u8;
    let packet = mix::build_onion(&path, &envelope, ttl).map_err(mix_error)?;
    let first_hop = path[0].address;

    let client = reqwest::Client::new();
    let url = format!("http://{first_hop}/mix/relay");
    if let Err(err) = client.post(&url).json(&packet).send().await {
        tracing::warn!(error = %err, hop = %first_hop, "failed to send onion packet to first hop");
        return Err(http_error::reject(warp::http::StatusCode::BAD_GATEWAY, "first hop unreachable"));
    }

    Ok(warp::reply::json(&serde_json::json!({ "status": "sent", "msg_id": msg_id, "hops": path.len() })))
}

#[derive(Deserialize)]
struct SendFileQuery {
    name: String,
}

async fn handle_mix_send_file(query: SendFileQuery, body: bytes::Bytes, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    match state.replication.originate(&query.name, &body).await {
        Ok(outcome) => Ok(warp::reply::json(&serde_json::json!({
            "hash": outcome.hash_hex,
            "store_key": outcome.store_key,
            "fanout": outcome.fanout,
        }))),
        Err(err) => Err(replication_error(err)),
    }
}

#[derive(Deserialize)]
struct DecryptQuery {
    hash: String,
    name: Option<String>,
    #[serde(rename = "keyB64")]
    key_b64: Option<String>,
    out: Option<String>,
}

async fn handle_chunks_decrypt(query: DecryptQuery, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let out_path = query.out.as_ref().map(PathBuf::from);
    let plaintext = state
        .replication
        .decrypt(&query.hash, query.name.as_deref(), query.key_b64.as_deref(), out_path.as_deref())
        .map_err(replication_error)?;

    if out_path.is_some() {
        Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "status": "ok", "bytes": plaintext.len() })),
            warp::http::StatusCode::OK,
        )
        .into_response())
    } else {
        Ok(warp::reply::with_header(plaintext, "content-type", "application/octet-stream").into_response())
    }
}

#[derive(Deserialize)]
struct BackupGetQuery {
    key: String,
}

async fn handle_backup_get(query: BackupGetQuery, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    match state.cache.get(&query.key) {
        Some(bytes) => Ok(warp::reply::with_header(bytes, "content-type", "application/octet-stream")),
        None => Err(http_error::reject(warp::http::StatusCode::NOT_FOUND, "unknown key")),
    }
}

const PEER_SNAPSHOT_CACHE_KEY: &str = "peer-directory-snapshot";

async fn handle_peers_save(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    state
        .directory
        .seal_to(&state.peers_snapshot_path(), &state.file_key)
        .map_err(http_error::peer_directory_error)?;
    Ok(warp::reply::json(&serde_json::json!({ "status": "ok" })))
}

async fn handle_peers_load(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let loaded = meshvault_core::PeerDirectory::load_from(&state.peers_snapshot_path(), &state.file_key);
    let merged = state.directory.merge(&loaded.list());
    Ok(warp::reply::json(&serde_json::json!({ "status": "ok", "merged": merged })))
}

/// Publish the current directory as an encrypted snapshot under a
/// well-known cache key, fetchable by other peers via `GET /fetch`.
async fn handle_peers_publish(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let snapshot = state.directory.list();
    let json = serde_json::to_vec(&snapshot).map_err(|_| http_error::reject(warp::http::StatusCode::INTERNAL_SERVER_ERROR, "serialize failed"))?;
    state.cache.put(PEER_SNAPSHOT_CACHE_KEY, json);
    Ok(warp::reply::json(&serde_json::json!({ "status": "ok", "count": snapshot.len() })))
}

#[derive(Deserialize)]
struct PeersFetchQuery {
    addr: String,
}

async fn handle_peers_fetch(query: PeersFetchQuery, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let client = reqwest::Client::new();
    let url = format!("http://{}/fetch?key={PEER_SNAPSHOT_CACHE_KEY}", query.addr);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|_| http_error::reject(warp::http::StatusCode::BAD_GATEWAY, "peer unreachable"))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|_| http_error::reject(warp::http::StatusCode::BAD_GATEWAY, "peer response unreadable"))?;
    let snapshot: Vec<meshvault_core::PeerRecord> =
        serde_json::from_slice(&bytes).map_err(|_| http_error::reject(warp::http::StatusCode::BAD_GATEWAY, "malformed peer snapshot"))?;
    let merged = state.directory.merge(&snapshot);
    Ok(warp::reply::json(&serde_json::json!({ "status": "ok", "merged": merged })))
}

#[derive(Deserialize)]
struct CommandBroadcastRequest {
    #[serde(rename = "type")]
    kind: CommandKind,
    folder_path: String,
    #[serde(default)]
    recursive: bool,
}

async fn handle_command_broadcast(request: CommandBroadcastRequest, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let command = state.commands.broadcast(request.kind, request.folder_path, request.recursive).await;
    Ok(warp::reply::json(&serde_json::json!({ "status": "ok", "msg_id": command.msg_id })))
}

async fn handle_command_pending(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&state.drain_pending_commands()))
}

async fn handle_env_export(state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&state.node_config))
}

pub async fn run(state: Arc<AppState>, port: u16, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    let bind: SocketAddr = (std::net::Ipv4Addr::LOCALHOST, port).into();

    let status_route = warp::path("status").and(warp::get()).and(with_state(state.clone())).and_then(handle_status).boxed();
    let peers_route = warp::path("peers").and(warp::get()).and(with_state(state.clone())).and_then(handle_peers).boxed();
    let sync_status_route = warp::path!("sync" / "status")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_sync_status)
        .boxed();
    let chain_list_route = warp::path!("chain" / "list")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_chain_list)
        .boxed();
    let send_text_route = warp::path!("mix" / "send-text")
        .and(warp::post())
        .and(warp::query::<SendTextQuery>())
        .and(warp::body::content_length_limit(1024 * 1024))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(handle_mix_send_text)
        .boxed();
    let send_file_route = warp::path!("mix" / "send-file")
        .and(warp::post())
        .and(warp::query::<SendFileQuery>())
        .and(warp::body::content_length_limit(64 * 1024 * 1024))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(handle_mix_send_file)
        .boxed();
    let decrypt_route = warp::path!("chunks" / "decrypt")
        .and(warp::get())
        .and(warp::query::<DecryptQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_chunks_decrypt)
        .boxed();
    let backup_get_route = warp::path!("backup" / "get")
        .and(warp::get())
        .and(warp::query::<BackupGetQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_backup_get)
        .boxed();
    let peers_save_route = warp::path!("peers" / "save")
        .and(warp::post().or(warp::get()).unify())
        .and(with_state(state.clone()))
        .and_then(handle_peers_save)
        .boxed();
    let peers_load_route = warp::path!("peers" / "load")
        .and(warp::post().or(warp::get()).unify())
        .and(with_state(state.clone()))
        .and_then(handle_peers_load)
        .boxed();
    let peers_publish_route = warp::path!("peers" / "publish")
        .and(warp::post().or(warp::get()).unify())
        .and(with_state(state.clone()))
        .and_then(handle_peers_publish)
        .boxed();
    let peers_fetch_route = warp::path!("peers" / "fetch")
        .and(warp::post().or(warp::get()).unify())
        .and(warp::query::<PeersFetchQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_peers_fetch)
        .boxed();
    let command_broadcast_route = warp::path!("command" / "broadcast")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_command_broadcast)
        .boxed();
    let command_pending_route = warp::path!("command" / "pending")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_command_pending)
        .boxed();
    let env_export_route = warp::path!("env" / "export")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_env_export)
        .boxed();

    let dispatch = status_route
        .or(peers_route)
        .or(sync_status_route)
        .or(chain_list_route)
        .or(send_text_route)
        .or(send_file_route)
        .or(decrypt_route)
        .or(backup_get_route)
        .or(peers_save_route)
        .or(peers_load_route)
        .or(peers_publish_route)
        .or(peers_fetch_route)
        .or(command_broadcast_route)
        .or(command_pending_route)
        .or(env_export_route)
        .boxed();

    // `loopback_only` runs ahead of every route so a non-loopback remote
    // is rejected before any handler (and its side effects) runs.
    let routes = loopback_only().and(dispatch).recover(handle_rejection).boxed();

    tokio::net::TcpListener::bind(bind).await?;

    let make_svc = hyper::service::make_service_fn(move |_conn| {
        let routes = routes.clone();
        async move { Ok::<_, Infallible>(warp::service(routes)) }
    });

    tracing::info!(%bind, "loopback HTTP surface listening");
    let server = hyper::Server::bind(&bind)
        .http1_header_read_timeout(READ_HEADER_TIMEOUT)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });
    if std::panic::AssertUnwindSafe(server).catch_unwind().await.map_or(true, |r| r.is_err()) {
        tracing::error!("loopback HTTP surface panicked or exited with an error");
    }
    Ok(())
}
