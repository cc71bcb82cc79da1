//! Peer-facing HTTP surface — bound to the selected interface, default
//! port 8080 (`spec.md` §4.7). Filter composition follows the teacher's
//! `cli/src/server.rs` (`warp::any().map(move || ctx.clone())` state
//! injection, `.and_then` handlers, `.or()`-chained routes, pre-bind
//! check then `catch_unwind`-wrapped `run`).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::FutureExt;
use meshvault_core::command::SyncCommand;
use meshvault_core::{mix, ReplicationEnvelope};
use serde::Deserialize;
use warp::{Filter, Rejection, Reply};

use crate::http_error::{self, handle_rejection, mix_error, replication_error};
use crate::state::AppState;

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

fn with_state(state: Arc<AppState>) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

async fn handle_replicate(envelope: ReplicationEnvelope, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let from = envelope.origin_id.clone();
    match state.replication.admit(envelope, from).await {
        Ok(outcome) => Ok(warp::reply::json(&serde_json::json!({
            "status": match outcome {
                meshvault_core::AdmitOutcome::Seen => "seen",
                meshvault_core::AdmitOutcome::Accepted { .. } => "accepted",
            },
            "tip": state.chain.tip(),
        }))),
        Err(err) => Err(replication_error(err)),
    }
}

/// Forward the remainder of an onion packet to its next hop, after the
/// jitter delay the spec's mix relay plane requires at every intermediate
/// hop.
async fn forward_onion(next: std::net::SocketAddr, packet: mix::OnionPacket) {
    mix::jitter_sleep().await;
    let client = reqwest::Client::new();
    let url = format!("http://{next}/mix/relay");
    if let Err(err) = client.post(&url).json(&packet).send().await {
        tracing::warn!(error = %err, next = %next, "onion forward failed");
    }
}

async fn handle_mix_relay(packet: mix::OnionPacket, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let outcome = mix::relay(&packet, &state.identity.mix_secret).map_err(mix_error)?;
    match outcome {
        mix::RelayOutcome::Forward { next, packet } => {
            tokio::spawn(forward_onion(next, packet));
            Ok(warp::reply::json(&serde_json::json!({ "status": "forwarded" })))
        }
        mix::RelayOutcome::Delivered(envelope) => {
            let raw = STANDARD.decode(&envelope.data_b64).unwrap_or_default();
            match envelope.kind {
                mix::FinalEnvelopeKind::Text => {
                    let text_key = mix::text_key(&state.beacon_key);
                    match mix::open_text(&raw, &text_key) {
                        Ok(plaintext) => {
                            state.cache.put(&format!("text-{}", envelope.msg_id), plaintext);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, msg_id = %envelope.msg_id, "text envelope failed to open under pre-shared key, storing raw");
                            state.cache.put(&format!("mixmsg-{}", now_unix_millis()), raw);
                        }
                    }
                }
                mix::FinalEnvelopeKind::File => {
                    let key = format!(
                        "file-{}-{}",
                        envelope.msg_id,
                        envelope.name.clone().unwrap_or_default()
                    );
                    state.cache.put(&key, raw);
                }
            }
            state.events.send(meshvault_core::Event::OnionDelivered { msg_id: envelope.msg_id.clone() });
            Ok(warp::reply::json(&serde_json::json!({ "status": "delivered", "msg_id": envelope.msg_id })))
        }
        mix::RelayOutcome::DeliveredRaw(bytes) => {
            let key = format!("mixmsg-{}", now_unix_millis());
            state.cache.put(&key, bytes);
            Ok(warp::reply::json(&serde_json::json!({ "status": "delivered" })))
        }
    }
}

fn now_unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Deserialize)]
struct FetchQuery {
    key: String,
}

async fn handle_fetch(query: FetchQuery, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    match state.cache.get(&query.key) {
        Some(bytes) => Ok(warp::reply::with_header(bytes, "content-type", "application/octet-stream")),
        None => Err(http_error::reject(warp::http::StatusCode::NOT_FOUND, "unknown key")),
    }
}

#[derive(Deserialize)]
struct DhtPutRequest {
    key: String,
    value_b64: String,
}

async fn handle_dht_put(request: DhtPutRequest, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let value = STANDARD
        .decode(&request.value_b64)
        .map_err(|_| http_error::reject(warp::http::StatusCode::BAD_REQUEST, "value_b64 is not valid base64"))?;
    state.cache.put(&request.key, value);
    Ok(warp::reply::json(&serde_json::json!({ "status": "ok" })))
}

async fn handle_dht_get(query: FetchQuery, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    match state.cache.get(&query.key) {
        Some(bytes) => Ok(warp::reply::json(&serde_json::json!({ "value_b64": STANDARD.encode(bytes) }))),
        None => Err(http_error::reject(warp::http::StatusCode::NOT_FOUND, "unknown key")),
    }
}

async fn handle_p2p_command(command: SyncCommand, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let from = command.origin_node.clone();
    let outcome = state.commands.admit(command.clone(), &from);
    if matches!(outcome, meshvault_core::CommandAdmitOutcome::Accepted) {
        state.push_pending_command(command);
    }
    Ok(warp::reply::json(&serde_json::json!({
        "status": match outcome {
            meshvault_core::CommandAdmitOutcome::Seen => "seen",
            meshvault_core::CommandAdmitOutcome::Accepted => "accepted",
        }
    })))
}

pub async fn run(state: Arc<AppState>, bind: std::net::SocketAddr, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    let replicate_route = warp::path("replicate")
        .and(warp::post())
        .and(warp::body::content_length_limit(32 * 1024 * 1024))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_replicate)
        .boxed();

    let mix_relay_route = warp::path!("mix" / "relay")
        .and(warp::post())
        .and(warp::body::content_length_limit(8 * 1024 * 1024))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_mix_relay)
        .boxed();

    let fetch_route = warp::path("fetch")
        .and(warp::get())
        .and(warp::query::<FetchQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_fetch)
        .boxed();

    let dht_put_route = warp::path!("dht" / "put")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_dht_put)
        .boxed();

    let dht_get_route = warp::path!("dht" / "get")
        .and(warp::get())
        .and(warp::query::<FetchQuery>())
        .and(with_state(state.clone()))
        .and_then(handle_dht_get)
        .boxed();

    let command_route = warp::path!("p2p" / "command")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_p2p_command)
        .boxed();

    let routes = replicate_route
        .or(mix_relay_route)
        .or(fetch_route)
        .or(dht_put_route)
        .or(dht_get_route)
        .or(command_route)
        .recover(handle_rejection)
        .boxed();

    // Pre-bind check so a busy port fails loudly before hyper's own bind.
    tokio::net::TcpListener::bind(bind).await?;

    let make_svc = hyper::service::make_service_fn(move |_conn| {
        let routes = routes.clone();
        async move { Ok::<_, Infallible>(warp::service(routes)) }
    });

    tracing::info!(%bind, "peer-facing HTTP surface listening");
    let server = hyper::Server::bind(&bind)
        .http1_header_read_timeout(READ_HEADER_TIMEOUT)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });
    if std::panic::AssertUnwindSafe(server).catch_unwind().await.map_or(true, |r| r.is_err()) {
        tracing::error!("peer-facing HTTP surface panicked or exited with an error");
    }
    Ok(())
}
