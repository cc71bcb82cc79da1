//! Shared HTTP error plumbing for both surfaces, grounded in the
//! escrow binary's `warp::reject::Reject` + `recover` pattern, generalized
//! to the error taxonomy of `spec.md` §7 (`ChainMismatch` carries both
//! tips, everything else is a flat status + message).

use std::convert::Infallible;

use meshvault_core::{MixError, PeerDirectoryError, ReplicationError};
use serde::Serialize;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl warp::reject::Reject for ApiError {}

pub fn reject(status: StatusCode, message: impl Into<String>) -> Rejection {
    warp::reject::custom(ApiError {
        status,
        body: serde_json::json!({ "status": "error", "message": message.into() }),
    })
}

/// Loopback-only endpoint reached from a non-loopback remote address.
pub fn forbidden_remote() -> Rejection {
    reject(StatusCode::FORBIDDEN, "this endpoint only accepts loopback connections")
}

pub fn replication_error(err: ReplicationError) -> Rejection {
    match err {
        ReplicationError::ChainMismatch { expected, actual } => warp::reject::custom(ApiError {
            status: StatusCode::CONFLICT,
            body: serde_json::json!({ "status": "chain_mismatch", "expected_tip": expected, "actual_tip": actual }),
        }),
        ReplicationError::NotFound(key) => reject(StatusCode::NOT_FOUND, format!("not found: {key}")),
        ReplicationError::HashMismatch { .. } | ReplicationError::BadCipher | ReplicationError::DecryptionFailed => {
            reject(StatusCode::BAD_REQUEST, err.to_string())
        }
        ReplicationError::Io(_) | ReplicationError::Chain(_) => reject(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub fn mix_error(err: MixError) -> Rejection {
    match err {
        MixError::Forbidden | MixError::TtlExpired => reject(StatusCode::FORBIDDEN, err.to_string()),
        MixError::UnknownDestination | MixError::EmptyPath | MixError::BadFormat => {
            reject(StatusCode::BAD_REQUEST, err.to_string())
        }
        MixError::BadGateway => reject(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

pub fn peer_directory_error(err: PeerDirectoryError) -> Rejection {
    reject(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[derive(Serialize)]
struct ErrorBody {
    status: String,
    message: String,
}

pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(api_err) = rejection.find::<ApiError>() {
        return Ok(warp::reply::with_status(warp::reply::json(&api_err.body), api_err.status));
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if rejection.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        (StatusCode::BAD_REQUEST, "malformed request body".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody { status: "error".to_string(), message }),
        status,
    ))
}
