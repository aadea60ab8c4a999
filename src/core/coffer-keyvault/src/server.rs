//! REST surface of a [`LocalKeyVault`].
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET | `/keys/{name}[/{version}]` | describe key |
//! | POST | `/keys/{name}[/{version}]/wrapkey` | wrap |
//! | POST | `/keys/{name}[/{version}]/unwrapkey` | unwrap |
//! | POST | `/keys/{name}[/{version}]/sign` | sign |
//! | POST | `/keys/{name}[/{version}]/verify` | verify |

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::client::{KeyVaultClient, KeyVaultKey, KeyWrapAlgorithm};
use crate::error::KeyVaultError;
use crate::local::LocalKeyVault;
use crate::uri::KeyUri;
use crate::wire::{
    self, ErrorDetail, ErrorResponse, KeyOperationRequest, KeyOperationResponse, VerifyRequest,
    VerifyResponse, AUTHORIZATION,
};

#[derive(Clone)]
struct ServerState {
    vault: Arc<LocalKeyVault>,
    token: Option<String>,
}

/// Builds the router. When `token` is set, requests must carry
/// `Authorization: Bearer {token}`.
pub fn router(vault: Arc<LocalKeyVault>, token: Option<String>) -> Router {
    Router::new()
        .route("/keys/{name}", get(get_key))
        .route("/keys/{name}/{version}", get(get_key))
        .route("/keys/{name}/wrapkey", post(wrap_key))
        .route("/keys/{name}/{version}/wrapkey", post(wrap_key))
        .route("/keys/{name}/unwrapkey", post(unwrap_key))
        .route("/keys/{name}/{version}/unwrapkey", post(unwrap_key))
        .route("/keys/{name}/sign", post(sign))
        .route("/keys/{name}/{version}/sign", post(sign))
        .route("/keys/{name}/verify", post(verify))
        .route("/keys/{name}/{version}/verify", post(verify))
        .layer(TraceLayer::new_for_http())
        .with_state(ServerState { vault, token })
}

// ============================================================================
// Errors
// ============================================================================

struct ApiError(KeyVaultError);

impl From<KeyVaultError> for ApiError {
    fn from(err: KeyVaultError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            KeyVaultError::KeyNotFound(_) | KeyVaultError::InvalidKeyUri(_) => {
                (StatusCode::NOT_FOUND, "KeyNotFound")
            }
            KeyVaultError::AuthenticationFailure(_) => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            KeyVaultError::KeyDisabled(_) => (StatusCode::FORBIDDEN, "KeyDisabled"),
            KeyVaultError::UnsupportedAlgorithm { .. } => {
                (StatusCode::BAD_REQUEST, "UnsupportedAlgorithm")
            }
            KeyVaultError::WrapUnwrapFailure(_) | KeyVaultError::InvalidKeyName(_) => {
                (StatusCode::BAD_REQUEST, "BadParameter")
            }
            KeyVaultError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        if status.is_server_error() {
            warn!(error = %self.0, "Key vault request failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn authorize(state: &ServerState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.token else {
        return Ok(());
    };

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| KeyVaultError::AuthenticationFailure("missing bearer token".into()))?;

    if provided != expected {
        return Err(KeyVaultError::AuthenticationFailure("invalid bearer token".into()).into());
    }
    Ok(())
}

fn key_uri(state: &ServerState, params: &HashMap<String, String>) -> Result<KeyUri, ApiError> {
    let name = params
        .get("name")
        .ok_or_else(|| KeyVaultError::InvalidKeyUri("missing key name".into()))?;
    Ok(KeyUri::new(
        state.vault.vault_url(),
        name.clone(),
        params.get("version").cloned(),
    ))
}

async fn get_key(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<KeyVaultKey>, ApiError> {
    authorize(&state, &headers)?;
    let uri = key_uri(&state, &params)?;
    Ok(Json(state.vault.get_key(&uri).await?))
}

async fn wrap_key(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Json(req): Json<KeyOperationRequest>,
) -> Result<Json<KeyOperationResponse>, ApiError> {
    authorize(&state, &headers)?;
    let uri = key_uri(&state, &params)?;
    let algorithm: KeyWrapAlgorithm = req.alg.parse()?;
    let key = wire::decode(&req.value)?;

    let result = state.vault.wrap_key(&uri, algorithm, &key).await?;
    Ok(Json(KeyOperationResponse {
        kid: result.kid,
        value: wire::encode(&result.wrapped_key),
    }))
}

async fn unwrap_key(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Json(req): Json<KeyOperationRequest>,
) -> Result<Json<KeyOperationResponse>, ApiError> {
    authorize(&state, &headers)?;
    let uri = key_uri(&state, &params)?;
    let algorithm: KeyWrapAlgorithm = req.alg.parse()?;
    let wrapped = wire::decode(&req.value)?;

    let result = state.vault.unwrap_key(&uri, algorithm, &wrapped).await?;
    Ok(Json(KeyOperationResponse {
        kid: result.kid,
        value: wire::encode(&result.key),
    }))
}

async fn sign(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Json(req): Json<KeyOperationRequest>,
) -> Result<Json<KeyOperationResponse>, ApiError> {
    authorize(&state, &headers)?;
    let uri = key_uri(&state, &params)?;
    let data = wire::decode(&req.value)?;

    let result = state.vault.sign(&uri, &data).await?;
    Ok(Json(KeyOperationResponse {
        kid: result.kid,
        value: wire::encode(&result.signature),
    }))
}

async fn verify(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(params): Path<HashMap<String, String>>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    authorize(&state, &headers)?;
    let uri = key_uri(&state, &params)?;
    let data = wire::decode(&req.digest)?;
    let signature = wire::decode(&req.value)?;

    let value = state.vault.verify(&uri, &data, &signature).await?;
    Ok(Json(VerifyResponse { value }))
}
