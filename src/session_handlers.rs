//! HTTP surface of the wallet session subsystem.
//!
//! Challenge issuance, challenge verification (which mints the first token pair),
//! session introspection, and refresh rotation. Session identity produced here is
//! what the payment gate later uses to bind a caller's payer address to their
//! owner identity before any payment logic runs.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::challenge::ChallengeIssuer;
use crate::session::{AuthError, TokenIssuer, authenticate_challenge};
use crate::types::{ErrorBody, EvmAddress, UnixTimestamp};

/// Shared state of the session surface.
pub struct SessionState {
    pub challenges: Arc<ChallengeIssuer>,
    pub tokens: Arc<TokenIssuer>,
}

/// Assembles the session router.
pub fn routes(state: Arc<SessionState>) -> Router {
    Router::new()
        .route("/v2/session/challenge", post(post_challenge))
        .route("/v2/session/verify", post(post_verify_challenge))
        .route("/v2/session", get(get_session))
        .route("/v2/session/refresh", post(post_refresh))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeRequest {
    domain: String,
    uri: String,
    chain_id: u64,
    owner_address: EvmAddress,
    #[serde(default)]
    agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeResponse {
    challenge_id: String,
    nonce: String,
    message: String,
    expires_at: UnixTimestamp,
    owner_address: EvmAddress,
    agent_id: String,
}

/// `POST /v2/session/challenge`: issues a fresh wallet sign-in challenge.
#[instrument(skip_all, fields(owner = %body.owner_address))]
async fn post_challenge(
    State(state): State<Arc<SessionState>>,
    Json(body): Json<ChallengeRequest>,
) -> impl IntoResponse {
    let record = state.challenges.create_challenge(
        &body.domain,
        &body.uri,
        body.chain_id,
        body.owner_address,
        body.agent_id.as_deref(),
    );
    Json(ChallengeResponse {
        challenge_id: record.id,
        nonce: record.nonce,
        message: record.message,
        expires_at: record.expires_at,
        owner_address: record.owner_address,
        agent_id: record.agent_id,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyChallengeRequest {
    challenge_id: String,
    message: String,
    signature: String,
    #[serde(default)]
    owner_address: Option<EvmAddress>,
}

/// `POST /v2/session/verify`: consumes a challenge and mints a token pair.
///
/// Consumption happens before any other check, so a failed signature still burns
/// the challenge.
#[instrument(skip_all)]
async fn post_verify_challenge(
    State(state): State<Arc<SessionState>>,
    Json(body): Json<VerifyChallengeRequest>,
) -> impl IntoResponse {
    let Some(record) = state.challenges.consume_challenge(&body.challenge_id) else {
        return auth_error_response(&AuthError::InvalidChallenge).into_response();
    };
    if let Some(owner) = body.owner_address {
        if owner != record.owner_address {
            return auth_error_response(&AuthError::InvalidChallenge).into_response();
        }
    }
    if let Err(error) = authenticate_challenge(&record, &body.message, &body.signature) {
        return auth_error_response(&error).into_response();
    }
    match state
        .tokens
        .issue_token_pair(record.owner_address, &record.agent_id)
    {
        Ok(pair) => {
            tracing::info!(owner = %record.owner_address, agent_id = %record.agent_id, "session established");
            (StatusCode::OK, Json(pair)).into_response()
        }
        Err(error) => auth_error_response(&error).into_response(),
    }
}

/// `GET /v2/session`: returns the identity claims of a bearer access token.
#[instrument(skip_all)]
async fn get_session(
    State(state): State<Arc<SessionState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return auth_error_response(&AuthError::InvalidToken).into_response();
    };
    match state.tokens.verify_access_token(token) {
        Ok(claims) => (StatusCode::OK, Json(claims)).into_response(),
        Err(error) => auth_error_response(&error).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

/// `POST /v2/session/refresh`: rotates a refresh token into a new pair.
#[instrument(skip_all)]
async fn post_refresh(
    State(state): State<Arc<SessionState>>,
    Json(body): Json<RefreshRequest>,
) -> impl IntoResponse {
    match state.tokens.rotate_refresh_token(&body.refresh_token) {
        Ok(pair) => (StatusCode::OK, Json(pair)).into_response(),
        Err(error) => auth_error_response(&error).into_response(),
    }
}

/// Extracts the token from an `Authorization: Bearer …` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn auth_error_response(error: &AuthError) -> (StatusCode, Json<ErrorBody>) {
    let status = match error {
        AuthError::Minting(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNAUTHORIZED,
    };
    tracing::warn!(status = %status, code = error.code(), "session request rejected");
    (status, Json(ErrorBody::new(error.code(), error.to_string())))
}
