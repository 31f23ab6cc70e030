//! HTTP endpoints implemented by the payment **facilitator**.
//!
//! These are the server-side handlers for processing client-submitted x402
//! payments: discovery (`/health`, `/v2/supported`) and the protocol-critical
//! `/v2/verify` and `/v2/settle`. This module owns the error-to-status mapping:
//!
//! - normalizer failures are caller faults → 400 with the normalizer's code;
//! - a rejected simulation on `/v2/verify` → 400, on `/v2/settle` → 402 (payment
//!   is still required, the caller must obtain fresh evidence);
//! - fatal configuration errors (missing key, wrong chain) → 500.
//!
//! Every rejection is logged with enough detail for operational triage, never
//! with signing material.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::instrument;

use crate::normalizer::{NormalizeError, PaymentRequestBody, normalize};
use crate::probe::CapabilityProbe;
use crate::settlement::{SettlementClient, SettlementError};
use crate::types::{
    ErrorBody, Network, Scheme, SettleSuccess, SupportedPaymentKind, SupportedResponse,
    VerifySuccess, X402Version,
};

/// Shared state of the facilitator surface.
pub struct FacilitatorState {
    pub settlement: Arc<dyn SettlementClient>,
    pub probe: Arc<CapabilityProbe>,
}

/// Assembles the facilitator router.
pub fn routes(state: Arc<FacilitatorState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/v2/supported", get(get_supported))
        .route("/v2/verify", post(post_verify))
        .route("/v2/settle", post(post_settle))
        .with_state(state)
}

/// `GET /health`: capability probe report for the payment backend.
#[instrument(skip_all)]
async fn get_health(State(state): State<Arc<FacilitatorState>>) -> impl IntoResponse {
    let report = state.probe.report().await;
    Json(report)
}

/// `GET /v2/supported`: lists the payment kinds this facilitator accepts.
#[instrument(skip_all)]
async fn get_supported() -> impl IntoResponse {
    let kinds = Network::variants()
        .iter()
        .map(|network| SupportedPaymentKind {
            x402_version: X402Version::V1,
            scheme: Scheme::GokiteAa,
            network: *network,
        })
        .collect();
    Json(SupportedResponse { kinds })
}

/// `POST /v2/verify`: normalize and simulate, never mutating chain state.
#[instrument(skip_all)]
async fn post_verify(
    State(state): State<Arc<FacilitatorState>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let body = match parse_body(body) {
        Ok(body) => body,
        Err(response) => return response.into_response(),
    };
    let request = match normalize(&body) {
        Ok(request) => request,
        Err(error) => return normalize_error_response(&error).into_response(),
    };

    match state.settlement.simulate(&request).await {
        Ok(()) => (StatusCode::OK, Json(VerifySuccess::new(&request))).into_response(),
        Err(error) => {
            let status = if error.is_fatal() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            };
            tracing::warn!(
                status = %status,
                code = error.code(),
                payment_request_id = %request.payment_request_id,
                error = %error,
                "verification rejected"
            );
            (status, Json(ErrorBody::new(error.code(), error.to_string()))).into_response()
        }
    }
}

/// `POST /v2/settle`: normalize, simulate, then settle. Settlement is only ever
/// attempted after the simulation in this same handler passed.
#[instrument(skip_all)]
async fn post_settle(
    State(state): State<Arc<FacilitatorState>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let body = match parse_body(body) {
        Ok(body) => body,
        Err(response) => return response.into_response(),
    };
    let request = match normalize(&body) {
        Ok(request) => request,
        Err(error) => return normalize_error_response(&error).into_response(),
    };

    if let Err(error) = state.settlement.simulate(&request).await {
        return settle_error_response(&request.payment_request_id, &error).into_response();
    }
    match state.settlement.settle(&request).await {
        Ok(tx_hash) => {
            tracing::info!(
                payment_request_id = %request.payment_request_id,
                tx_hash = %tx_hash,
                "payment settled"
            );
            (StatusCode::OK, Json(SettleSuccess::new(&request, tx_hash))).into_response()
        }
        Err(error) => settle_error_response(&request.payment_request_id, &error).into_response(),
    }
}

fn parse_body(
    body: serde_json::Value,
) -> Result<PaymentRequestBody, (StatusCode, Json<ErrorBody>)> {
    serde_json::from_value(body).map_err(|e| {
        tracing::warn!(status = 400, code = "invalid_request", error = %e, "unparseable request body");
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("invalid_request", e.to_string())),
        )
    })
}

fn normalize_error_response(error: &NormalizeError) -> (StatusCode, Json<ErrorBody>) {
    let code = error.code();
    tracing::warn!(
        status = 400,
        code = %code,
        details = ?error.details(),
        "payload failed normalization"
    );
    let mut body = ErrorBody::new(code, error.to_string());
    if let Some(details) = error.details() {
        body = body.with_details(details);
    }
    (StatusCode::BAD_REQUEST, Json(body))
}

/// Error mapping for the settle path: payment failures keep the 402 contract,
/// operator faults become 500.
fn settle_error_response(
    payment_request_id: &str,
    error: &SettlementError,
) -> (StatusCode, Json<ErrorBody>) {
    let status = if error.is_fatal() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::PAYMENT_REQUIRED
    };
    tracing::warn!(
        status = %status,
        code = error.code(),
        payment_request_id = %payment_request_id,
        error = %error,
        "settlement rejected"
    );
    (status, Json(ErrorBody::new(error.code(), error.to_string())))
}
