//! Payment gate: tower middleware that prices arbitrary routes.
//!
//! Per request to a protected resource: missing payment evidence yields a fresh
//! `402 Payment Required` challenge (and a `requested` ledger entry); presented
//! evidence is normalized, bound against the caller's session identity, verified
//! (simulate), settled, recorded through the ledger lifecycle, and only then is
//! the protected handler invoked. A rejected payment answers 402 with a code
//! distinct from the fresh challenge, so callers can tell "pay first" apart from
//! "your payment was refused". The rejected path is also where replayed payments
//! land, since `simulate` fails against a consumed nonce.

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::challenge::{DEFAULT_AGENT_ID, random_hex};
use crate::clock::Clock;
use crate::ledger::{
    ActivityEvent, ActivityKind, IdentityLinks, PaymentLedger, PaymentLedgerEntry, PaymentState,
    SpendStatus,
};
use crate::normalizer::{decode_x_payment, normalize_value};
use crate::session::TokenIssuer;
use crate::session_handlers::bearer_token;
use crate::settlement::SettlementClient;
use crate::types::{
    ErrorBody, EvmAddress, Network, NormalizedPaymentRequest, PaymentRequired,
    PaymentRequirement, Scheme, SettleSuccess, TokenAmount, X402Version,
};

/// Header carrying payment evidence (any of the three supported encodings).
pub const PAYMENT_HEADER: &str = "X-Payment";
/// Correlation header echoing the `paymentRequestId` from the 402 challenge.
pub const PAYMENT_REQUEST_ID_HEADER: &str = "X-Payment-Request-Id";
/// Header attached to successful responses with the base64 settle receipt.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";

/// 402 code for a fresh challenge: no payment evidence was presented.
pub const CODE_PAYMENT_REQUIRED: &str = "PAYMENT_REQUIRED";
/// 402 code for rejected evidence: present but failing normalization or verify.
pub const CODE_PAYMENT_VERIFY_FAILED: &str = "PAYMENT_VERIFY_FAILED";
/// 402 code for a settlement failure after a passing verify.
pub const CODE_PAYMENT_SETTLE_FAILED: &str = "PAYMENT_SETTLE_FAILED";
/// 403 code for a payer not linked to the presented session identity.
pub const CODE_PAYER_MISMATCH: &str = "PAYER_MISMATCH";

/// Price of a gated route: the requirement template minus the per-challenge id.
#[derive(Debug, Clone)]
pub struct GatePricing {
    pub scheme: Scheme,
    pub network: Network,
    pub asset: EvmAddress,
    pub pay_to: EvmAddress,
    pub max_amount_required: TokenAmount,
}

impl GatePricing {
    fn requirement(&self, payment_request_id: String) -> PaymentRequirement {
        PaymentRequirement {
            scheme: self.scheme,
            network: self.network,
            asset: self.asset,
            pay_to: self.pay_to,
            max_amount_required: self.max_amount_required,
            payment_request_id,
        }
    }
}

/// Orchestrates the 402 flow for one priced route (or a family of them).
pub struct PaymentGate {
    settlement: Arc<dyn SettlementClient>,
    ledger: Arc<dyn PaymentLedger>,
    identity: Arc<dyn IdentityLinks>,
    tokens: Arc<TokenIssuer>,
    clock: Arc<dyn Clock>,
    pricing: GatePricing,
}

impl PaymentGate {
    pub fn new(
        settlement: Arc<dyn SettlementClient>,
        ledger: Arc<dyn PaymentLedger>,
        identity: Arc<dyn IdentityLinks>,
        tokens: Arc<TokenIssuer>,
        clock: Arc<dyn Clock>,
        pricing: GatePricing,
    ) -> Self {
        PaymentGate {
            settlement,
            ledger,
            identity,
            tokens,
            clock,
            pricing,
        }
    }

    /// Wraps this gate into a tower layer.
    pub fn into_layer(self) -> PaymentGateLayer {
        PaymentGateLayer {
            gate: Arc::new(self),
        }
    }

    async fn handle(
        &self,
        inner: BoxCloneSyncService<Request, Response, Infallible>,
        request: Request,
    ) -> Response {
        let evidence = request
            .headers()
            .get(PAYMENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        // Session identity is resolved up front; payment checks against it are
        // cheap and must run before anything touches the chain.
        let session = match self.resolve_session(&request) {
            Ok(session) => session,
            Err(response) => return response,
        };
        let agent_id = session
            .as_ref()
            .map(|s| s.agent_id.clone())
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string());

        match evidence {
            None => self.issue_challenge(&agent_id).await,
            Some(raw) => self.process_payment(inner, request, raw, session, agent_id).await,
        }
    }

    /// No evidence: mint a fresh requirement, record `requested`, answer 402.
    async fn issue_challenge(&self, agent_id: &str) -> Response {
        let payment_request_id = format!("pr-{}", random_hex(16));
        let now = self.clock.now();
        self.ledger
            .create_entry(PaymentLedgerEntry {
                payment_request_id: payment_request_id.clone(),
                agent_id: agent_id.to_string(),
                state: PaymentState::Requested,
                amount: self.pricing.max_amount_required,
                pay_to: self.pricing.pay_to,
                tx_hash: None,
                updated_at: now,
            })
            .await;
        self.ledger
            .record_activity(ActivityEvent {
                payment_request_id: payment_request_id.clone(),
                agent_id: agent_id.to_string(),
                kind: ActivityKind::PaymentRequested,
                at: now,
            })
            .await;
        tracing::debug!(payment_request_id = %payment_request_id, "payment challenge issued");

        let body = PaymentRequired {
            x402_version: X402Version::V1,
            code: CODE_PAYMENT_REQUIRED.to_string(),
            message: "Payment is required to access this resource".to_string(),
            payment_request_id: payment_request_id.clone(),
            accepts: vec![self.pricing.requirement(payment_request_id)],
        };
        (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
    }

    async fn process_payment(
        &self,
        mut inner: BoxCloneSyncService<Request, Response, Infallible>,
        request: Request,
        raw_evidence: String,
        session: Option<SessionIdentity>,
        agent_id: String,
    ) -> Response {
        let payment_request_id = request
            .headers()
            .get(PAYMENT_REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("pr-{}", random_hex(16)));
        self.ensure_entry(&payment_request_id, &agent_id).await;

        let payload_value = match decode_x_payment(&raw_evidence) {
            Ok(value) => value,
            Err(error) => {
                return self
                    .reject_payment(&payment_request_id, &agent_id, error.to_string())
                    .await;
            }
        };
        let requirement = self.pricing.requirement(payment_request_id.clone());
        let normalized = match normalize_value(&payload_value, &requirement) {
            Ok(normalized) => normalized,
            Err(error) => {
                return self
                    .reject_payment(&payment_request_id, &agent_id, error.to_string())
                    .await;
            }
        };

        if let Some(session) = &session {
            if let Some(response) = self.assert_payer_binding(session, &normalized).await {
                return response;
            }
        }

        if let Err(error) = self.settlement.simulate(&normalized).await {
            if error.is_fatal() {
                return fatal_response(error.code(), error.to_string());
            }
            return self
                .reject_payment(&payment_request_id, &agent_id, error.to_string())
                .await;
        }
        let now = self.clock.now();
        self.ledger
            .transition(&payment_request_id, PaymentState::Authorized, None, now)
            .await;
        self.ledger
            .record_activity(ActivityEvent {
                payment_request_id: payment_request_id.clone(),
                agent_id: agent_id.clone(),
                kind: ActivityKind::PaymentVerified,
                at: now,
            })
            .await;

        // Budget standing is advisory: an over-budget settlement is logged and
        // allowed to proceed.
        let spend = self
            .ledger
            .record_spend(&agent_id, normalized.max_amount_required)
            .await;
        if let SpendStatus::OverBudget { budget, spent } = spend {
            tracing::warn!(
                agent_id = %agent_id,
                budget = %budget,
                spent = %spent,
                "agent spend exceeds configured budget, settling anyway"
            );
        }

        let tx_hash = match self.settlement.settle(&normalized).await {
            Ok(tx_hash) => tx_hash,
            Err(error) => {
                if error.is_fatal() {
                    return fatal_response(error.code(), error.to_string());
                }
                let now = self.clock.now();
                self.ledger
                    .transition(&payment_request_id, PaymentState::Failed, None, now)
                    .await;
                self.ledger
                    .record_activity(ActivityEvent {
                        payment_request_id: payment_request_id.clone(),
                        agent_id: agent_id.clone(),
                        kind: ActivityKind::PaymentFailed,
                        at: now,
                    })
                    .await;
                tracing::warn!(
                    payment_request_id = %payment_request_id,
                    error = %error,
                    "settlement failed after successful verify"
                );
                return self.payment_rejected(CODE_PAYMENT_SETTLE_FAILED, error.to_string());
            }
        };

        let now = self.clock.now();
        self.ledger
            .transition(
                &payment_request_id,
                PaymentState::Settled,
                Some(tx_hash.clone()),
                now,
            )
            .await;
        self.ledger
            .record_activity(ActivityEvent {
                payment_request_id: payment_request_id.clone(),
                agent_id,
                kind: ActivityKind::PaymentSettled,
                at: now,
            })
            .await;
        tracing::info!(payment_request_id = %payment_request_id, tx_hash = %tx_hash, "payment settled, serving resource");

        let mut response = match inner.call(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };
        if let Ok(receipt) = settle_receipt_header(&normalized, tx_hash) {
            response
                .headers_mut()
                .insert(PAYMENT_RESPONSE_HEADER, receipt);
        }
        response
    }

    /// Resolves the bearer session, if one is presented.
    fn resolve_session(&self, request: &Request) -> Result<Option<SessionIdentity>, Response> {
        let Some(token) = bearer_token(request.headers()) else {
            return Ok(None);
        };
        let claims = self.tokens.verify_access_token(token).map_err(|error| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody::new(error.code(), error.to_string())),
            )
                .into_response()
        })?;
        let owner = claims.sub.parse::<EvmAddress>().map_err(|_| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody::new("INVALID_TOKEN", "Invalid access token")),
            )
                .into_response()
        })?;
        Ok(Some(SessionIdentity {
            owner,
            agent_id: claims.agent_id,
        }))
    }

    /// The payer embedded in the payload must be the payer linked to the session
    /// owner. Runs before any chain interaction.
    async fn assert_payer_binding(
        &self,
        session: &SessionIdentity,
        normalized: &NormalizedPaymentRequest,
    ) -> Option<Response> {
        let linked = self.identity.payer_for_owner(&session.owner).await?;
        if linked == normalized.authorization.from {
            return None;
        }
        tracing::warn!(
            owner = %session.owner,
            linked = %linked,
            payer = %normalized.authorization.from,
            "payment payer does not match session identity"
        );
        Some(
            (
                StatusCode::FORBIDDEN,
                Json(ErrorBody::new(
                    CODE_PAYER_MISMATCH,
                    "Payment payer is not linked to the presented session",
                )),
            )
                .into_response(),
        )
    }

    /// Creates the `requested` row when a caller correlates against an id this
    /// instance has never seen (another instance may have issued it).
    async fn ensure_entry(&self, payment_request_id: &str, agent_id: &str) {
        if self.ledger.entry(payment_request_id).await.is_some() {
            return;
        }
        self.ledger
            .create_entry(PaymentLedgerEntry {
                payment_request_id: payment_request_id.to_string(),
                agent_id: agent_id.to_string(),
                state: PaymentState::Requested,
                amount: self.pricing.max_amount_required,
                pay_to: self.pricing.pay_to,
                tx_hash: None,
                updated_at: self.clock.now(),
            })
            .await;
    }

    /// Records the failed transition and answers 402 with the rejected-payment code.
    async fn reject_payment(
        &self,
        payment_request_id: &str,
        agent_id: &str,
        reason: String,
    ) -> Response {
        let now = self.clock.now();
        self.ledger
            .transition(payment_request_id, PaymentState::Failed, None, now)
            .await;
        self.ledger
            .record_activity(ActivityEvent {
                payment_request_id: payment_request_id.to_string(),
                agent_id: agent_id.to_string(),
                kind: ActivityKind::PaymentFailed,
                at: now,
            })
            .await;
        tracing::warn!(
            payment_request_id = %payment_request_id,
            reason = %reason,
            "payment evidence rejected"
        );
        self.payment_rejected(CODE_PAYMENT_VERIFY_FAILED, reason)
    }

    /// 402 with a rejection code and a fresh challenge the caller can satisfy.
    fn payment_rejected(&self, code: &str, message: String) -> Response {
        let payment_request_id = format!("pr-{}", random_hex(16));
        let body = PaymentRequired {
            x402_version: X402Version::V1,
            code: code.to_string(),
            message,
            payment_request_id: payment_request_id.clone(),
            accepts: vec![self.pricing.requirement(payment_request_id)],
        };
        (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
    }
}

struct SessionIdentity {
    owner: EvmAddress,
    agent_id: String,
}

fn fatal_response(code: &str, message: String) -> Response {
    tracing::error!(code = %code, message = %message, "fatal settlement configuration error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new(code, message)),
    )
        .into_response()
}

/// Base64 settle receipt attached to the successful response.
fn settle_receipt_header(
    normalized: &NormalizedPaymentRequest,
    tx_hash: String,
) -> Result<HeaderValue, axum::http::header::InvalidHeaderValue> {
    let receipt = SettleSuccess::new(normalized, tx_hash);
    let json = serde_json::to_vec(&receipt).unwrap_or_default();
    HeaderValue::from_str(&b64.encode(json))
}

/// Tower layer wrapping routes in a [`PaymentGate`].
#[derive(Clone)]
pub struct PaymentGateLayer {
    gate: Arc<PaymentGate>,
}

impl<S> Layer<S> for PaymentGateLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = PaymentGateService;

    fn layer(&self, inner: S) -> Self::Service {
        PaymentGateService {
            gate: self.gate.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Service produced by [`PaymentGateLayer`].
#[derive(Clone)]
pub struct PaymentGateService {
    gate: Arc<PaymentGate>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl Service<Request> for PaymentGateService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let gate = self.gate.clone();
        let inner = self.inner.clone();
        Box::pin(async move { Ok(gate.handle(inner, request).await) })
    }
}
