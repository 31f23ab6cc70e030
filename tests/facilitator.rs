//! Facilitator HTTP surface: verify/settle protocol behavior end to end.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;

use async_trait::async_trait;
use x402_aa::clock::ManualClock;
use x402_aa::handlers::{FacilitatorState, routes};
use x402_aa::probe::CapabilityProbe;
use x402_aa::settlement::{
    DemoSettlement, SettlementClient, SettlementError, SettlementMode,
};
use x402_aa::types::NormalizedPaymentRequest;

/// Settlement stub that consumes nonces on settle, fails simulation on replayed
/// nonces, and counts calls so ordering invariants can be asserted.
struct NonceTrackingSettlement {
    consumed: Mutex<HashSet<[u8; 32]>>,
    simulate_calls: AtomicUsize,
    settle_calls: AtomicUsize,
}

impl NonceTrackingSettlement {
    fn new() -> Self {
        NonceTrackingSettlement {
            consumed: Mutex::new(HashSet::new()),
            simulate_calls: AtomicUsize::new(0),
            settle_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SettlementClient for NonceTrackingSettlement {
    fn mode(&self) -> SettlementMode {
        SettlementMode::Demo
    }

    fn configured(&self) -> bool {
        true
    }

    async fn simulate(&self, request: &NormalizedPaymentRequest) -> Result<(), SettlementError> {
        self.simulate_calls.fetch_add(1, Ordering::SeqCst);
        let consumed = self.consumed.lock().unwrap();
        if consumed.contains(&request.authorization.nonce.0) {
            return Err(SettlementError::SimulationFailed(
                "authorization rejected by wallet".to_string(),
            ));
        }
        Ok(())
    }

    async fn settle(
        &self,
        request: &NormalizedPaymentRequest,
    ) -> Result<String, SettlementError> {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        self.consumed
            .lock()
            .unwrap()
            .insert(request.authorization.nonce.0);
        Ok(format!("0x{}", "ab".repeat(32)))
    }

    async fn reachability(&self) -> Result<(), SettlementError> {
        Ok(())
    }
}

fn demo_app() -> Router {
    let clock = ManualClock::at(1_700_000_000);
    let settlement: Arc<dyn SettlementClient> = Arc::new(DemoSettlement::new(clock));
    let probe = Arc::new(CapabilityProbe::new(
        settlement.clone(),
        Duration::from_secs(30),
    ));
    routes(Arc::new(FacilitatorState { settlement, probe }))
}

fn tracking_app() -> (Router, Arc<NonceTrackingSettlement>) {
    let tracking = Arc::new(NonceTrackingSettlement::new());
    let settlement: Arc<dyn SettlementClient> = tracking.clone();
    let probe = Arc::new(CapabilityProbe::new(
        settlement.clone(),
        Duration::from_secs(30),
    ));
    (
        routes(Arc::new(FacilitatorState { settlement, probe })),
        tracking,
    )
}

fn payment_payload(nonce_byte: &str) -> Value {
    json!({
        "x402Version": 1,
        "scheme": "gokite-aa",
        "network": "kite-testnet",
        "payload": {
            "signature": format!("0x{}", "11".repeat(65)),
            "authorization": {
                "from": "0x00000000000000000000000000000000000000aa",
                "to": "0x00000000000000000000000000000000000000bb",
                "token": "0x00000000000000000000000000000000000000cc",
                "value": "1000",
                "validAfter": "0",
                "validBefore": "99999999999",
                "nonce": format!("0x{}", nonce_byte.repeat(32)),
            },
            "sessionId": "33".repeat(32),
            "metadata": "svc:req:0001",
        },
    })
}

fn requirement(scheme: &str) -> Value {
    json!({
        "scheme": scheme,
        "network": "kite-testnet",
        "asset": "0x00000000000000000000000000000000000000cc",
        "payTo": "0x00000000000000000000000000000000000000bb",
        "maxAmountRequired": "1000",
        "paymentRequestId": "pr-test-1",
    })
}

async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::post(path)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn verify_accepts_a_well_formed_payload() {
    let app = demo_app();
    let body = json!({
        "paymentPayload": payment_payload("22"),
        "paymentRequirements": requirement("gokite-aa"),
    });
    let (status, value) = post_json(&app, "/v2/verify", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["valid"], true);
    assert_eq!(value["verified"], true);
    assert_eq!(value["authorized"], true);
    assert_eq!(value["scheme"], "gokite-aa");
    assert_eq!(value["network"], "kite-testnet");
    assert_eq!(value["x402Version"], 1);
    assert_eq!(value["paymentRequestId"], "pr-test-1");
}

#[tokio::test]
async fn verify_answers_identically_for_all_three_encodings() {
    let app = demo_app();
    let raw = payment_payload("22").to_string();

    let mut responses = Vec::new();
    for encoded in [
        raw.clone(),
        STANDARD.encode(raw.as_bytes()),
        URL_SAFE.encode(raw.as_bytes()),
    ] {
        let body = json!({
            "xPayment": encoded,
            "paymentRequirements": requirement("gokite-aa"),
        });
        let (status, value) = post_json(&app, "/v2/verify", body).await;
        assert_eq!(status, StatusCode::OK);
        responses.push(value);
    }
    assert_eq!(responses[0], responses[1]);
    assert_eq!(responses[1], responses[2]);
}

#[tokio::test]
async fn scheme_mismatch_is_400_and_never_reaches_simulation() {
    let (app, tracking) = tracking_app();
    let body = json!({
        "paymentPayload": payment_payload("22"),
        "paymentRequirements": requirement("exact"),
    });
    let (status, value) = post_json(&app, "/v2/verify", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["code"], "tuple_mismatch_scheme");
    assert_eq!(tracking.simulate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_authorization_field_is_400_not_500() {
    let app = demo_app();
    let mut payload = payment_payload("22");
    payload["payload"]["authorization"]
        .as_object_mut()
        .unwrap()
        .remove("validBefore");
    let body = json!({
        "paymentPayload": payload,
        "paymentRequirements": requirement("gokite-aa"),
    });
    let (status, value) = post_json(&app, "/v2/verify", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["code"], "missing_authorization");
    assert_eq!(value["details"]["field"], "validBefore");
}

#[tokio::test]
async fn settle_consumes_the_nonce_and_verify_rejects_the_replay() {
    let (app, tracking) = tracking_app();
    let body = json!({
        "paymentPayload": payment_payload("44"),
        "paymentRequirements": requirement("gokite-aa"),
    });

    let (status, value) = post_json(&app, "/v2/settle", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["settled"], true);
    assert_eq!(value["success"], true);
    assert!(value["txHash"].as_str().unwrap().starts_with("0x"));

    // Same payload again: the consumed nonce fails simulation, mapped to 400.
    let (status, value) = post_json(&app, "/v2/verify", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["code"], "simulation_failed");
    assert_eq!(tracking.settle_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn settle_is_never_attempted_when_simulation_fails() {
    let (app, tracking) = tracking_app();
    let body = json!({
        "paymentPayload": payment_payload("55"),
        "paymentRequirements": requirement("gokite-aa"),
    });

    let (status, _) = post_json(&app, "/v2/settle", body.clone()).await;
    assert_eq!(status, StatusCode::OK);

    // Replay: simulation fails, so settle must not run again.
    let (status, value) = post_json(&app, "/v2/settle", body).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(value["code"], "simulation_failed");
    assert_eq!(tracking.settle_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn supported_lists_gokite_aa_kinds() {
    let app = demo_app();
    let response = app
        .oneshot(Request::get("/v2/supported").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    let kinds = value["kinds"].as_array().unwrap();
    assert_eq!(kinds.len(), 2);
    assert_eq!(kinds[0]["scheme"], "gokite-aa");
    assert_eq!(kinds[0]["network"], "kite-testnet");
    assert_eq!(kinds[0]["x402Version"], 1);
    assert_eq!(kinds[1]["network"], "kite");
}

#[tokio::test]
async fn health_reports_the_probe() {
    let app = demo_app();
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["mode"], "demo");
    assert_eq!(value["configured"], true);
    assert_eq!(value["verifyReachable"], true);
    assert_eq!(value["settleReachable"], true);
}

#[tokio::test]
async fn unparseable_body_is_a_structured_400() {
    let app = demo_app();
    let (status, value) = post_json(&app, "/v2/verify", json!({ "bogus": true })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["code"], "invalid_request");
}
