//! Wallet session surface: challenge → sign → verify → refresh rotation.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use x402_aa::challenge::ChallengeIssuer;
use x402_aa::clock::SystemClock;
use x402_aa::session::TokenIssuer;
use x402_aa::session_handlers::{SessionState, routes};

fn app() -> Router {
    let clock = Arc::new(SystemClock);
    let challenges = Arc::new(ChallengeIssuer::new(clock.clone(), Duration::from_secs(300)));
    let tokens = Arc::new(TokenIssuer::new(
        b"session-test-secret",
        clock,
        Duration::from_secs(900),
        Duration::from_secs(86_400),
    ));
    routes(Arc::new(SessionState { challenges, tokens }))
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

async fn request_challenge(app: &Router, owner: &str) -> Value {
    let (status, value) = post_json(
        app,
        "/v2/session/challenge",
        json!({
            "domain": "api.example.com",
            "uri": "https://api.example.com",
            "chainId": 2368,
            "ownerAddress": owner,
            "agentId": "agent-7",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    value
}

fn sign(signer: &PrivateKeySigner, message: &str) -> String {
    let signature = signer.sign_message_sync(message.as_bytes()).unwrap();
    format!("0x{}", hex::encode(signature.as_bytes()))
}

#[tokio::test]
async fn challenge_response_carries_the_signable_message() {
    let app = app();
    let signer = PrivateKeySigner::random();
    let owner = signer.address().to_string();

    let challenge = request_challenge(&app, &owner).await;
    assert!(challenge["challengeId"].as_str().unwrap().len() == 64);
    assert_eq!(challenge["agentId"], "agent-7");
    let message = challenge["message"].as_str().unwrap();
    assert!(message.contains("api.example.com"));
    assert!(message.contains(challenge["nonce"].as_str().unwrap()));
}

#[tokio::test]
async fn full_session_lifecycle_with_refresh_rotation() {
    let app = app();
    let signer = PrivateKeySigner::random();
    let owner = signer.address().to_string();

    // Challenge → sign → verify issues the pair.
    let challenge = request_challenge(&app, &owner).await;
    let message = challenge["message"].as_str().unwrap().to_string();
    let (status, pair) = post_json(
        &app,
        "/v2/session/verify",
        json!({
            "challengeId": challenge["challengeId"],
            "message": message,
            "signature": sign(&signer, &message),
            "ownerAddress": owner,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pair["accessTtl"], 900);
    assert_eq!(pair["refreshTtl"], 86400);
    let access = pair["accessToken"].as_str().unwrap();
    let refresh = pair["refreshToken"].as_str().unwrap();

    // The access token reads back the identity claims.
    let response = app
        .clone()
        .oneshot(
            Request::get("/v2/session")
                .header(header::AUTHORIZATION, format!("Bearer {access}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let claims: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(claims["sub"], owner);
    assert_eq!(claims["agentId"], "agent-7");
    assert_eq!(claims["authMode"], "wallet");

    // Refreshing once succeeds and rotates.
    let (status, rotated) = post_json(
        &app,
        "/v2/session/refresh",
        json!({ "refreshToken": refresh }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(rotated["refreshToken"], pair["refreshToken"]);

    // Replaying the original refresh token is rejected as invalid.
    let (status, error) = post_json(
        &app,
        "/v2/session/refresh",
        json!({ "refreshToken": refresh }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["code"], "INVALID_REFRESH_TOKEN");

    // The rotated refresh token works exactly once.
    let (status, _) = post_json(
        &app,
        "/v2/session/refresh",
        json!({ "refreshToken": rotated["refreshToken"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn a_challenge_cannot_be_verified_twice() {
    let app = app();
    let signer = PrivateKeySigner::random();
    let owner = signer.address().to_string();

    let challenge = request_challenge(&app, &owner).await;
    let message = challenge["message"].as_str().unwrap().to_string();
    let body = json!({
        "challengeId": challenge["challengeId"],
        "message": message,
        "signature": sign(&signer, &message),
    });

    let (status, _) = post_json(&app, "/v2/session/verify", body.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, error) = post_json(&app, "/v2/session/verify", body).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["code"], "INVALID_CHALLENGE");
}

#[tokio::test]
async fn foreign_signature_burns_the_challenge_and_is_rejected() {
    let app = app();
    let signer = PrivateKeySigner::random();
    let stranger = PrivateKeySigner::random();
    let owner = signer.address().to_string();

    let challenge = request_challenge(&app, &owner).await;
    let message = challenge["message"].as_str().unwrap().to_string();

    let (status, error) = post_json(
        &app,
        "/v2/session/verify",
        json!({
            "challengeId": challenge["challengeId"],
            "message": message,
            "signature": sign(&stranger, &message),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["code"], "INVALID_SIGNATURE");

    // The failed attempt consumed the challenge; a correct retry cannot reuse it.
    let (status, error) = post_json(
        &app,
        "/v2/session/verify",
        json!({
            "challengeId": challenge["challengeId"],
            "message": message,
            "signature": sign(&signer, &message),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["code"], "INVALID_CHALLENGE");
}

#[tokio::test]
async fn session_read_without_bearer_is_401() {
    let app = app();
    let response = app
        .oneshot(Request::get("/v2/session").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_refresh_token_is_401() {
    let app = app();
    let (status, error) = post_json(
        &app,
        "/v2/session/refresh",
        json!({ "refreshToken": "deadbeef" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["code"], "INVALID_REFRESH_TOKEN");
}
