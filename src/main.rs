//! Facilitator HTTP entrypoint.
//!
//! Launches an Axum server exposing:
//! - the facilitator protocol surface: `GET /health`, `GET /v2/supported`,
//!   `POST /v2/verify`, `POST /v2/settle`;
//! - the wallet session surface: `POST /v2/session/challenge`,
//!   `POST /v2/session/verify`, `GET /v2/session`, `POST /v2/session/refresh`;
//! - one payment-gated demo route, `POST /v2/paid/echo`, wrapped in the
//!   [`x402_aa::gate::PaymentGate`] layer.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `SETTLEMENT_MODE` selects the backend (`demo` | `chain` | `remote`)

use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use x402_aa::challenge::ChallengeIssuer;
use x402_aa::chain::ChainSettlement;
use x402_aa::clock::{Clock, SystemClock};
use x402_aa::config::{Config, SettlementConfig};
use x402_aa::facilitator_client::FacilitatorClient;
use x402_aa::gate::{GatePricing, PaymentGate};
use x402_aa::handlers::{self, FacilitatorState};
use x402_aa::ledger::{IdentityLinks, InMemoryIdentityLinks, InMemoryLedger, PaymentLedger};
use x402_aa::probe::CapabilityProbe;
use x402_aa::session::TokenIssuer;
use x402_aa::session_handlers::{self, SessionState};
use x402_aa::settlement::{DemoSettlement, SettlementClient};
use x402_aa::telemetry;
use x402_aa::types::Scheme;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    telemetry::init();

    let config = Config::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let settlement: Arc<dyn SettlementClient> = match &config.settlement {
        SettlementConfig::Demo => Arc::new(DemoSettlement::new(clock.clone())),
        SettlementConfig::Chain {
            rpc_url,
            network,
            expected_chain_id,
            signer,
            confirmations,
            rpc_timeout,
        } => Arc::new(ChainSettlement::new(
            rpc_url,
            *network,
            *expected_chain_id,
            signer.clone(),
            *confirmations,
            *rpc_timeout,
        )),
        SettlementConfig::Remote {
            facilitator_url,
            timeout,
        } => Arc::new(FacilitatorClient::new(facilitator_url.clone(), *timeout)?),
    };

    let probe = Arc::new(CapabilityProbe::new(settlement.clone(), config.probe_ttl));
    let challenges = Arc::new(ChallengeIssuer::new(clock.clone(), config.challenge_ttl));
    let tokens = Arc::new(TokenIssuer::new(
        &config.jwt_secret,
        clock.clone(),
        config.access_ttl,
        config.refresh_ttl,
    ));
    let ledger: Arc<dyn PaymentLedger> = Arc::new(match config.gate.budget {
        Some(budget) => InMemoryLedger::with_budget(budget),
        None => InMemoryLedger::new(),
    });
    let identity: Arc<dyn IdentityLinks> = Arc::new(InMemoryIdentityLinks::new());

    let gate = PaymentGate::new(
        settlement.clone(),
        ledger,
        identity,
        tokens.clone(),
        clock,
        GatePricing {
            scheme: Scheme::GokiteAa,
            network: config.gate.network,
            asset: config.gate.asset,
            pay_to: config.gate.pay_to,
            max_amount_required: config.gate.price,
        },
    );
    let paid_routes = Router::new()
        .route("/v2/paid/echo", post(paid_echo))
        .layer(gate.into_layer());

    let facilitator_state = Arc::new(FacilitatorState { settlement, probe });
    let session_state = Arc::new(SessionState { challenges, tokens });

    let app = Router::new()
        .merge(handlers::routes(facilitator_state))
        .merge(session_handlers::routes(session_state))
        .merge(paid_routes)
        .layer(telemetry::http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}

/// Demo priced resource: echoes the request body back once payment clears.
async fn paid_echo(Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    Json(serde_json::json!({ "echo": body }))
}
