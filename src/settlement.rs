//! Settlement capability: one interface, pluggable backends.
//!
//! [`SettlementClient`] is the seam between HTTP-facing code and payment authority.
//! `simulate` is a non-mutating dry run; `settle` broadcasts the transfer and must
//! only ever be called after a passing `simulate` on the same call path. The chain
//! backend lives in [`crate::chain`], the HTTP delegate in
//! [`crate::facilitator_client`]; this module holds the trait, the failure
//! taxonomy, and the deterministic demo backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;

use crate::clock::Clock;
use crate::security::sha256_hex;
use crate::types::NormalizedPaymentRequest;

/// Which backend a settlement client runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementMode {
    /// Deterministic in-process backend, no network calls.
    Demo,
    /// On-chain backend settling through the smart-account wallet contract.
    Chain,
    /// Delegation to a remote facilitator over HTTP.
    Remote,
}

impl Display for SettlementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlementMode::Demo => write!(f, "demo"),
            SettlementMode::Chain => write!(f, "chain"),
            SettlementMode::Remote => write!(f, "remote"),
        }
    }
}

/// Settlement failure taxonomy.
///
/// `SimulationFailed` deliberately covers invalid signatures, expired validity
/// windows, and consumed/replayed nonces without distinguishing them: the caller
/// learns the payment was rejected, not which check rejected it.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// The dry run rejected the authorization. Surfaced identically for invalid
    /// signature, expired window, and replayed nonce.
    #[error("Simulation failed: {0}")]
    SimulationFailed(String),
    /// Broadcast or mining failed after a passing simulation, including RPC
    /// timeouts; retryable once the caller confirms the nonce was not consumed.
    #[error("Settlement failed: {0}")]
    SettlementFailed(String),
    /// No signing key is configured. Fatal, operator must fix.
    #[error("No signing key configured for settlement")]
    MissingPrivateKey,
    /// The connected node is on the wrong chain. Fatal, operator must fix.
    #[error("Connected chain id {actual} does not match expected {expected}")]
    ChainIdMismatch { expected: u64, actual: u64 },
}

impl SettlementError {
    /// Stable machine-readable code for the wire error body.
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::SimulationFailed(_) => "simulation_failed",
            SettlementError::SettlementFailed(_) => "settlement_failed",
            SettlementError::MissingPrivateKey => "missing_private_key",
            SettlementError::ChainIdMismatch { .. } => "chain_id_mismatch",
        }
    }

    /// Fatal configuration errors require operator action and map to 500.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SettlementError::MissingPrivateKey | SettlementError::ChainIdMismatch { .. }
        )
    }
}

/// Capability interface for verifying and executing payments.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Backend kind, reported by the capability probe.
    fn mode(&self) -> SettlementMode;

    /// Whether the backend holds everything it needs to settle (signing key).
    fn configured(&self) -> bool;

    /// Non-mutating dry run of the transfer. An `Ok` result is the precondition
    /// for calling [`SettlementClient::settle`].
    async fn simulate(&self, request: &NormalizedPaymentRequest) -> Result<(), SettlementError>;

    /// Executes the transfer and returns a transaction reference. Callers must
    /// have passed [`SettlementClient::simulate`] for the same request first.
    async fn settle(&self, request: &NormalizedPaymentRequest)
    -> Result<String, SettlementError>;

    /// Cheap backend reachability check for the capability probe.
    async fn reachability(&self) -> Result<(), SettlementError>;
}

/// Deterministic settlement backend for demos and tests. No network calls.
///
/// `simulate` accepts any normalized request; `settle` fabricates a reproducible
/// pseudo-reference from the payment request id plus a clock component.
pub struct DemoSettlement {
    clock: Arc<dyn Clock>,
}

impl DemoSettlement {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        DemoSettlement { clock }
    }
}

#[async_trait]
impl SettlementClient for DemoSettlement {
    fn mode(&self) -> SettlementMode {
        SettlementMode::Demo
    }

    fn configured(&self) -> bool {
        true
    }

    async fn simulate(&self, request: &NormalizedPaymentRequest) -> Result<(), SettlementError> {
        tracing::debug!(
            payment_request_id = %request.payment_request_id,
            payer = %request.authorization.from,
            "demo simulate ok"
        );
        Ok(())
    }

    async fn settle(
        &self,
        request: &NormalizedPaymentRequest,
    ) -> Result<String, SettlementError> {
        let digest = sha256_hex(request.payment_request_id.as_bytes());
        let reference = format!("demo-{}-{}", &digest[..16], self.clock.now());
        tracing::info!(
            payment_request_id = %request.payment_request_id,
            reference = %reference,
            "demo settle"
        );
        Ok(reference)
    }

    async fn reachability(&self) -> Result<(), SettlementError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::normalizer::{PaymentRequestBody, normalize};
    use crate::types::{Network, PaymentRequirement, Scheme, TokenAmount};

    fn normalized(payment_request_id: &str) -> NormalizedPaymentRequest {
        let payload = serde_json::json!({
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
                    "nonce": format!("0x{}", "22".repeat(32)),
                },
                "sessionId": "33".repeat(32),
            },
        });
        let requirement = PaymentRequirement {
            scheme: Scheme::GokiteAa,
            network: Network::KiteTestnet,
            asset: "0x00000000000000000000000000000000000000cc".parse().unwrap(),
            pay_to: "0x00000000000000000000000000000000000000bb".parse().unwrap(),
            max_amount_required: TokenAmount::from(1000u64),
            payment_request_id: payment_request_id.to_string(),
        };
        normalize(&PaymentRequestBody {
            payment_payload: Some(payload),
            x_payment: None,
            payment_requirements: serde_json::to_value(requirement).unwrap(),
        })
        .expect("fixture normalizes")
    }

    #[tokio::test]
    async fn demo_settle_reference_is_reproducible() {
        let clock = ManualClock::at(1_700_000_000);
        let client = DemoSettlement::new(clock.clone());
        let request = normalized("req-1");
        client.simulate(&request).await.expect("simulate passes");
        let first = client.settle(&request).await.unwrap();
        let second = client.settle(&request).await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("demo-"));
        assert!(first.ends_with("1700000000"));
    }

    #[tokio::test]
    async fn demo_settle_reference_differs_per_request_id() {
        let clock = ManualClock::at(1_700_000_000);
        let client = DemoSettlement::new(clock);
        let a = client.settle(&normalized("req-1")).await.unwrap();
        let b = client.settle(&normalized("req-2")).await.unwrap();
        assert_ne!(a, b);
    }
}
