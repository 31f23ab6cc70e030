//! HTTP settlement delegate.
//!
//! Some deployments do not self-settle: the payment gate runs next to the
//! application while verification and settlement are delegated to a remote
//! facilitator. This client speaks the same `/v2/verify` and `/v2/settle` wire
//! protocol served by [`crate::handlers`], so a gate can switch between local and
//! delegated settlement by configuration alone.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use url::Url;

use crate::settlement::{SettlementClient, SettlementError, SettlementMode};
use crate::types::{
    GokiteAaPayload, NormalizedPaymentRequest, PaymentPayload, PaymentRequirement, SettleSuccess,
    VerifySuccess,
};

/// Settlement client that forwards to a remote facilitator over HTTP.
pub struct FacilitatorClient {
    http: reqwest::Client,
    base_url: Url,
}

impl FacilitatorClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(FacilitatorClient { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, SettlementError> {
        self.base_url
            .join(path)
            .map_err(|e| SettlementError::SettlementFailed(format!("invalid facilitator URL: {e}")))
    }

    /// Re-expands the canonical record into the explicit envelope wire form.
    fn wire_body(request: &NormalizedPaymentRequest) -> serde_json::Value {
        let payload = PaymentPayload {
            x402_version: request.x402_version,
            scheme: request.scheme,
            network: request.network,
            payload: GokiteAaPayload {
                signature: request.signature,
                authorization: request.authorization,
                session_id: request.session_id,
                metadata: Some(request.metadata.clone()),
            },
        };
        let requirement = PaymentRequirement {
            scheme: request.scheme,
            network: request.network,
            asset: request.asset,
            pay_to: request.pay_to,
            max_amount_required: request.max_amount_required,
            payment_request_id: request.payment_request_id.clone(),
        };
        json!({
            "paymentPayload": payload,
            "paymentRequirements": requirement,
        })
    }
}

#[async_trait]
impl SettlementClient for FacilitatorClient {
    fn mode(&self) -> SettlementMode {
        SettlementMode::Remote
    }

    fn configured(&self) -> bool {
        true
    }

    async fn simulate(&self, request: &NormalizedPaymentRequest) -> Result<(), SettlementError> {
        let url = self.endpoint("v2/verify")?;
        let response = self
            .http
            .post(url)
            .json(&Self::wire_body(request))
            .send()
            .await
            .map_err(|e| SettlementError::SimulationFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SettlementError::SimulationFailed(format!(
                "facilitator verify returned {status}: {body}"
            )));
        }
        let verified: VerifySuccess = response
            .json()
            .await
            .map_err(|e| SettlementError::SimulationFailed(e.to_string()))?;
        if verified.valid {
            Ok(())
        } else {
            Err(SettlementError::SimulationFailed(
                "facilitator rejected the payment".to_string(),
            ))
        }
    }

    async fn settle(
        &self,
        request: &NormalizedPaymentRequest,
    ) -> Result<String, SettlementError> {
        let url = self.endpoint("v2/settle")?;
        let response = self
            .http
            .post(url)
            .json(&Self::wire_body(request))
            .send()
            .await
            .map_err(|e| SettlementError::SettlementFailed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SettlementError::SettlementFailed(format!(
                "facilitator settle returned {status}: {body}"
            )));
        }
        let settled: SettleSuccess = response
            .json()
            .await
            .map_err(|e| SettlementError::SettlementFailed(e.to_string()))?;
        if settled.settled {
            Ok(settled.tx_hash)
        } else {
            Err(SettlementError::SettlementFailed(
                "facilitator did not settle the payment".to_string(),
            ))
        }
    }

    async fn reachability(&self) -> Result<(), SettlementError> {
        let url = self.endpoint("health")?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SettlementError::SettlementFailed(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SettlementError::SettlementFailed(format!(
                "facilitator health returned {}",
                response.status()
            )))
        }
    }
}
