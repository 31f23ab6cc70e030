//! Consolidated payment-backend capability probe.
//!
//! One probe answers every "can this deployment take payments right now"
//! question: which backend is active, whether it holds a signing key, whether the
//! backend is reachable for verification and settlement, and how long the last
//! check took. Results are cached with a TTL so health endpoints do not hammer
//! the RPC node.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::settlement::{SettlementClient, SettlementMode};

/// Snapshot of payment-backend capability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub mode: SettlementMode,
    pub configured: bool,
    pub verify_reachable: bool,
    pub settle_reachable: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// TTL-cached prober over a [`SettlementClient`].
pub struct CapabilityProbe {
    settlement: Arc<dyn SettlementClient>,
    ttl: Duration,
    cached: RwLock<Option<(Instant, ProbeReport)>>,
}

impl CapabilityProbe {
    pub fn new(settlement: Arc<dyn SettlementClient>, ttl: Duration) -> Self {
        CapabilityProbe {
            settlement,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Returns the cached report when fresh, probing the backend otherwise.
    pub async fn report(&self) -> ProbeReport {
        if let Some((at, report)) = self.cached.read().await.as_ref() {
            if at.elapsed() < self.ttl {
                return report.clone();
            }
        }
        let report = self.measure().await;
        *self.cached.write().await = Some((Instant::now(), report.clone()));
        report
    }

    async fn measure(&self) -> ProbeReport {
        let configured = self.settlement.configured();
        let start = Instant::now();
        let reachability = self.settlement.reachability().await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match reachability {
            Ok(()) => ProbeReport {
                mode: self.settlement.mode(),
                configured,
                verify_reachable: true,
                // Settlement additionally needs a signing key.
                settle_reachable: configured,
                latency_ms,
                last_error: None,
            },
            Err(error) => {
                tracing::warn!(error = %error, "payment backend probe failed");
                ProbeReport {
                    mode: self.settlement.mode(),
                    configured,
                    verify_reachable: false,
                    settle_reachable: false,
                    latency_ms,
                    last_error: Some(error.to_string()),
                }
            }
        }
    }
}
