//! External collaborator interfaces: payment ledger, activity stream, identity links.
//!
//! Persistence lives outside this core. The payment gate talks to these traits;
//! deployments inject whatever store they run (the in-memory implementations here
//! back the demo binary and the tests, and double as the reference semantics for
//! real stores).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use alloy::primitives::U256;

use crate::types::{EvmAddress, TokenAmount, UnixTimestamp};

/// Payment lifecycle: `requested → authorized → settled | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Requested,
    Authorized,
    Settled,
    Failed,
}

/// One ledger row, keyed by `payment_request_id`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLedgerEntry {
    pub payment_request_id: String,
    pub agent_id: String,
    pub state: PaymentState,
    pub amount: TokenAmount,
    pub pay_to: EvmAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub updated_at: UnixTimestamp,
}

/// Activity stream event kinds emitted alongside ledger transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PaymentRequested,
    PaymentVerified,
    PaymentSettled,
    PaymentFailed,
}

/// One activity stream event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub payment_request_id: String,
    pub agent_id: String,
    pub kind: ActivityKind,
    pub at: UnixTimestamp,
}

/// Outcome of recording spend against a per-agent budget.
///
/// The budget is advisory: the gate logs an over-budget settlement but does not
/// block it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendStatus {
    WithinBudget,
    OverBudget { budget: TokenAmount, spent: TokenAmount },
    NoBudget,
}

/// Payment and activity persistence, keyed by `payment_request_id`.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn create_entry(&self, entry: PaymentLedgerEntry);

    /// Advances the entry's lifecycle state; unknown ids are ignored.
    async fn transition(
        &self,
        payment_request_id: &str,
        state: PaymentState,
        tx_hash: Option<String>,
        at: UnixTimestamp,
    );

    async fn record_activity(&self, event: ActivityEvent);

    /// Adds `amount` to the agent's running spend and reports budget standing.
    async fn record_spend(&self, agent_id: &str, amount: TokenAmount) -> SpendStatus;

    async fn entry(&self, payment_request_id: &str) -> Option<PaymentLedgerEntry>;

    async fn activities_for_agent(&self, agent_id: &str) -> Vec<ActivityEvent>;
}

/// Resolves a session owner to the payer address linked to it.
#[async_trait]
pub trait IdentityLinks: Send + Sync {
    async fn payer_for_owner(&self, owner: &EvmAddress) -> Option<EvmAddress>;
}

/// DashMap-backed ledger for the demo binary and tests.
#[derive(Default)]
pub struct InMemoryLedger {
    entries: DashMap<String, PaymentLedgerEntry>,
    activities: DashMap<String, Vec<ActivityEvent>>,
    spend: DashMap<String, U256>,
    budget: Option<U256>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one per-agent budget ceiling to every agent.
    pub fn with_budget(budget: TokenAmount) -> Self {
        InMemoryLedger {
            budget: Some(budget.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PaymentLedger for InMemoryLedger {
    async fn create_entry(&self, entry: PaymentLedgerEntry) {
        self.entries
            .insert(entry.payment_request_id.clone(), entry);
    }

    async fn transition(
        &self,
        payment_request_id: &str,
        state: PaymentState,
        tx_hash: Option<String>,
        at: UnixTimestamp,
    ) {
        if let Some(mut entry) = self.entries.get_mut(payment_request_id) {
            entry.state = state;
            entry.updated_at = at;
            if tx_hash.is_some() {
                entry.tx_hash = tx_hash;
            }
        }
    }

    async fn record_activity(&self, event: ActivityEvent) {
        self.activities
            .entry(event.agent_id.clone())
            .or_default()
            .push(event);
    }

    async fn record_spend(&self, agent_id: &str, amount: TokenAmount) -> SpendStatus {
        let mut spent = self.spend.entry(agent_id.to_string()).or_insert(U256::ZERO);
        *spent = spent.saturating_add(amount.into());
        match self.budget {
            Some(budget) if *spent > budget => SpendStatus::OverBudget {
                budget: TokenAmount(budget),
                spent: TokenAmount(*spent),
            },
            Some(_) => SpendStatus::WithinBudget,
            None => SpendStatus::NoBudget,
        }
    }

    async fn entry(&self, payment_request_id: &str) -> Option<PaymentLedgerEntry> {
        self.entries.get(payment_request_id).map(|e| e.clone())
    }

    async fn activities_for_agent(&self, agent_id: &str) -> Vec<ActivityEvent> {
        self.activities
            .get(agent_id)
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

/// DashMap-backed identity link store for the demo binary and tests.
#[derive(Default)]
pub struct InMemoryIdentityLinks {
    links: DashMap<EvmAddress, EvmAddress>,
}

impl InMemoryIdentityLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, owner: EvmAddress, payer: EvmAddress) {
        self.links.insert(owner, payer);
    }
}

#[async_trait]
impl IdentityLinks for InMemoryIdentityLinks {
    async fn payer_for_owner(&self, owner: &EvmAddress) -> Option<EvmAddress> {
        self.links.get(owner).map(|payer| *payer)
    }
}
