//! Wallet sign-in challenges: created on demand, consumed at most once.
//!
//! A challenge couples an opaque lookup id with a nonce embedded in a
//! human-readable, wallet-signable message. Consumption is an atomic
//! read-and-delete: the record is removed whether or not it was still valid, so a
//! given id can never be consumed twice and a prober cannot distinguish "expired"
//! from "already consumed". Expired entries are additionally swept inline on every
//! creation; no background timer exists.

use dashmap::DashMap;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::types::{EvmAddress, UnixTimestamp};

/// Agent identity used when the caller does not name one.
pub const DEFAULT_AGENT_ID: &str = "default";

/// A pending sign-in challenge. Ephemeral and single-use.
#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub id: String,
    pub nonce: String,
    pub message: String,
    pub owner_address: EvmAddress,
    pub agent_id: String,
    pub issued_at: UnixTimestamp,
    pub expires_at: UnixTimestamp,
}

/// Issues and consumes wallet sign-in challenges.
///
/// Backed by a concurrency-safe map so racing consumers cannot both observe the
/// same record: `DashMap::remove` is the single atomic consumption point.
pub struct ChallengeIssuer {
    store: DashMap<String, ChallengeRecord>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ChallengeIssuer {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        ChallengeIssuer {
            store: DashMap::new(),
            clock,
            ttl,
        }
    }

    /// Creates a challenge for `owner_address`, sweeping expired entries first.
    ///
    /// The lookup id and the in-message nonce are independent random values: the
    /// id never appears in the signed message, so holding a signed message grants
    /// nothing without the id it was issued under.
    pub fn create_challenge(
        &self,
        domain: &str,
        uri: &str,
        chain_id: u64,
        owner_address: EvmAddress,
        agent_id: Option<&str>,
    ) -> ChallengeRecord {
        self.sweep_expired();

        let id = random_hex(32);
        let nonce = random_hex(16);
        let agent_id = agent_id.unwrap_or(DEFAULT_AGENT_ID).to_string();
        let issued_at = self.clock.now();
        let expires_at = issued_at.saturating_add(self.ttl.as_secs());
        let message = render_message(
            domain,
            uri,
            chain_id,
            &owner_address,
            &agent_id,
            &nonce,
            issued_at,
            expires_at,
        );

        let record = ChallengeRecord {
            id: id.clone(),
            nonce,
            message,
            owner_address,
            agent_id,
            issued_at,
            expires_at,
        };
        self.store.insert(id, record.clone());
        tracing::debug!(
            challenge_id = %record.id,
            owner = %record.owner_address,
            expires_at = %record.expires_at,
            "challenge created"
        );
        record
    }

    /// Atomic read-and-delete. Returns the record only if it existed and had not
    /// expired at the moment of consumption; the entry is removed either way.
    pub fn consume_challenge(&self, id: &str) -> Option<ChallengeRecord> {
        let (_, record) = self.store.remove(id)?;
        if record.expires_at <= self.clock.now() {
            tracing::debug!(challenge_id = %id, "challenge expired at consumption");
            return None;
        }
        Some(record)
    }

    /// Amortized cleanup executed inline on each creation.
    fn sweep_expired(&self) {
        let now = self.clock.now();
        self.store.retain(|_, record| record.expires_at > now);
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.store.len()
    }
}

#[allow(clippy::too_many_arguments)]
fn render_message(
    domain: &str,
    uri: &str,
    chain_id: u64,
    owner_address: &EvmAddress,
    agent_id: &str,
    nonce: &str,
    issued_at: UnixTimestamp,
    expires_at: UnixTimestamp,
) -> String {
    format!(
        "{domain} wants you to sign in with your wallet:\n\
         {owner_address}\n\
         \n\
         Agent: {agent_id}\n\
         URI: {uri}\n\
         Chain ID: {chain_id}\n\
         Nonce: {nonce}\n\
         Issued At: {issued_at}\n\
         Expiration Time: {expires_at}"
    )
}

/// `len` random bytes as lowercase hex.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
