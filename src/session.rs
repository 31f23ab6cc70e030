//! Session identity: access/refresh token pairs bound to a wallet owner.
//!
//! Access tokens are self-contained HS256 JWTs (claims stay readable, only
//! tamper-evidence is provided), verified with the library's constant-time
//! signature check. Refresh tokens are opaque random values tracked server-side by
//! SHA-256 digest; rotation applies the same single-use discipline as challenge
//! consumption, so a replayed refresh token is rejected identically to an unknown
//! one.

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::challenge::{ChallengeRecord, random_hex};
use crate::clock::Clock;
use crate::security::{constant_time_eq, sha256_hex};
use crate::types::{EvmAddress, UnixTimestamp};

/// Fixed auth-mode tag carried by every access token minted here.
pub const AUTH_MODE_WALLET: &str = "wallet";

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClaims {
    /// Owner wallet address.
    pub sub: String,
    pub agent_id: String,
    pub auth_mode: String,
    pub iat: u64,
    pub exp: u64,
}

/// Access/refresh pair returned on successful challenge verification or rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub access_ttl: u64,
    /// Refresh token lifetime in seconds.
    pub refresh_ttl: u64,
}

/// Authentication failures. Deliberately coarse: the caller learns that a
/// credential was rejected, never which check rejected it.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid or expired challenge")]
    InvalidChallenge,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid access token")]
    InvalidToken,
    #[error("Invalid refresh token")]
    InvalidRefreshToken,
    #[error("Failed to mint token")]
    Minting(#[from] jsonwebtoken::errors::Error),
}

impl AuthError {
    /// Stable machine-readable code for the wire error body.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidChallenge => "INVALID_CHALLENGE",
            AuthError::InvalidSignature => "INVALID_SIGNATURE",
            AuthError::InvalidToken => "INVALID_TOKEN",
            AuthError::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            AuthError::Minting(_) => "TOKEN_MINTING_FAILED",
        }
    }
}

/// Server-side state of an outstanding refresh token, keyed by token digest.
#[derive(Debug, Clone)]
struct RefreshRecord {
    owner_address: EvmAddress,
    agent_id: String,
    expires_at: UnixTimestamp,
}

/// Mints and rotates session token pairs.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    refresh_store: DashMap<String, RefreshRecord>,
    clock: Arc<dyn Clock>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(
        secret: &[u8],
        clock: Arc<dyn Clock>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        TokenIssuer {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            refresh_store: DashMap::new(),
            clock,
            access_ttl,
            refresh_ttl,
        }
    }

    /// Mints a fresh access/refresh pair for `owner_address`.
    ///
    /// The refresh token itself is never stored; only its SHA-256 digest is,
    /// together with the owner/agent binding and an absolute expiry.
    pub fn issue_token_pair(
        &self,
        owner_address: EvmAddress,
        agent_id: &str,
    ) -> Result<SessionTokenPair, AuthError> {
        let now = self.clock.now();
        let claims = AccessClaims {
            sub: owner_address.to_string(),
            agent_id: agent_id.to_string(),
            auth_mode: AUTH_MODE_WALLET.to_string(),
            iat: now.0,
            exp: now.saturating_add(self.access_ttl.as_secs()).0,
        };
        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;

        let refresh_token = random_hex(32);
        self.refresh_store.insert(
            sha256_hex(refresh_token.as_bytes()),
            RefreshRecord {
                owner_address,
                agent_id: agent_id.to_string(),
                expires_at: now.saturating_add(self.refresh_ttl.as_secs()),
            },
        );

        Ok(SessionTokenPair {
            access_token,
            refresh_token,
            access_ttl: self.access_ttl.as_secs(),
            refresh_ttl: self.refresh_ttl.as_secs(),
        })
    }

    /// Verifies an access token: structure, signature, expiry, required claims.
    ///
    /// Every failure collapses into [`AuthError::InvalidToken`] so the result is
    /// not an oracle on which check failed.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        let data = decode::<AccessClaims>(token, &self.decoding, &validation)
            .map_err(|_| AuthError::InvalidToken)?;
        if data.claims.auth_mode != AUTH_MODE_WALLET {
            return Err(AuthError::InvalidToken);
        }
        Ok(data.claims)
    }

    /// Rotates a refresh token: the old token is atomically invalidated and a new
    /// bound pair is issued. Absent, expired, and already-rotated tokens are
    /// rejected identically.
    pub fn rotate_refresh_token(&self, old_token: &str) -> Result<SessionTokenPair, AuthError> {
        let digest = sha256_hex(old_token.as_bytes());
        let (_, record) = self
            .refresh_store
            .remove(&digest)
            .ok_or(AuthError::InvalidRefreshToken)?;
        if record.expires_at <= self.clock.now() {
            return Err(AuthError::InvalidRefreshToken);
        }
        self.issue_token_pair(record.owner_address, &record.agent_id)
    }
}

/// Authenticates a consumed challenge against the presented message and wallet
/// signature.
///
/// The presented message must equal the stored one (compared in constant time),
/// and the EIP-191 signature over it must recover to the challenge's owner
/// address.
pub fn authenticate_challenge(
    record: &ChallengeRecord,
    message: &str,
    signature: &str,
) -> Result<(), AuthError> {
    if !constant_time_eq(record.message.as_bytes(), message.as_bytes()) {
        return Err(AuthError::InvalidChallenge);
    }
    verify_wallet_signature(message, signature, &record.owner_address)
}

/// Recovers the EIP-191 signer of `message` and requires it to be `expected`.
pub fn verify_wallet_signature(
    message: &str,
    signature: &str,
    expected: &EvmAddress,
) -> Result<(), AuthError> {
    let bytes = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|_| AuthError::InvalidSignature)?;
    let array: [u8; 65] = bytes
        .try_into()
        .map_err(|_| AuthError::InvalidSignature)?;
    let signature = alloy::primitives::Signature::from_raw_array(&array)
        .map_err(|_| AuthError::InvalidSignature)?;
    let digest = alloy::primitives::eip191_hash_message(message.as_bytes());
    let recovered = signature
        .recover_address_from_prehash(&digest)
        .map_err(|_| AuthError::InvalidSignature)?;
    if recovered != expected.0 {
        return Err(AuthError::InvalidSignature);
    }
    Ok(())
}
