//! x402 payments for smart-account wallets.
//!
//! This crate gates paid, machine-to-machine API access for autonomous agents:
//! a caller first establishes a wallet-backed session identity through a
//! challenge/response handshake, then presents a signed, on-chain-verifiable
//! payment authorization before a priced resource is served.
//!
//! # Overview
//!
//! The flow is HTTP-native: a priced route answers `402 Payment Required` with a
//! [`types::PaymentRequired`] challenge; the caller obtains a signed authorization
//! off-system and resubmits with payment evidence; the facilitator verifies
//! (simulate) and settles (broadcast) against the payer's smart-account wallet,
//! whose on-chain code performs signature recovery and nonce consumption — the
//! authoritative replay defense.
//!
//! # Modules
//!
//! - [`types`] — protocol types: payloads, requirements, canonical records.
//! - [`normalizer`] — parses the three wire encodings into one canonical record.
//! - [`settlement`] — the settlement capability trait, failure taxonomy, and the
//!   deterministic demo backend.
//! - [`chain`] — on-chain settlement through `executeTransferWithAuthorization`.
//! - [`facilitator_client`] — HTTP delegation to a remote facilitator.
//! - [`handlers`] — the facilitator HTTP surface (`/v2/verify`, `/v2/settle`).
//! - [`challenge`] — single-use wallet sign-in challenges.
//! - [`session`] — access/refresh token pairs with rotation and replay detection.
//! - [`session_handlers`] — the session HTTP surface.
//! - [`gate`] — tower middleware pricing arbitrary routes.
//! - [`ledger`] — injected payment/activity/identity collaborator interfaces.
//! - [`probe`] — consolidated, TTL-cached payment-backend capability probe.
//! - [`config`] — environment-driven server configuration.
//! - [`clock`] — injected wall-clock source.

pub mod chain;
pub mod challenge;
pub mod clock;
pub mod config;
pub mod facilitator_client;
pub mod gate;
pub mod handlers;
pub mod ledger;
pub mod normalizer;
pub mod probe;
pub mod security;
pub mod session;
pub mod session_handlers;
pub mod settlement;
pub mod telemetry;
pub mod types;
