//! Type definitions for the x402 payment protocol as spoken by this facilitator.
//!
//! The key objects are [`PaymentPayload`], [`PaymentRequirement`], and the canonical
//! [`NormalizedPaymentRequest`] produced by the normalizer. Downstream components
//! (settlement clients, the facilitator handlers, the payment gate) only ever see the
//! normalized record; the wire-shaped types exist to parse untrusted client input.
//!
//! Payment authorizations follow the smart-account (AA) variant of ERC-3009: the
//! `from` address is a contract wallet that performs signature recovery and nonce
//! consumption on-chain when `executeTransferWithAuthorization` is called.

use alloy::hex;
use alloy::primitives::U256;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Display};
use std::str::FromStr;

/// Represents the protocol version. Currently only version 1 is supported.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum X402Version {
    /// Version `1`.
    V1,
}

impl Serialize for X402Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            X402Version::V1 => serializer.serialize_u8(1),
        }
    }
}

impl Display for X402Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            X402Version::V1 => write!(f, "1"),
        }
    }
}

#[derive(Debug)]
pub struct X402VersionError(pub u8);

impl Display for X402VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unsupported x402Version: {}", self.0)
    }
}

impl std::error::Error for X402VersionError {}

impl TryFrom<u8> for X402Version {
    type Error = X402VersionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(X402Version::V1),
            _ => Err(X402VersionError(value)),
        }
    }
}

impl<'de> Deserialize<'de> for X402Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        X402Version::try_from(num).map_err(serde::de::Error::custom)
    }
}

/// Enumerates payment schemes this facilitator understands.
///
/// `gokite-aa` is the smart-account authorization scheme settled via
/// `executeTransferWithAuthorization`; `exact` is recognized on the wire so a
/// requirement/payload disagreement is reported as a tuple mismatch instead of a
/// parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    #[serde(rename = "gokite-aa")]
    GokiteAa,
    #[serde(rename = "exact")]
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scheme::GokiteAa => "gokite-aa",
            Scheme::Exact => "exact",
        };
        write!(f, "{}", s)
    }
}

/// Supported target networks.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Kite testnet (chain ID 2368).
    #[serde(rename = "kite-testnet")]
    KiteTestnet,
    /// Kite mainnet (chain ID 2366).
    #[serde(rename = "kite")]
    Kite,
}

impl Network {
    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[Network::KiteTestnet, Network::Kite]
    }

    /// Numeric EVM chain id of the network.
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::KiteTestnet => 2368,
            Network::Kite => 2366,
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::KiteTestnet => write!(f, "kite-testnet"),
            Network::Kite => write!(f, "kite"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown network: {0}")]
pub struct NetworkParseError(pub String);

impl FromStr for Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kite-testnet" => Ok(Network::KiteTestnet),
            "kite" => Ok(Network::Kite),
            other => Err(NetworkParseError(other.to_string())),
        }
    }
}

/// Represents an EVM address.
///
/// Wrapper around `alloy::primitives::Address`, providing display/serialization support.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct EvmAddress(pub alloy::primitives::Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to decode EVM address")]
pub struct EvmAddressDecodingError;

impl FromStr for EvmAddress {
    type Err = EvmAddressDecodingError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address =
            alloy::primitives::Address::from_str(s).map_err(|_| EvmAddressDecodingError)?;
        Ok(Self(address))
    }
}

impl From<EvmAddress> for alloy::primitives::Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

impl From<alloy::primitives::Address> for EvmAddress {
    fn from(address: alloy::primitives::Address) -> Self {
        EvmAddress(address)
    }
}

/// Represents a 65-byte EVM signature, serialized as a 0x-prefixed hex string
/// with 130 hex characters.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl Debug for EvmSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvmSignature(0x{})", hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        static SIG_REGEX: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("Invalid regex for EVM signature")
        });

        if SIG_REGEX.is_match(&s) {
            let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| {
                serde::de::Error::custom("Failed to decode EVM signature hex string")
            })?;

            let array: [u8; 65] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("Signature must be exactly 65 bytes"))?;

            Ok(EvmSignature(array))
        } else {
            Err(serde::de::Error::custom(
                "Invalid EVM signature format: must be 0x-prefixed and 130 hex chars",
            ))
        }
    }
}

impl Serialize for EvmSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let hex_string = format!("0x{}", hex::encode(self.0));
        serializer.serialize_str(&hex_string)
    }
}

/// Represents a 32-byte authorization nonce, hex-encoded with 0x prefix.
/// Must be exactly 64 hex characters long.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct HexEncodedNonce(pub [u8; 32]);

impl Debug for HexEncodedNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexEncodedNonce(0x{})", hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for HexEncodedNonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        static NONCE_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("Invalid nonce regex"));

        if !NONCE_REGEX.is_match(&s) {
            return Err(serde::de::Error::custom("Invalid nonce format"));
        }

        let bytes =
            hex::decode(&s[2..]).map_err(|_| serde::de::Error::custom("Invalid hex in nonce"))?;

        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid length for nonce"))?;

        Ok(HexEncodedNonce(array))
    }
}

impl Serialize for HexEncodedNonce {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let hex_string = format!("0x{}", hex::encode(self.0));
        serializer.serialize_str(&hex_string)
    }
}

/// A 32-byte session identifier binding a payment authorization to a wallet session.
///
/// Serialized as 64 hex characters; the 0x prefix is optional on input and always
/// present on output.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 32]);

impl Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId(0x{})", hex::encode(self.0))
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid session id: must be 32 bytes of hex")]
pub struct SessionIdDecodingError;

impl FromStr for SessionId {
    type Err = SessionIdDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        if raw.len() != 64 {
            return Err(SessionIdDecodingError);
        }
        let bytes = hex::decode(raw).map_err(|_| SessionIdDecodingError)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| SessionIdDecodingError)?;
        Ok(SessionId(array))
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SessionId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A Unix timestamp represented as a `u64`, used in payment authorization windows
/// and credential expiries.
///
/// Serialized as a stringified integer to avoid loss of precision in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(pub u64);

impl UnixTimestamp {
    pub fn saturating_add(&self, seconds: u64) -> UnixTimestamp {
        UnixTimestamp(self.0.saturating_add(seconds))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixTimestamp(ts))
    }
}

impl From<UnixTimestamp> for U256 {
    fn from(value: UnixTimestamp) -> Self {
        U256::from(value.0)
    }
}

/// A precise on-chain token amount in base units (e.g. 6-decimal stablecoin units).
/// Represented as a stringified integer in JSON to prevent precision loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenAmount(pub U256);

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Token amount must be a non-negative base-10 integer")]
pub struct TokenAmountParseError;

impl FromStr for TokenAmount {
    type Err = TokenAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        U256::from_str_radix(s, 10)
            .map(TokenAmount)
            .map_err(|_| TokenAmountParseError)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TokenAmount::from_str(&s)
            .map_err(|_| serde::de::Error::custom("token amount must be a non-negative integer"))
    }
}

/// A 32-byte EVM transaction hash, encoded as 0x-prefixed hex string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHash(pub [u8; 32]);

impl<'de> Deserialize<'de> for TransactionHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        static TX_HASH_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("invalid regex"));

        if !TX_HASH_REGEX.is_match(&s) {
            return Err(serde::de::Error::custom("Invalid transaction hash format"));
        }

        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| serde::de::Error::custom("Invalid hex in transaction hash"))?;

        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Transaction hash must be exactly 32 bytes"))?;

        Ok(TransactionHash(array))
    }
}

impl Serialize for TransactionHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl Display for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// The signed transfer authorization: who moves how much of which token, and when.
///
/// `from` is a smart-account wallet; its on-chain code recovers the signature and
/// consumes `nonce`, which makes the chain the authoritative replay defense.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub token: EvmAddress,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: HexEncodedNonce,
}

/// Scheme-specific contents of a payment payload: the authorization, the signature
/// over it, the session the payment is bound to, and free-form caller metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GokiteAaPayload {
    pub signature: EvmSignature,
    pub authorization: PaymentAuthorization,
    pub session_id: SessionId,
    #[serde(default)]
    pub metadata: Option<String>,
}

/// Describes a signed request to transfer a specific amount of funds on-chain.
/// Includes the scheme, network, and signed payload contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: X402Version,
    pub scheme: Scheme,
    pub network: Network,
    pub payload: GokiteAaPayload,
}

/// Requirements set by a payment-gated endpoint for an acceptable payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: Scheme,
    pub network: Network,
    pub asset: EvmAddress,
    pub pay_to: EvmAddress,
    pub max_amount_required: TokenAmount,
    pub payment_request_id: String,
}

/// Body of a `402 Payment Required` response issued by the payment gate.
///
/// `code` distinguishes a fresh challenge (`PAYMENT_REQUIRED`) from a rejected
/// payment (`PAYMENT_VERIFY_FAILED`, `PAYMENT_SETTLE_FAILED`); `accepts` lists the
/// requirement combinations the caller may satisfy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version,
    pub code: String,
    pub message: String,
    pub payment_request_id: String,
    pub accepts: Vec<PaymentRequirement>,
}

/// Canonical, fully validated payment record. Produced only by the normalizer;
/// never hand-constructed downstream.
#[derive(Debug, Clone)]
pub struct NormalizedPaymentRequest {
    pub x402_version: X402Version,
    pub scheme: Scheme,
    pub network: Network,
    pub authorization: PaymentAuthorization,
    pub signature: EvmSignature,
    pub session_id: SessionId,
    /// Delimited caller metadata string, possibly empty.
    pub metadata: String,
    /// 0x-prefixed hex encoding of the UTF-8 `metadata` string, as sent on-chain.
    pub metadata_bytes: String,
    pub payment_request_id: String,
    pub asset: EvmAddress,
    pub pay_to: EvmAddress,
    pub max_amount_required: TokenAmount,
}

/// One supported (version, scheme, network) combination, as listed by
/// `GET /v2/supported`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    pub x402_version: X402Version,
    pub scheme: Scheme,
    pub network: Network,
}

/// Response body of `GET /v2/supported`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    pub kinds: Vec<SupportedPaymentKind>,
}

/// Success body of `POST /v2/verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySuccess {
    pub valid: bool,
    pub verified: bool,
    pub authorized: bool,
    pub scheme: Scheme,
    pub network: Network,
    pub x402_version: X402Version,
    pub payment_request_id: String,
}

impl VerifySuccess {
    pub fn new(request: &NormalizedPaymentRequest) -> Self {
        VerifySuccess {
            valid: true,
            verified: true,
            authorized: true,
            scheme: request.scheme,
            network: request.network,
            x402_version: request.x402_version,
            payment_request_id: request.payment_request_id.clone(),
        }
    }
}

/// Success body of `POST /v2/settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleSuccess {
    pub settled: bool,
    pub success: bool,
    pub tx_hash: String,
    pub scheme: Scheme,
    pub network: Network,
    pub x402_version: X402Version,
    pub payment_request_id: String,
}

impl SettleSuccess {
    pub fn new(request: &NormalizedPaymentRequest, tx_hash: String) -> Self {
        SettleSuccess {
            settled: true,
            success: true,
            tx_hash,
            scheme: request.scheme,
            network: request.network,
            x402_version: request.x402_version,
            payment_request_id: request.payment_request_id.clone(),
        }
    }
}

/// Machine-readable error body: stable `code`, human `message`, optional details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorBody {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_accepts_optional_0x_prefix() {
        let hex64 = "ab".repeat(32);
        let bare: SessionId = hex64.parse().expect("bare hex parses");
        let prefixed: SessionId = format!("0x{hex64}").parse().expect("prefixed hex parses");
        assert_eq!(bare, prefixed);
        assert_eq!(bare.to_string(), format!("0x{hex64}"));
    }

    #[test]
    fn session_id_rejects_wrong_length() {
        assert!("abcd".parse::<SessionId>().is_err());
        assert!("zz".repeat(32).parse::<SessionId>().is_err());
    }

    #[test]
    fn token_amount_round_trips_as_decimal_string() {
        let amount: TokenAmount = serde_json::from_str("\"123456\"").expect("parses");
        assert_eq!(amount, TokenAmount::from(123456u64));
        assert_eq!(
            serde_json::to_string(&amount).expect("serializes"),
            "\"123456\""
        );
    }

    #[test]
    fn payment_payload_round_trips() {
        let json = serde_json::json!({
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
                "metadata": "svc:req:0001",
            },
        });
        let payload: PaymentPayload = serde_json::from_value(json).expect("deserializes");
        assert_eq!(payload.scheme, Scheme::GokiteAa);
        assert_eq!(payload.network, Network::KiteTestnet);
        assert_eq!(payload.payload.metadata.as_deref(), Some("svc:req:0001"));
        let value: U256 = payload.payload.authorization.value.into();
        assert_eq!(value, U256::from(1000u64));
    }
}
