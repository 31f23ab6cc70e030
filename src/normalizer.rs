//! Payload normalization: heterogeneous wire encodings in, one canonical record out.
//!
//! Clients submit payment evidence either as an explicit JSON envelope
//! (`{paymentPayload, paymentRequirements}`) or as a compact `xPayment` string that
//! may be raw JSON, standard base64, or URL-safe base64. Whatever the encoding, the
//! output is a single [`NormalizedPaymentRequest`], and every failure is a typed
//! [`NormalizeError`] carrying a stable machine-readable code. Untrusted input must
//! always resolve to a decidable outcome, so nothing in this module panics.
//!
//! Validation order is fixed:
//! 1. structural — authorization (all seven sub-fields), signature, 32-byte-hex
//!    session id;
//! 2. cross-field tuple — payload scheme/network must equal the requirement's;
//! 3. derivation — metadata bytes plus requirement fields copied onto the record.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::types::{
    NormalizedPaymentRequest, PaymentPayload, PaymentRequirement, SessionId,
};

/// The seven authorization sub-fields a structurally valid payload must carry.
const AUTHORIZATION_FIELDS: [&str; 7] = [
    "from",
    "to",
    "token",
    "value",
    "validAfter",
    "validBefore",
    "nonce",
];

/// Request body accepted by the facilitator's `/v2/verify` and `/v2/settle`
/// endpoints, and by the payment gate when evidence arrives in a header.
///
/// Exactly one of `payment_payload` (explicit envelope) or `x_payment` (compact
/// string form) is expected; when both are present the explicit envelope wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequestBody {
    #[serde(default)]
    pub payment_payload: Option<Value>,
    #[serde(default)]
    pub x_payment: Option<String>,
    pub payment_requirements: Value,
}

/// Typed normalization failure. Each variant maps to one stable wire code via
/// [`NormalizeError::code`].
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// The payload could not be decoded into a payment payload in any supported
    /// encoding, or a field failed typed validation.
    #[error("Invalid payment payload: {0}")]
    InvalidPaymentPayload(String),
    /// The accompanying payment requirements could not be parsed.
    #[error("Invalid payment requirements: {0}")]
    InvalidPaymentRequirements(String),
    /// A required authorization component is absent or malformed.
    #[error("Missing or invalid authorization component: {0}")]
    MissingAuthorization(&'static str),
    /// The payload declares a different scheme/network than the requirement.
    #[error("Payload {field} `{payload}` does not match requirement `{requirements}`")]
    TupleMismatch {
        field: &'static str,
        payload: String,
        requirements: String,
    },
}

impl NormalizeError {
    /// Stable machine-readable code for the wire error body.
    pub fn code(&self) -> String {
        match self {
            NormalizeError::InvalidPaymentPayload(_) => "invalid_payment_payload".to_string(),
            NormalizeError::InvalidPaymentRequirements(_) => {
                "invalid_payment_requirements".to_string()
            }
            NormalizeError::MissingAuthorization(_) => "missing_authorization".to_string(),
            NormalizeError::TupleMismatch { field, .. } => format!("tuple_mismatch_{field}"),
        }
    }

    /// Optional structured details, safe to return to the caller.
    pub fn details(&self) -> Option<Value> {
        match self {
            NormalizeError::MissingAuthorization(field) => {
                Some(serde_json::json!({ "field": field }))
            }
            NormalizeError::TupleMismatch {
                field,
                payload,
                requirements,
            } => Some(serde_json::json!({
                "field": field,
                "payload": payload,
                "requirements": requirements,
            })),
            _ => None,
        }
    }
}

/// Decodes the compact `xPayment` form into a JSON object.
///
/// Tries raw JSON, then standard base64, then URL-safe base64 (padded or not), and
/// accepts the first decoding that yields a JSON object. Non-object JSON (a bare
/// string or number that happens to parse) is not accepted as a payload.
pub fn decode_x_payment(raw: &str) -> Result<Value, NormalizeError> {
    let trimmed = raw.trim();

    if let Some(value) = try_json_object(trimmed.as_bytes()) {
        return Ok(value);
    }
    for engine in [&STANDARD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(decoded) = engine.decode(trimmed) {
            if let Some(value) = try_json_object(&decoded) {
                return Ok(value);
            }
        }
    }
    Err(NormalizeError::InvalidPaymentPayload(
        "xPayment is not a JSON object in any supported encoding".to_string(),
    ))
}

fn try_json_object(bytes: &[u8]) -> Option<Value> {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .filter(Value::is_object)
}

/// Normalizes a facilitator request body into the canonical payment record.
pub fn normalize(body: &PaymentRequestBody) -> Result<NormalizedPaymentRequest, NormalizeError> {
    let payload_value = match (&body.payment_payload, &body.x_payment) {
        (Some(value), _) => value.clone(),
        (None, Some(compact)) => decode_x_payment(compact)?,
        (None, None) => {
            return Err(NormalizeError::InvalidPaymentPayload(
                "neither paymentPayload nor xPayment present".to_string(),
            ));
        }
    };
    let requirement: PaymentRequirement =
        serde_json::from_value(body.payment_requirements.clone())
            .map_err(|e| NormalizeError::InvalidPaymentRequirements(e.to_string()))?;
    normalize_value(&payload_value, &requirement)
}

/// Normalizes an already-decoded payload JSON value against a requirement.
///
/// This is the path the payment gate uses: the gate owns its requirement and has
/// already extracted the payload from the `X-Payment` header.
pub fn normalize_value(
    payload_value: &Value,
    requirement: &PaymentRequirement,
) -> Result<NormalizedPaymentRequest, NormalizeError> {
    assert_structure(payload_value)?;

    let payload: PaymentPayload = serde_json::from_value(payload_value.clone())
        .map_err(|e| NormalizeError::InvalidPaymentPayload(e.to_string()))?;

    if payload.scheme != requirement.scheme {
        return Err(NormalizeError::TupleMismatch {
            field: "scheme",
            payload: payload.scheme.to_string(),
            requirements: requirement.scheme.to_string(),
        });
    }
    if payload.network != requirement.network {
        return Err(NormalizeError::TupleMismatch {
            field: "network",
            payload: payload.network.to_string(),
            requirements: requirement.network.to_string(),
        });
    }

    let metadata = payload.payload.metadata.unwrap_or_default();
    let metadata_bytes = format!("0x{}", hex::encode(metadata.as_bytes()));

    Ok(NormalizedPaymentRequest {
        x402_version: payload.x402_version,
        scheme: payload.scheme,
        network: payload.network,
        authorization: payload.payload.authorization,
        signature: payload.payload.signature,
        session_id: payload.payload.session_id,
        metadata,
        metadata_bytes,
        payment_request_id: requirement.payment_request_id.clone(),
        asset: requirement.asset,
        pay_to: requirement.pay_to,
        max_amount_required: requirement.max_amount_required,
    })
}

/// Structural pass: authorization with all seven sub-fields, a signature, and a
/// 32-byte-hex session id must be present before any typed parsing happens.
fn assert_structure(payload_value: &Value) -> Result<(), NormalizeError> {
    let envelope = payload_value
        .get("payload")
        .and_then(Value::as_object)
        .ok_or(NormalizeError::MissingAuthorization("payload"))?;

    let authorization = envelope
        .get("authorization")
        .and_then(Value::as_object)
        .ok_or(NormalizeError::MissingAuthorization("authorization"))?;
    for field in AUTHORIZATION_FIELDS {
        let present = authorization.get(field).is_some_and(|v| !v.is_null());
        if !present {
            return Err(NormalizeError::MissingAuthorization(field));
        }
    }

    if !envelope.get("signature").is_some_and(|v| !v.is_null()) {
        return Err(NormalizeError::MissingAuthorization("signature"));
    }

    let session_id = envelope
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingAuthorization("sessionId"))?;
    SessionId::from_str(session_id)
        .map_err(|_| NormalizeError::MissingAuthorization("sessionId"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Network, Scheme, TokenAmount};

    fn sample_payload() -> Value {
        serde_json::json!({
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
        })
    }

    fn sample_requirement() -> PaymentRequirement {
        PaymentRequirement {
            scheme: Scheme::GokiteAa,
            network: Network::KiteTestnet,
            asset: "0x00000000000000000000000000000000000000cc".parse().unwrap(),
            pay_to: "0x00000000000000000000000000000000000000bb".parse().unwrap(),
            max_amount_required: TokenAmount::from(1000u64),
            payment_request_id: "req-1".to_string(),
        }
    }

    fn body_with(payload: Option<Value>, x_payment: Option<String>) -> PaymentRequestBody {
        PaymentRequestBody {
            payment_payload: payload,
            x_payment,
            payment_requirements: serde_json::to_value(sample_requirement()).unwrap(),
        }
    }

    #[test]
    fn all_three_encodings_normalize_identically() {
        let raw = serde_json::to_string(&sample_payload()).unwrap();
        let b64 = STANDARD.encode(raw.as_bytes());
        let b64url = URL_SAFE.encode(raw.as_bytes());

        let from_raw = normalize(&body_with(None, Some(raw))).expect("raw json");
        let from_b64 = normalize(&body_with(None, Some(b64))).expect("base64");
        let from_b64url = normalize(&body_with(None, Some(b64url))).expect("base64url");
        let from_envelope = normalize(&body_with(Some(sample_payload()), None)).expect("envelope");

        for normalized in [&from_b64, &from_b64url, &from_envelope] {
            assert_eq!(normalized.session_id, from_raw.session_id);
            assert_eq!(normalized.metadata, from_raw.metadata);
            assert_eq!(normalized.metadata_bytes, from_raw.metadata_bytes);
            assert_eq!(normalized.payment_request_id, from_raw.payment_request_id);
            assert_eq!(normalized.authorization.nonce, from_raw.authorization.nonce);
        }
    }

    #[test]
    fn metadata_bytes_is_hex_of_utf8_metadata() {
        let normalized = normalize(&body_with(Some(sample_payload()), None)).unwrap();
        assert_eq!(normalized.metadata, "svc:req:0001");
        assert_eq!(
            normalized.metadata_bytes,
            format!("0x{}", hex::encode("svc:req:0001")),
        );
    }

    #[test]
    fn absent_metadata_derives_empty_bytes() {
        let mut payload = sample_payload();
        payload["payload"]
            .as_object_mut()
            .unwrap()
            .remove("metadata");
        let normalized = normalize(&body_with(Some(payload), None)).unwrap();
        assert_eq!(normalized.metadata, "");
        assert_eq!(normalized.metadata_bytes, "0x");
    }

    #[test]
    fn missing_authorization_field_is_reported() {
        let mut payload = sample_payload();
        payload["payload"]["authorization"]
            .as_object_mut()
            .unwrap()
            .remove("nonce");
        let err = normalize(&body_with(Some(payload), None)).unwrap_err();
        assert_eq!(err.code(), "missing_authorization");
        assert_eq!(err.details().unwrap()["field"], "nonce");
    }

    #[test]
    fn missing_signature_is_reported() {
        let mut payload = sample_payload();
        payload["payload"].as_object_mut().unwrap().remove("signature");
        let err = normalize(&body_with(Some(payload), None)).unwrap_err();
        assert_eq!(err.code(), "missing_authorization");
    }

    #[test]
    fn short_session_id_is_reported_as_missing_authorization() {
        let mut payload = sample_payload();
        payload["payload"]["sessionId"] = Value::String("abcd".to_string());
        let err = normalize(&body_with(Some(payload), None)).unwrap_err();
        assert_eq!(err.code(), "missing_authorization");
        assert_eq!(err.details().unwrap()["field"], "sessionId");
    }

    #[test]
    fn scheme_mismatch_names_the_field() {
        let mut payload = sample_payload();
        payload["scheme"] = Value::String("exact".to_string());
        let err = normalize(&body_with(Some(payload), None)).unwrap_err();
        assert_eq!(err.code(), "tuple_mismatch_scheme");
    }

    #[test]
    fn network_mismatch_names_the_field() {
        let mut payload = sample_payload();
        payload["network"] = Value::String("kite".to_string());
        let err = normalize(&body_with(Some(payload), None)).unwrap_err();
        assert_eq!(err.code(), "tuple_mismatch_network");
    }

    #[test]
    fn scheme_mismatch_wins_over_network_mismatch() {
        let mut payload = sample_payload();
        payload["scheme"] = Value::String("exact".to_string());
        payload["network"] = Value::String("kite".to_string());
        let err = normalize(&body_with(Some(payload), None)).unwrap_err();
        assert_eq!(err.code(), "tuple_mismatch_scheme");
    }

    #[test]
    fn garbage_x_payment_is_rejected_with_a_code() {
        let err = normalize(&body_with(None, Some("!!not-a-payload!!".to_string()))).unwrap_err();
        assert_eq!(err.code(), "invalid_payment_payload");
    }

    #[test]
    fn non_object_json_x_payment_is_rejected() {
        let err = normalize(&body_with(None, Some("42".to_string()))).unwrap_err();
        assert_eq!(err.code(), "invalid_payment_payload");
    }

    #[test]
    fn explicit_envelope_wins_over_x_payment() {
        let mut other = sample_payload();
        other["payload"]["metadata"] = Value::String("svc:req:0002".to_string());
        let body = PaymentRequestBody {
            payment_payload: Some(sample_payload()),
            x_payment: Some(serde_json::to_string(&other).unwrap()),
            payment_requirements: serde_json::to_value(sample_requirement()).unwrap(),
        };
        let normalized = normalize(&body).unwrap();
        assert_eq!(normalized.metadata, "svc:req:0001");
    }
}
