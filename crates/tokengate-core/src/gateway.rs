//! Event gateway: provider signature verification and payload parsing.
//!
//! Signatures use the processor's scheme: an `X-Webhook-Signature` header of
//! the form `t=<unix>,v1=<hex hmac-sha256>` where the MAC is computed over
//! `"{timestamp}.{raw body}"` with the shared webhook secret. Verification
//! is constant-time and bounded by a timestamp tolerance to reject replays.
//!
//! The gateway has no persistence side effects: a request either yields a
//! canonical [`WebhookEvent`] or is rejected before any ledger row exists.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::payment::PaymentEvent;
use crate::SettleError;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between the signature timestamp and now.
pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

/// Event kind that drives settlement. Everything else is acknowledged as a
/// no-op after being recorded.
pub const SETTLEMENT_EVENT_TYPE: &str = "checkout.session.completed";

/// Canonical record of one externally observed notification.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Verifies provider signatures and parses payloads into canonical events.
pub struct EventGateway {
    secret: Vec<u8>,
    tolerance_secs: u64,
}

impl EventGateway {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            tolerance_secs: SIGNATURE_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: u64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Verify the signature header and parse the body into a [`WebhookEvent`].
    /// Signature failures and malformed JSON are terminal for the request.
    pub fn accept(&self, body: &[u8], header: Option<&str>) -> Result<WebhookEvent, SettleError> {
        let header = header
            .ok_or_else(|| SettleError::Authentication("missing signature header".to_string()))?;
        self.verify_signature(body, header)?;
        self.parse_event(body)
    }

    /// Verify `t=...,v1=...` against the raw body using the current clock.
    pub fn verify_signature(&self, body: &[u8], header: &str) -> Result<(), SettleError> {
        let now = Utc::now().timestamp();
        self.verify_signature_at(body, header, now)
    }

    fn verify_signature_at(&self, body: &[u8], header: &str, now: i64) -> Result<(), SettleError> {
        let (timestamp, signature) = parse_signature_header(header)?;

        let skew = (now - timestamp).unsigned_abs();
        if skew > self.tolerance_secs {
            tracing::warn!(skew, "webhook signature timestamp outside tolerance");
            return Err(SettleError::Authentication(
                "signature timestamp outside tolerance".to_string(),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| SettleError::Config("invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);

        // Decode hex first — if invalid, compare against zeros to stay constant-time
        let expected = hex::decode(&signature).unwrap_or_else(|_| vec![0u8; 32]);

        // hmac crate's verify_slice uses constant-time comparison
        if mac.verify_slice(&expected).is_err() {
            tracing::warn!("webhook signature mismatch");
            return Err(SettleError::Authentication(
                "signature mismatch".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse an authenticated body into the canonical event record.
    pub fn parse_event(&self, body: &[u8]) -> Result<WebhookEvent, SettleError> {
        let envelope: EventEnvelope = serde_json::from_slice(body)
            .map_err(|e| SettleError::Validation(format!("malformed webhook payload: {e}")))?;

        if envelope.id.is_empty() {
            return Err(SettleError::Validation("empty event id".to_string()));
        }

        Ok(WebhookEvent {
            event_id: envelope.id,
            event_type: envelope.event_type,
            payload: envelope.data,
            received_at: Utc::now(),
        })
    }

    /// Build a signature header for the given body and timestamp. Used by
    /// tests and by processor simulators.
    pub fn signature_header(secret: &[u8], body: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }
}

fn parse_signature_header(header: &str) -> Result<(i64, String), SettleError> {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<String> = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => {
                timestamp = Some(v.parse().map_err(|_| {
                    SettleError::Authentication("invalid signature timestamp".to_string())
                })?);
            }
            Some(("v1", v)) => {
                if signature.is_none() {
                    signature = Some(v.to_string());
                }
            }
            _ => {} // unknown scheme versions are ignored
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) => Ok((t, s)),
        _ => Err(SettleError::Authentication(
            "malformed signature header".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    object: CheckoutObject,
}

#[derive(Debug, Deserialize)]
struct CheckoutObject {
    id: Option<String>,
    payment_intent: Option<String>,
    amount_subtotal: Option<i64>,
    amount_total: Option<i64>,
    currency: Option<String>,
    customer_email: Option<String>,
    #[serde(default)]
    metadata: CheckoutMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct CheckoutMetadata {
    #[serde(rename = "paymentReference")]
    payment_reference: Option<String>,
    #[serde(rename = "tokenAmount")]
    token_amount: Option<String>,
    #[serde(rename = "walletAddress")]
    wallet_address: Option<String>,
}

/// Adapt a settlement-driving event into the processor-agnostic
/// [`PaymentEvent`]. Returns `Ok(None)` for event kinds this pipeline
/// acknowledges without processing.
pub fn payment_event(event: &WebhookEvent) -> Result<Option<PaymentEvent>, SettleError> {
    if event.event_type != SETTLEMENT_EVENT_TYPE {
        return Ok(None);
    }

    let session: CheckoutSession = serde_json::from_value(event.payload.clone())
        .map_err(|e| SettleError::Validation(format!("malformed checkout session: {e}")))?;
    let object = session.object;

    let reference = object
        .metadata
        .payment_reference
        .filter(|r| !r.is_empty())
        .ok_or_else(|| SettleError::Validation("missing paymentReference metadata".to_string()))?;

    let token_amount: u64 = object
        .metadata
        .token_amount
        .as_deref()
        .ok_or_else(|| SettleError::Validation("missing tokenAmount metadata".to_string()))?
        .parse()
        .map_err(|_| SettleError::Validation("tokenAmount is not a positive integer".to_string()))?;
    if token_amount == 0 {
        return Err(SettleError::Validation(
            "tokenAmount must be positive".to_string(),
        ));
    }

    let wallet = object
        .metadata
        .wallet_address
        .as_deref()
        .ok_or_else(|| SettleError::Validation("missing walletAddress metadata".to_string()))?
        .parse()
        .map_err(|_| SettleError::Validation("invalid walletAddress".to_string()))?;

    let subtotal = object.amount_subtotal.unwrap_or(0);
    let total = object.amount_total.unwrap_or(subtotal);
    if subtotal < 0 || total < subtotal {
        return Err(SettleError::Validation(
            "inconsistent payment amounts".to_string(),
        ));
    }

    Ok(Some(PaymentEvent {
        event_id: event.event_id.clone(),
        payment_reference: reference,
        session_id: object.id,
        payment_intent_id: object.payment_intent,
        token_amount,
        price_per_token: subtotal / token_amount as i64,
        subtotal,
        processing_fee: total - subtotal,
        total_amount: total,
        currency: object.currency.unwrap_or_else(|| "usd".to_string()),
        user_wallet_address: wallet,
        user_email: object.customer_email,
    }))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(String::new(), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
            s
        })
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ()> {
        if s.len() % 2 != 0 || !s.is_ascii() {
            return Err(());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test123secret456";

    fn gateway() -> EventGateway {
        EventGateway::new(SECRET.to_vec())
    }

    fn session_body(reference: &str, token_amount: &str, wallet: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "payment_intent": "pi_1",
                "amount_subtotal": 5000,
                "amount_total": 5150,
                "currency": "usd",
                "customer_email": "buyer@example.com",
                "metadata": {
                    "paymentReference": reference,
                    "tokenAmount": token_amount,
                    "walletAddress": wallet,
                }
            }}
        }))
        .unwrap()
    }

    const WALLET: &str = "0x00000000000000000000000000000000000000aa";

    #[test]
    fn valid_signature_accepted() {
        let body = b"{\"id\":\"evt_1\",\"type\":\"noop\"}";
        let now = Utc::now().timestamp();
        let header = EventGateway::signature_header(SECRET, body, now);
        assert!(gateway().verify_signature(body, &header).is_ok());
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = b"{}";
        let now = Utc::now().timestamp();
        let header = EventGateway::signature_header(b"other-secret", body, now);
        let err = gateway().verify_signature(body, &header).unwrap_err();
        assert!(matches!(err, SettleError::Authentication(_)));
    }

    #[test]
    fn tampered_body_rejected() {
        let now = Utc::now().timestamp();
        let header = EventGateway::signature_header(SECRET, b"original", now);
        let err = gateway().verify_signature(b"tampered", &header).unwrap_err();
        assert!(matches!(err, SettleError::Authentication(_)));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let body = b"{}";
        let old = Utc::now().timestamp() - 600;
        let header = EventGateway::signature_header(SECRET, body, old);
        let err = gateway().verify_signature(body, &header).unwrap_err();
        assert!(matches!(err, SettleError::Authentication(_)));
    }

    #[test]
    fn widened_tolerance_accepts_older_timestamps() {
        let body = b"{}";
        let old = Utc::now().timestamp() - 600;
        let header = EventGateway::signature_header(SECRET, body, old);

        let relaxed = EventGateway::new(SECRET.to_vec()).with_tolerance(1000);
        assert!(relaxed.verify_signature(body, &header).is_ok());
    }

    #[test]
    fn missing_header_rejected_before_parsing() {
        let err = gateway().accept(b"{}", None).unwrap_err();
        assert!(matches!(err, SettleError::Authentication(_)));
    }

    #[test]
    fn malformed_header_rejected() {
        let err = gateway()
            .verify_signature(b"{}", "v1=deadbeef")
            .unwrap_err();
        assert!(matches!(err, SettleError::Authentication(_)));
    }

    #[test]
    fn invalid_hex_signature_rejected() {
        let now = Utc::now().timestamp();
        let err = gateway()
            .verify_signature(b"{}", &format!("t={now},v1=not-hex-zz"))
            .unwrap_err();
        assert!(matches!(err, SettleError::Authentication(_)));
    }

    #[test]
    fn malformed_json_is_validation_error() {
        let err = gateway().parse_event(b"not json").unwrap_err();
        assert!(matches!(err, SettleError::Validation(_)));
    }

    #[test]
    fn settlement_event_parses_to_payment_event() {
        let body = session_body("ref-1", "500", WALLET);
        let event = gateway().parse_event(&body).unwrap();
        let pe = payment_event(&event).unwrap().expect("settlement event");

        assert_eq!(pe.payment_reference, "ref-1");
        assert_eq!(pe.token_amount, 500);
        assert_eq!(pe.subtotal, 5000);
        assert_eq!(pe.processing_fee, 150);
        assert_eq!(pe.total_amount, 5150);
        assert_eq!(pe.price_per_token, 10);
        assert_eq!(pe.session_id.as_deref(), Some("cs_1"));
    }

    #[test]
    fn other_event_kinds_are_no_ops() {
        let body = serde_json::to_vec(&serde_json::json!({
            "id": "evt_2",
            "type": "charge.refund.updated",
            "data": {}
        }))
        .unwrap();
        let event = gateway().parse_event(&body).unwrap();
        assert!(payment_event(&event).unwrap().is_none());
    }

    #[test]
    fn missing_metadata_is_validation_error() {
        let body = serde_json::to_vec(&serde_json::json!({
            "id": "evt_3",
            "type": "checkout.session.completed",
            "data": { "object": { "metadata": {} } }
        }))
        .unwrap();
        let event = gateway().parse_event(&body).unwrap();
        let err = payment_event(&event).unwrap_err();
        assert!(matches!(err, SettleError::Validation(_)));
    }

    #[test]
    fn zero_token_amount_rejected() {
        let body = session_body("ref-z", "0", WALLET);
        let event = gateway().parse_event(&body).unwrap();
        let err = payment_event(&event).unwrap_err();
        assert!(matches!(err, SettleError::Validation(_)));
    }

    #[test]
    fn invalid_wallet_address_rejected() {
        let body = session_body("ref-w", "10", "not-an-address");
        let event = gateway().parse_event(&body).unwrap();
        let err = payment_event(&event).unwrap_err();
        assert!(matches!(err, SettleError::Validation(_)));
    }
}
