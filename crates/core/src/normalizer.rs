use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{DonationStatus, Provider};

/// Errors that can occur while decoding provider webhook payloads.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp for field '{field}': {source}")]
    InvalidTimestamp {
        field: &'static str,
        source: chrono::ParseError,
    },
}

/// How a webhook refers to the donation it is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DonationRef {
    /// Internal donation id carried in provider metadata.
    DonationId(String),
    /// Provider-side transaction id.
    TransactionId(String),
}

impl DonationRef {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DonationId(id) | Self::TransactionId(id) => id,
        }
    }
}

/// Donation state change requested by a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(DonationStatus),
    Ignored,
}

/// Provider-agnostic view of a payment notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DonationEvent {
    pub event_id: String,
    pub provider: Provider,
    pub event_type: String,
    pub donation_ref: Option<DonationRef>,
    pub transition: Transition,
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Raw provider payloads, one variant per provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Stripe(StripeEvent),
    PayPal(PayPalEvent),
    Custom(CustomEvent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub data: Option<StripeData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeData {
    #[serde(default)]
    pub object: Option<StripeObject>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeObject {
    #[serde(default)]
    pub id: Option<String>,
    /// Set on disputes and refunds, whose own `id` is not the charge.
    #[serde(default)]
    pub charge: Option<String>,
    #[serde(default)]
    pub metadata: Option<StripeMetadata>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeMetadata {
    #[serde(default)]
    pub donation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PayPalEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub resource: Option<PayPalResource>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PayPalResource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub disputed_transactions: Vec<PayPalDisputedTransaction>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PayPalDisputedTransaction {
    #[serde(default)]
    pub seller_transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub data: Option<CustomData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomData {
    #[serde(default)]
    pub donation_id: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl ProviderEvent {
    /// Decodes the provider envelope. Fails when `id` or the event type is missing.
    pub fn decode(provider: Provider, payload: &Value) -> Result<Self, NormalizerError> {
        Ok(match provider {
            Provider::Stripe => Self::Stripe(serde_json::from_value(payload.clone())?),
            Provider::PayPal => Self::PayPal(serde_json::from_value(payload.clone())?),
            Provider::Custom => Self::Custom(serde_json::from_value(payload.clone())?),
        })
    }

    pub fn from_slice(provider: Provider, body: &[u8]) -> Result<Self, NormalizerError> {
        let payload: Value = serde_json::from_slice(body)?;
        Self::decode(provider, &payload)
    }

    pub fn provider(&self) -> Provider {
        match self {
            Self::Stripe(_) => Provider::Stripe,
            Self::PayPal(_) => Provider::PayPal,
            Self::Custom(_) => Provider::Custom,
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            Self::Stripe(event) => &event.id,
            Self::PayPal(event) => &event.id,
            Self::Custom(event) => &event.id,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::Stripe(event) => &event.event_type,
            Self::PayPal(event) => &event.event_type,
            Self::Custom(event) => &event.event_type,
        }
    }
}

/// Deterministic normalizer turning provider payloads into [`DonationEvent`] values.
pub struct Normalizer;

impl Normalizer {
    pub fn normalize(provider: Provider, payload: &Value) -> Result<DonationEvent, NormalizerError> {
        Self::normalize_event(ProviderEvent::decode(provider, payload)?)
    }

    pub fn normalize_event(event: ProviderEvent) -> Result<DonationEvent, NormalizerError> {
        let provider = event.provider();
        let (event_id, event_type, donation_ref, occurred_at, transition) = match event {
            ProviderEvent::Stripe(event) => {
                let object = event.data.and_then(|data| data.object);
                let donation_ref = object.and_then(|object| {
                    object
                        .metadata
                        .and_then(|metadata| metadata.donation_id)
                        .map(DonationRef::DonationId)
                        .or(object.charge.or(object.id).map(DonationRef::TransactionId))
                });
                let occurred_at = event
                    .created
                    .and_then(|seconds| DateTime::from_timestamp(seconds, 0));
                let transition = stripe_transition(&event.event_type);
                (event.id, event.event_type, donation_ref, occurred_at, transition)
            }
            ProviderEvent::PayPal(event) => {
                let donation_ref = event.resource.and_then(|resource| {
                    let disputed = resource
                        .disputed_transactions
                        .into_iter()
                        .find_map(|transaction| transaction.seller_transaction_id);
                    resource
                        .custom_id
                        .map(DonationRef::DonationId)
                        .or(disputed.or(resource.id).map(DonationRef::TransactionId))
                });
                let occurred_at = parse_time("create_time", event.create_time.as_deref())?;
                let transition = paypal_transition(&event.event_type);
                (event.id, event.event_type, donation_ref, occurred_at, transition)
            }
            ProviderEvent::Custom(event) => {
                let donation_ref = event.data.and_then(|data| {
                    data.donation_id
                        .map(DonationRef::DonationId)
                        .or(data.transaction_id.map(DonationRef::TransactionId))
                });
                let occurred_at = parse_time("created_at", event.created_at.as_deref())?;
                let transition = custom_transition(&event.event_type);
                (event.id, event.event_type, donation_ref, occurred_at, transition)
            }
        };

        if matches!(transition, Transition::To(_)) && donation_ref.is_none() {
            return Err(NormalizerError::MissingField("donation reference"));
        }

        Ok(DonationEvent {
            event_id,
            provider,
            event_type,
            donation_ref,
            transition,
            occurred_at,
        })
    }
}

fn stripe_transition(event_type: &str) -> Transition {
    match event_type {
        "charge.succeeded" | "payment_intent.succeeded" | "checkout.session.completed" => {
            Transition::To(DonationStatus::Completed)
        }
        "charge.failed" | "payment_intent.payment_failed" => Transition::To(DonationStatus::Failed),
        "payment_intent.canceled" => Transition::To(DonationStatus::Cancelled),
        "charge.dispute.created" => Transition::To(DonationStatus::Disputed),
        _ => Transition::Ignored,
    }
}

fn paypal_transition(event_type: &str) -> Transition {
    match event_type {
        "PAYMENT.CAPTURE.COMPLETED" => Transition::To(DonationStatus::Completed),
        "PAYMENT.CAPTURE.DENIED" => Transition::To(DonationStatus::Failed),
        "PAYMENT.CAPTURE.REVERSED" | "CUSTOMER.DISPUTE.CREATED" => {
            Transition::To(DonationStatus::Disputed)
        }
        _ => Transition::Ignored,
    }
}

fn custom_transition(event_type: &str) -> Transition {
    match event_type {
        "donation.completed" => Transition::To(DonationStatus::Completed),
        "donation.failed" => Transition::To(DonationStatus::Failed),
        "donation.cancelled" => Transition::To(DonationStatus::Cancelled),
        "donation.disputed" => Transition::To(DonationStatus::Disputed),
        _ => Transition::Ignored,
    }
}

fn parse_time(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, NormalizerError> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|source| NormalizerError::InvalidTimestamp { field, source })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stripe_prefers_metadata_donation_id() {
        let payload = json!({
            "id": "evt_1",
            "type": "charge.succeeded",
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "id": "ch_1",
                    "metadata": { "donation_id": "don-1" }
                }
            }
        });

        let event = Normalizer::normalize(Provider::Stripe, &payload).expect("normalize stripe");
        assert_eq!(event.event_id, "evt_1");
        assert_eq!(event.donation_ref, Some(DonationRef::DonationId("don-1".into())));
        assert_eq!(event.transition, Transition::To(DonationStatus::Completed));
        assert_eq!(event.occurred_at.map(|at| at.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn stripe_falls_back_to_object_id() {
        let payload = json!({
            "id": "evt_2",
            "type": "charge.failed",
            "data": { "object": { "id": "ch_2", "object": "charge" } }
        });
        let event = Normalizer::normalize(Provider::Stripe, &payload).expect("normalize stripe");
        assert_eq!(event.donation_ref, Some(DonationRef::TransactionId("ch_2".into())));
        assert_eq!(event.transition, Transition::To(DonationStatus::Failed));
    }

    #[test]
    fn stripe_dispute_refers_to_the_disputed_charge() {
        let payload = json!({
            "id": "evt_3",
            "object": "event",
            "type": "charge.dispute.created",
            "created": 1_700_000_500,
            "data": {
                "object": {
                    "id": "dp_123",
                    "object": "dispute",
                    "amount": 5000,
                    "charge": "ch_1",
                    "currency": "krw",
                    "metadata": {},
                    "reason": "fraudulent",
                    "status": "needs_response"
                }
            }
        });
        let event = Normalizer::normalize(Provider::Stripe, &payload).expect("normalize stripe");
        assert_eq!(event.donation_ref, Some(DonationRef::TransactionId("ch_1".into())));
        assert_eq!(event.transition, Transition::To(DonationStatus::Disputed));
    }

    #[test]
    fn paypal_dispute_refers_to_the_seller_transaction() {
        let payload = json!({
            "id": "WH-4",
            "event_type": "CUSTOMER.DISPUTE.CREATED",
            "create_time": "2024-01-02T00:00:00Z",
            "resource": {
                "dispute_id": "PP-D-1",
                "reason": "MERCHANDISE_OR_SERVICE_NOT_RECEIVED",
                "status": "OPEN",
                "disputed_transactions": [
                    { "buyer_transaction_id": "BUY-1", "seller_transaction_id": "cap-7" }
                ]
            }
        });
        let event = Normalizer::normalize(Provider::PayPal, &payload).expect("normalize paypal");
        assert_eq!(event.donation_ref, Some(DonationRef::TransactionId("cap-7".into())));
        assert_eq!(event.transition, Transition::To(DonationStatus::Disputed));
    }

    #[test]
    fn paypal_capture_completed() {
        let payload = json!({
            "id": "WH-1",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "create_time": "2024-01-01T00:00:00Z",
            "resource": { "id": "cap-1", "custom_id": "don-9" }
        });
        let event = Normalizer::normalize(Provider::PayPal, &payload).expect("normalize paypal");
        assert_eq!(event.donation_ref, Some(DonationRef::DonationId("don-9".into())));
        assert_eq!(event.transition, Transition::To(DonationStatus::Completed));
        assert!(event.occurred_at.is_some());
    }

    #[test]
    fn custom_uses_transaction_id_when_donation_id_absent() {
        let payload = json!({
            "id": "c-1",
            "type": "donation.failed",
            "data": { "transaction_id": "tx-1" }
        });
        let event = Normalizer::normalize(Provider::Custom, &payload).expect("normalize custom");
        assert_eq!(event.donation_ref, Some(DonationRef::TransactionId("tx-1".into())));
        assert_eq!(event.transition, Transition::To(DonationStatus::Failed));
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let payload = json!({ "id": "evt_3", "type": "customer.created" });
        let event = Normalizer::normalize(Provider::Stripe, &payload).expect("normalize stripe");
        assert_eq!(event.transition, Transition::Ignored);
        assert!(event.donation_ref.is_none());
    }

    #[test]
    fn known_event_without_reference_is_rejected() {
        let payload = json!({ "id": "evt_4", "type": "charge.succeeded", "data": {} });
        let err = Normalizer::normalize(Provider::Stripe, &payload).unwrap_err();
        assert!(matches!(err, NormalizerError::MissingField(_)));
    }

    #[test]
    fn envelope_requires_id_and_type() {
        let err = ProviderEvent::from_slice(Provider::Custom, br#"{"type":"donation.completed"}"#)
            .unwrap_err();
        assert!(matches!(err, NormalizerError::Json(_)));

        let event = ProviderEvent::from_slice(Provider::PayPal, br#"{"id":"a","event_type":"X"}"#)
            .expect("decode");
        assert_eq!(event.event_id(), "a");
        assert_eq!(event.event_type(), "X");
    }

    #[test]
    fn invalid_timestamp_is_reported() {
        let payload = json!({ "id": "c-2", "type": "donation.completed", "created_at": "yesterday",
            "data": { "donation_id": "d" } });
        let err = Normalizer::normalize(Provider::Custom, &payload).unwrap_err();
        assert!(matches!(err, NormalizerError::InvalidTimestamp { field: "created_at", .. }));
    }
}
