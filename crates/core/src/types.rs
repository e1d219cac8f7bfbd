use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Default number of attempts before a webhook event is failed permanently.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default on-screen duration of an alert.
pub const DEFAULT_ALERT_DURATION_MS: u64 = 5_000;
/// Default upper bound of simultaneous overlay connections per streamer.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Invariant violations detected while constructing or mutating domain values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("amount must be greater than zero (got {0})")]
    NonPositiveAmount(i64),
    #[error("unsupported {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("invalid level range [{min}, {max})")]
    InvalidRange { min: i64, max: i64 },
    #[error("donation cannot move from {from} to {to}")]
    InvalidTransition {
        from: DonationStatus,
        to: DonationStatus,
    },
}

fn unknown(kind: &'static str, value: &str) -> DomainError {
    DomainError::UnknownVariant {
        kind,
        value: value.to_string(),
    }
}

/// Payment provider pushing webhook notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Stripe,
    PayPal,
    Custom,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::PayPal => "paypal",
            Self::Custom => "custom",
        }
    }

    /// Header carrying the provider signature.
    pub fn signature_header(self) -> &'static str {
        match self {
            Self::Stripe => "stripe-signature",
            Self::PayPal => "paypal-signature",
            Self::Custom => "x-signature",
        }
    }
}

impl FromStr for Provider {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::PayPal),
            "custom" => Ok(Self::Custom),
            other => Err(unknown("provider", other)),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a persisted webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Received,
    Verifying,
    Processing,
    Completed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Verifying => "verifying",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns `true` once no further processing will happen for the event.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for WebhookStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "received" => Ok(Self::Received),
            "verifying" => Ok(Self::Verifying),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(unknown("webhook status", other)),
        }
    }
}

/// Durable audit record of one provider notification, keyed by the provider event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event_id: String,
    pub provider: Provider,
    pub event_type: String,
    pub status: WebhookStatus,
    pub raw_payload: String,
    pub processed_data: Option<Value>,
    pub signature: String,
    pub signature_valid: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
    pub related_donation_id: Option<String>,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Donation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DonationStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Disputed,
}

impl DonationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Disputed => "disputed",
        }
    }

    /// Transitions only move forward along `pending -> {completed|failed|cancelled} -> disputed`.
    pub fn can_transition_to(self, next: DonationStatus) -> bool {
        use DonationStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Completed, Disputed)
                | (Failed, Disputed)
                | (Cancelled, Disputed)
        )
    }
}

impl FromStr for DonationStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "disputed" => Ok(Self::Disputed),
            other => Err(unknown("donation status", other)),
        }
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Currencies accepted for donations and tier configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Krw,
    Usd,
    Eur,
    Jpy,
    Gbp,
    Cad,
    Aud,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Krw => "KRW",
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Jpy => "JPY",
            Self::Gbp => "GBP",
            Self::Cad => "CAD",
            Self::Aud => "AUD",
        }
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "KRW" => Ok(Self::Krw),
            "USD" => Ok(Self::Usd),
            "EUR" => Ok(Self::Eur),
            "JPY" => Ok(Self::Jpy),
            "GBP" => Ok(Self::Gbp),
            "CAD" => Ok(Self::Cad),
            "AUD" => Ok(Self::Aud),
            _ => Err(unknown("currency", value)),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Paypal,
    BankTransfer,
    Crypto,
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Paypal => "paypal",
            Self::BankTransfer => "bank_transfer",
            Self::Crypto => "crypto",
            Self::Other => "other",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "card" => Ok(Self::Card),
            "paypal" => Ok(Self::Paypal),
            "bank_transfer" => Ok(Self::BankTransfer),
            "crypto" => Ok(Self::Crypto),
            "other" => Ok(Self::Other),
            other => Err(unknown("payment method", other)),
        }
    }
}

/// Donation aggregate. Created by checkout, mutated only by webhook reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: String,
    pub donor_id: Option<String>,
    pub donor_name: Option<String>,
    pub streamer_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub message: Option<String>,
    pub status: DonationStatus,
    pub payment_method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Outcome of applying a status change to a donation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Transitioned {
        from: DonationStatus,
        to: DonationStatus,
    },
    Unchanged,
}

impl Donation {
    /// Creates a pending donation, rejecting non-positive amounts.
    pub fn pending(
        streamer_id: impl Into<String>,
        amount: i64,
        currency: Currency,
        payment_method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if amount <= 0 {
            return Err(DomainError::NonPositiveAmount(amount));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            donor_id: None,
            donor_name: None,
            streamer_id: streamer_id.into(),
            amount,
            currency,
            message: None,
            status: DonationStatus::Pending,
            payment_method,
            transaction_id: None,
            is_anonymous: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
        })
    }

    pub fn with_donor(mut self, donor_id: Option<String>, donor_name: impl Into<String>) -> Self {
        self.donor_id = donor_id;
        self.donor_name = Some(donor_name.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.is_anonymous = true;
        self
    }

    /// Moves the donation to `next`, enforcing monotonic transitions.
    ///
    /// Re-applying the current status is reported as [`TransitionOutcome::Unchanged`] so that
    /// repeated provider notifications never produce a second completion.
    pub fn apply(
        &mut self,
        next: DonationStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DomainError> {
        if self.status == next {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let from = self.status;
        self.status = next;
        self.updated_at = now;
        match next {
            DonationStatus::Completed => self.completed_at = Some(now),
            DonationStatus::Failed => self.failed_at = Some(now),
            _ => {}
        }
        Ok(TransitionOutcome::Transitioned { from, to: next })
    }

    /// Name shown on the overlay.
    pub fn display_name(&self) -> String {
        if self.is_anonymous {
            return ANONYMOUS_DONOR.to_string();
        }
        self.donor_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS_DONOR.to_string())
    }

    pub fn alert_request(&self) -> AlertRequest {
        AlertRequest {
            streamer_id: self.streamer_id.clone(),
            donor_name: self.display_name(),
            amount: self.amount,
            currency: self.currency,
            message: self.message.clone(),
            donation_id: Some(self.id.clone()),
        }
    }
}

pub const ANONYMOUS_DONOR: &str = "Anonymous";

/// Visual configuration handed to the overlay with each alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisualConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_id: Option<String>,
    pub duration_ms: u64,
    pub sound_url: Option<String>,
    pub image_url: Option<String>,
    pub animation: String,
    pub text_template: String,
    pub text_color: String,
    pub tts_enabled: bool,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            level_id: None,
            duration_ms: DEFAULT_ALERT_DURATION_MS,
            sound_url: None,
            image_url: None,
            animation: "fade".to_string(),
            text_template: "{donor} donated {amount} {currency}".to_string(),
            text_color: "#ffffff".to_string(),
            tts_enabled: false,
        }
    }
}

impl VisualConfig {
    /// Applies the level overrides on top of this configuration.
    pub fn with_overrides(mut self, overrides: &VisualOverrides) -> Self {
        if let Some(duration_ms) = overrides.duration_ms {
            self.duration_ms = duration_ms;
        }
        if let Some(sound_url) = &overrides.sound_url {
            self.sound_url = Some(sound_url.clone());
        }
        if let Some(image_url) = &overrides.image_url {
            self.image_url = Some(image_url.clone());
        }
        if let Some(animation) = &overrides.animation {
            self.animation = animation.clone();
        }
        if let Some(text_template) = &overrides.text_template {
            self.text_template = text_template.clone();
        }
        if let Some(text_color) = &overrides.text_color {
            self.text_color = text_color.clone();
        }
        if let Some(tts_enabled) = overrides.tts_enabled {
            self.tts_enabled = tts_enabled;
        }
        self
    }

    pub fn display_duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Per-level overrides of the streamer's default [`VisualConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisualOverrides {
    pub duration_ms: Option<u64>,
    pub sound_url: Option<String>,
    pub image_url: Option<String>,
    pub animation: Option<String>,
    pub text_template: Option<String>,
    pub text_color: Option<String>,
    pub tts_enabled: Option<bool>,
}

/// Amount-range keyed tier configured by a streamer. The range is half-open: `[min, max)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationLevel {
    pub level_id: String,
    pub streamer_id: String,
    pub min_amount: i64,
    pub max_amount: i64,
    pub currency: Currency,
    pub is_enabled: bool,
    pub configuration: VisualOverrides,
}

impl DonationLevel {
    pub fn new(
        level_id: impl Into<String>,
        streamer_id: impl Into<String>,
        min_amount: i64,
        max_amount: i64,
        currency: Currency,
    ) -> Result<Self, DomainError> {
        if min_amount < 0 || min_amount >= max_amount {
            return Err(DomainError::InvalidRange {
                min: min_amount,
                max: max_amount,
            });
        }
        Ok(Self {
            level_id: level_id.into(),
            streamer_id: streamer_id.into(),
            min_amount,
            max_amount,
            currency,
            is_enabled: true,
            configuration: VisualOverrides::default(),
        })
    }

    pub fn with_configuration(mut self, configuration: VisualOverrides) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }

    pub fn matches(&self, amount: i64, currency: Currency) -> bool {
        self.is_enabled
            && self.currency == currency
            && amount >= self.min_amount
            && amount < self.max_amount
    }
}

/// Request emitted by reconciliation (or the public trigger) to show an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRequest {
    pub streamer_id: String,
    pub donor_name: String,
    pub amount: i64,
    pub currency: Currency,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Queued,
    Delivering,
    Displaying,
    Completed,
    Expired,
}

impl AlertState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivering => "delivering",
            Self::Displaying => "displaying",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Delivering | Self::Displaying)
    }
}

/// In-memory queue entry owned by exactly one streamer queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertJob {
    pub alert_id: String,
    pub streamer_id: String,
    pub donor_name: String,
    pub amount: i64,
    pub currency: Currency,
    pub message: Option<String>,
    #[serde(rename = "config")]
    pub resolved_config: VisualConfig,
    #[serde(skip)]
    pub state: AlertState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub donation_id: Option<String>,
}

impl AlertJob {
    pub fn new(
        alert_id: impl Into<String>,
        request: AlertRequest,
        resolved_config: VisualConfig,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            alert_id: alert_id.into(),
            streamer_id: request.streamer_id,
            donor_name: request.donor_name,
            amount: request.amount,
            currency: request.currency,
            message: request.message,
            resolved_config,
            state: AlertState::Queued,
            enqueued_at,
            delivery_deadline: None,
            donation_id: request.donation_id,
        }
    }
}

/// Per-streamer security configuration for the overlay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettings {
    pub alert_token: String,
    pub is_token_revoked: bool,
    pub allowed_ips: Vec<String>,
    pub max_connections: u32,
    pub require_ip_validation: bool,
    pub require_request_signing: bool,
    #[serde(skip_serializing)]
    pub request_signature_secret: Option<String>,
}

impl SecuritySettings {
    pub fn with_token(alert_token: impl Into<String>) -> Self {
        Self {
            alert_token: alert_token.into(),
            is_token_revoked: false,
            allowed_ips: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            require_ip_validation: false,
            require_request_signing: false,
            request_signature_secret: None,
        }
    }
}

/// Streamer profile as seen by the alert pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamerProfile {
    pub streamer_id: String,
    pub display_name: String,
    pub security: SecuritySettings,
    pub default_alert: VisualConfig,
}

/// Category of a recorded security violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    InvalidToken,
    TokenRevoked,
    IpBlocked,
    RateLimitExceeded,
    ReplayDetected,
    SignatureMismatch,
    StaleTimestamp,
    ConnectionLimit,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::TokenRevoked => "token_revoked",
            Self::IpBlocked => "ip_blocked",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ReplayDetected => "replay_detected",
            Self::SignatureMismatch => "signature_mismatch",
            Self::StaleTimestamp => "stale_timestamp",
            Self::ConnectionLimit => "connection_limit",
        }
    }
}

impl FromStr for ViolationKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "invalid_token" => Ok(Self::InvalidToken),
            "token_revoked" => Ok(Self::TokenRevoked),
            "ip_blocked" => Ok(Self::IpBlocked),
            "rate_limit_exceeded" => Ok(Self::RateLimitExceeded),
            "replay_detected" => Ok(Self::ReplayDetected),
            "signature_mismatch" => Ok(Self::SignatureMismatch),
            "stale_timestamp" => Ok(Self::StaleTimestamp),
            "connection_limit" => Ok(Self::ConnectionLimit),
            other => Err(unknown("violation kind", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityViolation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub timestamp: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn pending_rejects_non_positive_amount() {
        let err = Donation::pending("s-1", 0, Currency::Krw, PaymentMethod::Card, now())
            .unwrap_err();
        assert_eq!(err, DomainError::NonPositiveAmount(0));
    }

    #[test]
    fn transitions_are_monotonic() {
        let mut donation =
            Donation::pending("s-1", 1000, Currency::Krw, PaymentMethod::Card, now()).unwrap();

        let outcome = donation.apply(DonationStatus::Completed, now()).unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Transitioned {
                from: DonationStatus::Pending,
                to: DonationStatus::Completed
            }
        );
        assert_eq!(donation.completed_at, Some(now()));
        assert!(donation.failed_at.is_none());

        let err = donation.apply(DonationStatus::Pending, now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        let err = donation.apply(DonationStatus::Failed, now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));

        assert_eq!(
            donation.apply(DonationStatus::Completed, now()).unwrap(),
            TransitionOutcome::Unchanged
        );
        assert!(matches!(
            donation.apply(DonationStatus::Disputed, now()).unwrap(),
            TransitionOutcome::Transitioned { .. }
        ));
    }

    #[test]
    fn anonymous_donations_hide_donor_name() {
        let donation = Donation::pending("s-1", 500, Currency::Usd, PaymentMethod::Card, now())
            .unwrap()
            .with_donor(Some("d-1".into()), "Alice")
            .anonymous();
        assert_eq!(donation.alert_request().donor_name, ANONYMOUS_DONOR);
    }

    #[test]
    fn level_range_is_half_open() {
        let level = DonationLevel::new("l-1", "s-1", 0, 50_000, Currency::Krw).unwrap();
        assert!(level.matches(0, Currency::Krw));
        assert!(level.matches(49_999, Currency::Krw));
        assert!(!level.matches(50_000, Currency::Krw));
        assert!(!level.matches(10, Currency::Usd));
        assert!(DonationLevel::new("l-2", "s-1", 10, 10, Currency::Krw).is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let overrides = VisualOverrides {
            duration_ms: Some(8_000),
            animation: Some("bounce".into()),
            ..VisualOverrides::default()
        };
        let config = VisualConfig::default().with_overrides(&overrides);
        assert_eq!(config.duration_ms, 8_000);
        assert_eq!(config.animation, "bounce");
        assert_eq!(config.text_color, "#ffffff");
    }

    #[test]
    fn currency_parsing_is_case_insensitive() {
        assert_eq!("krw".parse::<Currency>().unwrap(), Currency::Krw);
        assert!("XYZ".parse::<Currency>().is_err());
    }
}
