use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use overlay_alerts_core::{
    normalizer::{DonationEvent, Normalizer, Transition},
    retry::Backoff,
    types::{AlertRequest, DonationStatus, Provider, TransitionOutcome, WebhookEvent},
};
use overlay_alerts_storage::{CompletedWebhook, Database, WebhookEventError};

use crate::{alerts::AlertHub, router::Clock};

pub const SIGNATURE_MISMATCH: &str = "signature mismatch";
pub const RETRIES_EXHAUSTED: &str = "retries exhausted";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("webhook event {0} was never recorded")]
    UnknownEvent(String),
    #[error("webhook signature is invalid")]
    InvalidSignature,
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("transient failure on attempt {attempt}: {message}")]
    Transient {
        message: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    #[error("retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { message: String, attempts: u32 },
    #[error("webhook store unavailable: {0}")]
    Storage(#[from] WebhookEventError),
}

/// Receives events that will never be retried again.
pub trait FailureNotifier: Send + Sync {
    fn retries_exhausted(&self, event: &WebhookEvent, last_error: &str);
}

/// Default notifier: a structured error log plus a counter.
#[derive(Debug, Default)]
pub struct LogFailureNotifier;

impl FailureNotifier for LogFailureNotifier {
    fn retries_exhausted(&self, event: &WebhookEvent, last_error: &str) {
        counter!("webhook_retries_exhausted_total").increment(1);
        error!(
            stage = "retry",
            event_id = %event.event_id,
            provider = event.provider.as_str(),
            event_type = %event.event_type,
            max_retries = event.max_retries,
            last_error,
            "webhook event failed permanently"
        );
    }
}

enum Failure {
    Permanent(String),
    Transient(String),
}

fn transient(err: impl std::fmt::Display) -> Failure {
    Failure::Transient(err.to_string())
}

/// Applies recorded webhook events to donations, at most once per event id.
#[derive(Clone)]
pub struct Reconciler {
    storage: Database,
    backoff: Backoff,
    notifier: Arc<dyn FailureNotifier>,
    clock: Clock,
}

impl Reconciler {
    pub fn new(storage: Database, backoff: Backoff, clock: Clock) -> Self {
        Self {
            storage,
            backoff,
            notifier: Arc::new(LogFailureNotifier),
            clock,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Runs one attempt for `event_id`.
    ///
    /// Returns the alert to show when the donation became `completed` on this attempt, `None`
    /// when there is nothing to do (already terminal, claimed elsewhere, or no alert-worthy
    /// transition).
    pub async fn process(
        &self,
        event_id: &str,
        provider: Provider,
        event_type: &str,
        payload: &str,
        signature_valid: bool,
    ) -> Result<Option<AlertRequest>, ReconcileError> {
        let started = Instant::now();
        let now = (self.clock)();
        let events = self.storage.webhook_events();
        let event = events
            .fetch(event_id)
            .await?
            .ok_or_else(|| ReconcileError::UnknownEvent(event_id.to_string()))?;

        if event.status.is_terminal() {
            debug!(stage = "reconciler", event_id, status = event.status.as_str(), "event already settled");
            return Ok(None);
        }

        if !signature_valid {
            events.mark_failed(event_id, None, SIGNATURE_MISMATCH, now).await?;
            counter!("security_violations_total", "type" => "webhook_signature").increment(1);
            counter!("webhook_processed_total", "result" => "invalid_signature").increment(1);
            warn!(
                stage = "reconciler",
                event_id,
                provider = provider.as_str(),
                event_type,
                "webhook signature mismatch, event failed"
            );
            return Err(ReconcileError::InvalidSignature);
        }

        if !events.claim(event_id, now).await? {
            debug!(stage = "reconciler", event_id, "event claimed by another worker");
            return Ok(None);
        }

        match self.apply(event_id, provider, payload, started, now).await {
            Ok(alert) => {
                let result = if alert.is_some() { "alert" } else { "completed" };
                counter!("webhook_processed_total", "result" => result).increment(1);
                Ok(alert)
            }
            Err(Failure::Permanent(message)) => {
                events.mark_failed(event_id, None, &message, now).await?;
                counter!("webhook_processed_total", "result" => "failed").increment(1);
                warn!(stage = "reconciler", event_id, event_type, error = %message, "webhook event failed");
                Err(ReconcileError::Permanent(message))
            }
            Err(Failure::Transient(message)) => self.schedule_retry(&event, message, now).await,
        }
    }

    async fn schedule_retry(
        &self,
        event: &WebhookEvent,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertRequest>, ReconcileError> {
        let events = self.storage.webhook_events();
        let attempt = event.retry_count + 1;

        if attempt >= event.max_retries {
            events
                .mark_failed(&event.event_id, Some(attempt), RETRIES_EXHAUSTED, now)
                .await?;
            counter!("webhook_processed_total", "result" => "exhausted").increment(1);
            self.notifier.retries_exhausted(event, &message);
            return Err(ReconcileError::RetriesExhausted {
                message,
                attempts: attempt,
            });
        }

        let delay = ChronoDuration::from_std(self.backoff.delay(attempt))
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        let next_retry_at = now + delay;
        events
            .schedule_retry(&event.event_id, attempt, next_retry_at, &message, now)
            .await?;
        counter!("webhook_retries_total").increment(1);
        counter!("webhook_processed_total", "result" => "retry").increment(1);
        warn!(
            stage = "reconciler",
            event_id = %event.event_id,
            attempt,
            next_retry_at = %next_retry_at.to_rfc3339(),
            error = %message,
            "webhook processing deferred"
        );
        Err(ReconcileError::Transient {
            message,
            attempt,
            next_retry_at,
        })
    }

    async fn apply(
        &self,
        event_id: &str,
        provider: Provider,
        payload: &str,
        started: Instant,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertRequest>, Failure> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|err| Failure::Permanent(format!("invalid payload: {err}")))?;
        let normalized = Normalizer::normalize(provider, &value)
            .map_err(|err| Failure::Permanent(err.to_string()))?;

        let mut tx = self.storage.begin().await.map_err(transient)?;

        let Transition::To(target) = normalized.transition else {
            let processed = processed_data(&normalized, "ignored", None);
            self.complete(&mut tx, event_id, &processed, None, started, now)
                .await?;
            tx.commit().await.map_err(transient)?;
            info!(stage = "reconciler", event_id, event_type = %normalized.event_type, "event type ignored");
            return Ok(None);
        };

        let reference = normalized
            .donation_ref
            .as_ref()
            .ok_or_else(|| Failure::Permanent("missing donation reference".to_string()))?;
        let donations = self.storage.donations();
        let mut donation = donations
            .find_by_reference(&mut tx, reference)
            .await
            .map_err(transient)?
            .ok_or_else(|| {
                Failure::Transient(format!("donation not found for {}", reference.as_str()))
            })?;

        let outcome = donation
            .apply(target, now)
            .map_err(|err| Failure::Permanent(err.to_string()))?;

        let (from, to) = match outcome {
            TransitionOutcome::Unchanged => {
                let processed = processed_data(&normalized, "unchanged", Some(&donation.id));
                self.complete(&mut tx, event_id, &processed, Some(&donation.id), started, now)
                    .await?;
                tx.commit().await.map_err(transient)?;
                debug!(stage = "reconciler", event_id, donation_id = %donation.id, "donation already in target state");
                return Ok(None);
            }
            TransitionOutcome::Transitioned { from, to } => (from, to),
        };

        if !donations
            .update_status(&mut tx, &donation, from)
            .await
            .map_err(transient)?
        {
            return Err(Failure::Transient(format!(
                "donation {} changed concurrently",
                donation.id
            )));
        }
        let processed = processed_data(&normalized, to.as_str(), Some(&donation.id));
        self.complete(&mut tx, event_id, &processed, Some(&donation.id), started, now)
            .await?;
        tx.commit().await.map_err(transient)?;

        info!(
            stage = "reconciler",
            event_id,
            donation_id = %donation.id,
            streamer_id = %donation.streamer_id,
            from = from.as_str(),
            to = to.as_str(),
            "donation transitioned"
        );

        Ok((to == DonationStatus::Completed).then(|| donation.alert_request()))
    }

    async fn complete(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        event_id: &str,
        processed: &Value,
        donation_id: Option<&str>,
        started: Instant,
        now: DateTime<Utc>,
    ) -> Result<(), Failure> {
        self.storage
            .webhook_events()
            .complete(
                tx,
                event_id,
                CompletedWebhook {
                    processed_data: processed,
                    related_donation_id: donation_id,
                    processing_time_ms: started.elapsed().as_millis() as i64,
                    completed_at: now,
                },
            )
            .await
            .map_err(transient)
    }
}

fn processed_data(event: &DonationEvent, transition: &str, donation_id: Option<&str>) -> Value {
    json!({
        "eventType": event.event_type,
        "transition": transition,
        "donationId": donation_id,
        "donationRef": event.donation_ref.as_ref().map(|reference| reference.as_str()),
        "occurredAt": event.occurred_at.map(|at| at.to_rfc3339()),
    })
}

/// Hands a reconciled alert to the hub. Delivery problems never reach the donation.
pub async fn dispatch_alert(alerts: &AlertHub, storage: &Database, request: AlertRequest) {
    let streamer_id = request.streamer_id.clone();
    if let Err(err) = alerts.submit(storage, request).await {
        warn!(stage = "reconciler", %streamer_id, error = %err, "alert not queued");
    }
}
