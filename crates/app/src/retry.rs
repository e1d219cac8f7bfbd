use std::time::Duration;

use chrono::Duration as ChronoDuration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use overlay_alerts_storage::{Database, WebhookEventError};
use overlay_alerts_util::WebhookConfig;

use crate::{
    alerts::AlertHub,
    reconciler::{dispatch_alert, ReconcileError, Reconciler},
    router::Clock,
};

/// Events left in `processing`, or recorded and never claimed, this long are assumed abandoned.
const STALE_PROCESSING: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("failed to release stale events: {0}")]
    Release(#[source] WebhookEventError),
    #[error("failed to load due events: {0}")]
    Load(#[source] WebhookEventError),
}

/// Outcome counts for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrySweep {
    pub released: u64,
    pub due: usize,
    pub alerts: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

/// Background worker that re-runs webhook events whose `next_retry_at` has passed.
#[derive(Clone)]
pub struct RetryScheduler {
    storage: Database,
    reconciler: Reconciler,
    alerts: AlertHub,
    clock: Clock,
    interval: Duration,
    batch_size: u32,
}

impl RetryScheduler {
    pub fn new(
        storage: Database,
        reconciler: Reconciler,
        alerts: AlertHub,
        clock: Clock,
        config: &WebhookConfig,
    ) -> Self {
        Self {
            storage,
            reconciler,
            alerts,
            clock,
            interval: config.sweep_interval,
            batch_size: config.batch_size,
        }
    }

    /// Runs the sweep loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "retry", error = %err, "retry sweep failed");
            }
        }
    }

    /// Releases abandoned claims, then retries every due event once.
    pub async fn run_once(&self) -> Result<RetrySweep, RetryError> {
        let now = (self.clock)();
        let events = self.storage.webhook_events();
        let mut sweep = RetrySweep::default();

        let stale_before = now
            - ChronoDuration::from_std(STALE_PROCESSING).unwrap_or_else(|_| ChronoDuration::minutes(5));
        sweep.released = events
            .release_stale(stale_before, now)
            .await
            .map_err(RetryError::Release)?;
        if sweep.released > 0 {
            warn!(stage = "retry", released = sweep.released, "released abandoned webhook events");
        }

        let due = events
            .list_due(now, self.batch_size)
            .await
            .map_err(RetryError::Load)?;
        sweep.due = due.len();

        for event in due {
            let result = self
                .reconciler
                .process(
                    &event.event_id,
                    event.provider,
                    &event.event_type,
                    &event.raw_payload,
                    event.signature_valid,
                )
                .await;
            match result {
                Ok(Some(request)) => {
                    sweep.alerts += 1;
                    dispatch_alert(&self.alerts, &self.storage, request).await;
                }
                Ok(None) => {}
                Err(ReconcileError::Transient { .. }) => sweep.rescheduled += 1,
                Err(err) => {
                    sweep.failed += 1;
                    debug!(stage = "retry", event_id = %event.event_id, error = %err, "retry attempt failed");
                }
            }
        }

        if sweep.due > 0 {
            info!(
                stage = "retry",
                due = sweep.due,
                alerts = sweep.alerts,
                rescheduled = sweep.rescheduled,
                failed = sweep.failed,
                "retry sweep completed"
            );
        }
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Utc};

    use overlay_alerts_core::{
        queue::QueueConfig,
        retry::Backoff,
        types::{Currency, Donation, PaymentMethod, Provider, WebhookStatus},
    };
    use overlay_alerts_storage::NewWebhookEvent;
    use serde_json::json;

    use crate::{
        overlay::OverlayHub,
        test_support::{fixed_now, seed_streamer, test_database, TOKEN},
    };

    struct Harness {
        db: Database,
        scheduler: RetryScheduler,
        alerts: AlertHub,
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl Harness {
        fn advance(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now += ChronoDuration::seconds(secs);
        }
    }

    async fn harness() -> Harness {
        let db = test_database().await;
        seed_streamer(&db, "s-1", TOKEN).await;
        let now = Arc::new(Mutex::new(fixed_now()));
        let shared = Arc::clone(&now);
        let clock: Clock = Arc::new(move || *shared.lock().unwrap());

        let reconciler = Reconciler::new(db.clone(), Backoff::default(), Arc::clone(&clock));
        let alerts = AlertHub::new(OverlayHub::new(), QueueConfig::default(), Arc::clone(&clock));
        let scheduler = RetryScheduler::new(
            db.clone(),
            reconciler,
            alerts.clone(),
            clock,
            &WebhookConfig::default(),
        );
        Harness {
            db,
            scheduler,
            alerts,
            now,
        }
    }

    async fn record(db: &Database, payload: &str) {
        db.webhook_events()
            .record_receipt(NewWebhookEvent {
                event_id: "evt_1",
                provider: Provider::Stripe,
                event_type: "charge.succeeded",
                raw_payload: payload,
                signature: "t=1,v1=00",
                signature_valid: true,
                max_retries: 3,
                received_at: fixed_now(),
            })
            .await
            .unwrap();
    }

    fn payload() -> String {
        json!({
            "id": "evt_1",
            "type": "charge.succeeded",
            "data": {"object": {"id": "ch_late"}}
        })
        .to_string()
    }

    #[tokio::test]
    async fn due_event_is_retried_until_the_donation_appears() {
        let h = harness().await;
        let payload = payload();
        record(&h.db, &payload).await;
        let first = h
            .scheduler
            .reconciler
            .process("evt_1", Provider::Stripe, "charge.succeeded", &payload, true)
            .await;
        assert!(matches!(first, Err(ReconcileError::Transient { attempt: 1, .. })));

        let early = h.scheduler.run_once().await.unwrap();
        assert_eq!(early.due, 0);

        h.advance(61);
        let second = h.scheduler.run_once().await.unwrap();
        assert_eq!(second.due, 1);
        assert_eq!(second.rescheduled, 1);

        let donation = Donation::pending("s-1", 7_000, Currency::Krw, PaymentMethod::Card, fixed_now())
            .unwrap()
            .with_donor(None, "Jun")
            .with_transaction_id("ch_late");
        h.db.donations().insert(&donation).await.unwrap();

        h.advance(121);
        let third = h.scheduler.run_once().await.unwrap();
        assert_eq!(third.due, 1);
        assert_eq!(third.alerts, 1);

        let event = h.db.webhook_events().fetch("evt_1").await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Completed);
        let snapshot = h.alerts.snapshot("s-1").await.unwrap();
        assert_eq!(snapshot.depth, 1);
    }

    #[tokio::test]
    async fn abandoned_claims_are_released_and_retried() {
        let h = harness().await;
        record(&h.db, &payload()).await;
        assert!(h.db.webhook_events().claim("evt_1", fixed_now()).await.unwrap());

        h.advance(301);
        let sweep = h.scheduler.run_once().await.unwrap();
        assert_eq!(sweep.released, 1);
        assert_eq!(sweep.due, 1);
        assert_eq!(sweep.rescheduled, 1);

        let event = h.db.webhook_events().fetch("evt_1").await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Received);
        assert_eq!(event.retry_count, 1);
    }

    #[tokio::test]
    async fn receipts_never_claimed_are_picked_up_by_the_sweep() {
        let h = harness().await;
        let payload = payload();
        record(&h.db, &payload).await;
        let donation = Donation::pending("s-1", 7_000, Currency::Krw, PaymentMethod::Card, fixed_now())
            .unwrap()
            .with_donor(None, "Jun")
            .with_transaction_id("ch_late");
        h.db.donations().insert(&donation).await.unwrap();

        let early = h.scheduler.run_once().await.unwrap();
        assert_eq!(early.released, 0);
        assert_eq!(early.due, 0);

        h.advance(301);
        let sweep = h.scheduler.run_once().await.unwrap();
        assert_eq!(sweep.released, 1);
        assert_eq!(sweep.due, 1);
        assert_eq!(sweep.alerts, 1);

        let event = h.db.webhook_events().fetch("evt_1").await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Completed);
        assert_eq!(h.alerts.snapshot("s-1").await.unwrap().depth, 1);
    }
}
