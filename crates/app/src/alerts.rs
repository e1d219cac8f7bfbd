use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use overlay_alerts_core::{
    queue::{AlertQueue, CompletionReason, QueueConfig, QueueError, QueueSnapshot},
    tier,
    types::{AlertJob, AlertRequest},
};
use overlay_alerts_storage::{Database, StreamerError};

use crate::{
    overlay::{OverlayHub, ServerMessage},
    router::Clock,
};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("unknown streamer {0}")]
    UnknownStreamer(String),
    #[error("failed to load alert configuration: {0}")]
    Storage(#[from] StreamerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("alert worker for {0} is not running")]
    WorkerGone(String),
}

/// Where a freshly enqueued alert landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub alert_id: String,
    pub streamer_id: String,
    pub position: usize,
}

enum Command {
    Enqueue {
        job: Box<AlertJob>,
        reply: oneshot::Sender<Result<usize, QueueError>>,
    },
    Ack {
        alert_id: String,
    },
    ClientsChanged,
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
}

struct HubInner {
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Command>>>,
    overlay: OverlayHub,
    config: QueueConfig,
    clock: Clock,
}

/// Owns one queue worker per streamer. All queue mutations for a streamer go through its mailbox.
#[derive(Clone)]
pub struct AlertHub {
    inner: Arc<HubInner>,
}

impl AlertHub {
    pub fn new(overlay: OverlayHub, config: QueueConfig, clock: Clock) -> Self {
        Self {
            inner: Arc::new(HubInner {
                workers: Mutex::new(HashMap::new()),
                overlay,
                config,
                clock,
            }),
        }
    }

    /// Resolves the tier for `request` from the streamer's levels and enqueues it.
    pub async fn submit(
        &self,
        storage: &Database,
        request: AlertRequest,
    ) -> Result<Submitted, AlertError> {
        let streamers = storage.streamers();
        let profile = match streamers.fetch(&request.streamer_id).await {
            Ok(profile) => profile,
            Err(StreamerError::NotFound) => {
                return Err(AlertError::UnknownStreamer(request.streamer_id))
            }
            Err(err) => return Err(err.into()),
        };
        let levels = streamers.list_levels(&request.streamer_id).await?;
        let config = tier::resolve(
            &levels,
            &profile.default_alert,
            request.amount,
            request.currency,
        );
        let job = AlertJob::new(
            Ulid::new().to_string(),
            request,
            config,
            (self.inner.clock)(),
        );
        self.enqueue(job).await
    }

    /// Enqueues an already-resolved job.
    pub async fn enqueue(&self, job: AlertJob) -> Result<Submitted, AlertError> {
        let alert_id = job.alert_id.clone();
        let streamer_id = job.streamer_id.clone();
        let (reply, response) = oneshot::channel();
        self.send(
            &streamer_id,
            Command::Enqueue {
                job: Box::new(job),
                reply,
            },
        )?;
        let result = response
            .await
            .map_err(|_| AlertError::WorkerGone(streamer_id.clone()))?;

        match result {
            Ok(position) => {
                info!(stage = "alerts", %streamer_id, %alert_id, position, "alert queued");
                Ok(Submitted {
                    alert_id,
                    streamer_id,
                    position,
                })
            }
            Err(err) => {
                counter!("alert_queue_overflow_total").increment(1);
                warn!(stage = "alerts", %streamer_id, %alert_id, error = %err, "alert rejected");
                Err(err.into())
            }
        }
    }

    /// Forwards a client acknowledgement. Unknown or late acks are dropped by the worker.
    pub fn ack(&self, streamer_id: &str, alert_id: &str) {
        let command = Command::Ack {
            alert_id: alert_id.to_string(),
        };
        if let Err(err) = self.send(streamer_id, command) {
            debug!(stage = "alerts", streamer_id, error = %err, "ack dropped");
        }
    }

    /// Tells the worker that overlay clients connected or left.
    pub fn clients_changed(&self, streamer_id: &str) {
        if let Err(err) = self.send(streamer_id, Command::ClientsChanged) {
            debug!(stage = "alerts", streamer_id, error = %err, "client notification dropped");
        }
    }

    pub async fn snapshot(&self, streamer_id: &str) -> Result<QueueSnapshot, AlertError> {
        let (reply, response) = oneshot::channel();
        self.send(streamer_id, Command::Snapshot { reply })?;
        response
            .await
            .map_err(|_| AlertError::WorkerGone(streamer_id.to_string()))
    }

    fn send(&self, streamer_id: &str, command: Command) -> Result<(), AlertError> {
        let mut workers = self
            .inner
            .workers
            .lock()
            .map_err(|_| AlertError::WorkerGone(streamer_id.to_string()))?;
        let sender = workers
            .entry(streamer_id.to_string())
            .or_insert_with(|| self.spawn_worker(streamer_id));
        match sender.send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(command)) => {
                let fresh = self.spawn_worker(streamer_id);
                let result = fresh
                    .send(command)
                    .map_err(|_| AlertError::WorkerGone(streamer_id.to_string()));
                workers.insert(streamer_id.to_string(), fresh);
                result
            }
        }
    }

    fn spawn_worker(&self, streamer_id: &str) -> mpsc::UnboundedSender<Command> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = StreamerWorker {
            streamer_id: streamer_id.to_string(),
            queue: AlertQueue::new(self.inner.config),
            overlay: self.inner.overlay.clone(),
            clock: Arc::clone(&self.inner.clock),
        };
        debug!(stage = "alerts", streamer_id, "starting alert worker");
        tokio::spawn(worker.run(receiver));
        sender
    }
}

fn monotonic_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct StreamerWorker {
    streamer_id: String,
    queue: AlertQueue,
    overlay: OverlayHub,
    clock: Clock,
}

impl StreamerWorker {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
        loop {
            let connected = self.overlay.client_count(&self.streamer_id) > 0;
            let wakeup = self.queue.next_wakeup(connected);
            let deadline = wakeup
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                command = mailbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if wakeup.is_some() => {}
            }
            self.advance();
        }
        debug!(stage = "alerts", streamer_id = %self.streamer_id, "alert worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { job, reply } => {
                let result = self.queue.enqueue(*job, monotonic_now());
                // the submitter may have gone away; the job stays queued either way
                let _ = reply.send(result);
            }
            Command::Ack { alert_id } => match self.queue.complete(&alert_id, monotonic_now()) {
                Ok(job) => self.completed(&job.alert_id, CompletionReason::Ack),
                Err(err) => {
                    debug!(stage = "alerts", streamer_id = %self.streamer_id, error = %err, "ignoring ack");
                }
            },
            Command::ClientsChanged => {}
            Command::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
        }
    }

    fn completed(&self, alert_id: &str, reason: CompletionReason) {
        counter!("alerts_completed_total", "reason" => reason.as_str()).increment(1);
        info!(
            stage = "alerts",
            streamer_id = %self.streamer_id,
            alert_id,
            reason = reason.as_str(),
            "alert completed"
        );
    }

    /// Applies every timer that is due, then hands the head job to the clients if possible.
    fn advance(&mut self) {
        let now = monotonic_now();
        if let Some(job) = self.queue.expire_deadline(now) {
            self.completed(&job.alert_id, CompletionReason::Deadline);
        }

        let connected = self.overlay.client_count(&self.streamer_id) > 0;
        if !connected {
            for job in self.queue.expire_stale(now) {
                counter!("alerts_expired_total").increment(1);
                warn!(
                    stage = "alerts",
                    streamer_id = %self.streamer_id,
                    alert_id = %job.alert_id,
                    reason = "no overlay client before max age",
                    "alert expired"
                );
            }
        } else if let Some(job) = self.queue.take_due(now, (self.clock)()) {
            let delivered = self
                .overlay
                .broadcast(&self.streamer_id, &ServerMessage::Alert { alert: &job });
            if delivered == 0 {
                self.queue.requeue_in_flight();
                debug!(
                    stage = "alerts",
                    streamer_id = %self.streamer_id,
                    alert_id = %job.alert_id,
                    "no client received alert, requeued"
                );
            } else {
                self.queue.mark_displaying(&job.alert_id);
                counter!("alerts_delivered_total").increment(1);
                info!(
                    stage = "alerts",
                    streamer_id = %self.streamer_id,
                    alert_id = %job.alert_id,
                    clients = delivered,
                    "alert delivered"
                );
            }
        }

        gauge!("alert_queue_depth", "streamer" => self.streamer_id.clone())
            .set(self.queue.depth() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use overlay_alerts_core::types::{AlertState, Currency, VisualConfig};

    use crate::{
        overlay::Registration,
        test_support::{fixed_clock, seed_streamer, test_database, TOKEN},
    };

    fn config() -> QueueConfig {
        QueueConfig {
            capacity: 100,
            cooldown: Duration::from_millis(1_000),
            max_age: Duration::from_secs(600),
            grace: Duration::from_millis(2_000),
        }
    }

    fn job(alert_id: String) -> AlertJob {
        AlertJob::new(
            alert_id,
            AlertRequest {
                streamer_id: "s-1".into(),
                donor_name: "Mina".into(),
                amount: 1000,
                currency: Currency::Krw,
                message: None,
                donation_id: None,
            },
            VisualConfig::default(),
            chrono::Utc::now(),
        )
    }

    fn alert_id_of(frame: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        assert_eq!(value["type"], "alert");
        value["alert"]["alertId"].as_str().unwrap().to_string()
    }

    async fn next_frame(registration: &mut Registration) -> String {
        registration.receiver.recv().await.unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_fifo_order_one_at_a_time() {
        let overlay = OverlayHub::new();
        let hub = AlertHub::new(overlay.clone(), config(), fixed_clock());
        let mut client = overlay.try_register("s-1", 5).unwrap();

        for n in 0..3 {
            hub.enqueue(job(format!("a-{n}"))).await.unwrap();
        }

        for n in 0..3 {
            let frame = next_frame(&mut client).await;
            assert_eq!(alert_id_of(&frame), format!("a-{n}"));

            let quiet = tokio::time::timeout(Duration::from_millis(500), client.receiver.recv()).await;
            assert!(quiet.is_err(), "second alert delivered while one is displaying");

            let snapshot = hub.snapshot("s-1").await.unwrap();
            assert_eq!(snapshot.in_flight.as_deref(), Some(format!("a-{n}").as_str()));
            assert_eq!(snapshot.in_flight_state, Some(AlertState::Displaying));
            hub.ack("s-1", &format!("a-{n}"));
        }
        let snapshot = hub.snapshot("s-1").await.unwrap();
        assert_eq!(snapshot.in_flight, None);
        assert_eq!(snapshot.depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_enqueues_never_overlap() {
        let overlay = OverlayHub::new();
        let hub = AlertHub::new(overlay.clone(), config(), fixed_clock());
        let mut client = overlay.try_register("s-1", 5).unwrap();

        let mut handles = Vec::new();
        for n in 0..50 {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                hub.enqueue(job(format!("a-{n:02}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..50 {
            let alert_id = alert_id_of(&next_frame(&mut client).await);
            let snapshot = hub.snapshot("s-1").await.unwrap();
            assert_eq!(snapshot.in_flight.as_deref(), Some(alert_id.as_str()));
            assert!(!snapshot.pending.contains(&alert_id));
            assert!(client.receiver.try_recv().is_err());
            hub.ack("s-1", &alert_id);
            seen.push(alert_id);
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_alert_completes_at_deadline() {
        let overlay = OverlayHub::new();
        let hub = AlertHub::new(overlay.clone(), config(), fixed_clock());
        let mut client = overlay.try_register("s-1", 5).unwrap();

        hub.enqueue(job("a-0".into())).await.unwrap();
        hub.enqueue(job("a-1".into())).await.unwrap();
        assert_eq!(alert_id_of(&next_frame(&mut client).await), "a-0");

        let started = tokio::time::Instant::now();
        assert_eq!(alert_id_of(&next_frame(&mut client).await), "a-1");
        // 5s display + 2s grace, then the cooldown
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn first_ack_wins_and_late_acks_are_ignored() {
        let overlay = OverlayHub::new();
        let hub = AlertHub::new(overlay.clone(), config(), fixed_clock());
        let mut first = overlay.try_register("s-1", 5).unwrap();
        let mut second = overlay.try_register("s-1", 5).unwrap();

        hub.enqueue(job("a-0".into())).await.unwrap();
        hub.enqueue(job("a-1".into())).await.unwrap();
        assert_eq!(alert_id_of(&next_frame(&mut first).await), "a-0");
        assert_eq!(alert_id_of(&next_frame(&mut second).await), "a-0");

        hub.ack("s-1", "a-0");
        hub.ack("s-1", "a-0");
        hub.ack("s-1", "unknown");
        assert_eq!(alert_id_of(&next_frame(&mut first).await), "a-1");
        let snapshot = hub.snapshot("s-1").await.unwrap();
        assert_eq!(snapshot.in_flight.as_deref(), Some("a-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_wait_for_a_client_then_expire() {
        let overlay = OverlayHub::new();
        let hub = AlertHub::new(overlay.clone(), config(), fixed_clock());

        hub.enqueue(job("a-0".into())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let snapshot = hub.snapshot("s-1").await.unwrap();
        assert_eq!(snapshot.pending, vec!["a-0".to_string()]);

        let mut client = overlay.try_register("s-1", 5).unwrap();
        hub.clients_changed("s-1");
        assert_eq!(alert_id_of(&next_frame(&mut client).await), "a-0");
        hub.ack("s-1", "a-0");
        drop(client);
        hub.clients_changed("s-1");

        hub.enqueue(job("a-1".into())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(601)).await;
        let snapshot = hub.snapshot("s-1").await.unwrap();
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.in_flight, None);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_rejects_newest() {
        let overlay = OverlayHub::new();
        let mut small = config();
        small.capacity = 2;
        let hub = AlertHub::new(overlay, small, fixed_clock());

        hub.enqueue(job("a-0".into())).await.unwrap();
        hub.enqueue(job("a-1".into())).await.unwrap();
        let err = hub.enqueue(job("a-2".into())).await.unwrap_err();
        assert!(matches!(err, AlertError::Queue(QueueError::Overflow { capacity: 2 })));

        let snapshot = hub.snapshot("s-1").await.unwrap();
        assert_eq!(snapshot.pending, vec!["a-0".to_string(), "a-1".to_string()]);
        assert_eq!(snapshot.overflow_count, 1);
    }

    #[tokio::test]
    async fn submit_resolves_tier_and_assigns_ulid() {
        let db = test_database().await;
        seed_streamer(&db, "s-1", TOKEN).await;
        let level = overlay_alerts_core::types::DonationLevel::new(
            "gold",
            "s-1",
            10_000,
            50_000,
            Currency::Krw,
        )
        .unwrap();
        db.streamers().upsert_level(&level).await.unwrap();

        let overlay = OverlayHub::new();
        let hub = AlertHub::new(overlay.clone(), config(), fixed_clock());
        let mut client = overlay.try_register("s-1", 5).unwrap();

        let submitted = hub
            .submit(
                &db,
                AlertRequest {
                    streamer_id: "s-1".into(),
                    donor_name: "Mina".into(),
                    amount: 25_000,
                    currency: Currency::Krw,
                    message: Some("great stream".into()),
                    donation_id: Some("d-1".into()),
                },
            )
            .await
            .unwrap();
        assert!(submitted.alert_id.parse::<Ulid>().is_ok());

        let frame: serde_json::Value =
            serde_json::from_str(&next_frame(&mut client).await).unwrap();
        assert_eq!(frame["alert"]["alertId"], submitted.alert_id.as_str());
        assert_eq!(frame["alert"]["config"]["levelId"], "gold");
        assert_eq!(frame["alert"]["message"], "great stream");

        let missing = hub
            .submit(
                &db,
                AlertRequest {
                    streamer_id: "nobody".into(),
                    donor_name: "Mina".into(),
                    amount: 1000,
                    currency: Currency::Krw,
                    message: None,
                    donation_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(missing, AlertError::UnknownStreamer(_)));
    }
}
