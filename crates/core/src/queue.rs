use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::{AlertJob, AlertState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("alert queue is full (capacity {capacity})")]
    Overflow { capacity: usize },
    #[error("alert {0} is not in flight")]
    NotInFlight(String),
}

/// Tuning for one streamer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of jobs waiting behind the in-flight one.
    pub capacity: usize,
    /// Minimum spacing between the end of one alert and the start of the next.
    pub cooldown: Duration,
    /// Age after which a job waiting for a client is dropped.
    pub max_age: Duration,
    /// Margin added to the display duration before an unacknowledged alert is completed.
    pub grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            cooldown: Duration::from_millis(1_000),
            max_age: Duration::from_secs(600),
            grace: Duration::from_millis(2_000),
        }
    }
}

/// Why an in-flight alert left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Ack,
    Deadline,
}

impl CompletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Deadline => "deadline",
        }
    }
}

#[derive(Debug)]
struct Pending {
    job: AlertJob,
    queued_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    job: AlertJob,
    queued_at: Instant,
    deadline: Instant,
}

/// Per-streamer FIFO with at most one alert in `delivering`/`displaying` at any time.
///
/// The queue is a pure state machine; the owner supplies the clock and decides when clients are
/// available.
#[derive(Debug)]
pub struct AlertQueue {
    config: QueueConfig,
    pending: VecDeque<Pending>,
    in_flight: Option<InFlight>,
    cooldown_until: Option<Instant>,
    overflow_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub depth: usize,
    pub in_flight: Option<String>,
    pub in_flight_state: Option<AlertState>,
    pub overflow_count: u64,
    pub pending: Vec<String>,
}

impl AlertQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            in_flight: None,
            cooldown_until: None,
            overflow_count: 0,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Appends `job` to the tail. A full queue rejects the new job and leaves earlier ones intact.
    pub fn enqueue(&mut self, mut job: AlertJob, now: Instant) -> Result<usize, QueueError> {
        if self.pending.len() >= self.config.capacity {
            self.overflow_count += 1;
            return Err(QueueError::Overflow {
                capacity: self.config.capacity,
            });
        }
        job.state = AlertState::Queued;
        self.pending.push_back(Pending {
            job,
            queued_at: now,
        });
        Ok(self.pending.len())
    }

    /// Returns `true` when nothing is in flight and the cooldown has elapsed.
    pub fn is_idle(&self, now: Instant) -> bool {
        self.in_flight.is_none() && self.cooldown_until.map_or(true, |until| now >= until)
    }

    /// Moves the head job into flight when the queue is idle.
    ///
    /// The caller must only invoke this when at least one client can receive the alert.
    pub fn take_due(&mut self, now: Instant, wall_now: DateTime<Utc>) -> Option<AlertJob> {
        if !self.is_idle(now) {
            return None;
        }
        let Pending { mut job, queued_at } = self.pending.pop_front()?;
        self.cooldown_until = None;

        let display = job.resolved_config.display_duration() + self.config.grace;
        job.state = AlertState::Delivering;
        job.delivery_deadline = chrono::Duration::from_std(display)
            .ok()
            .map(|delta| wall_now + delta);
        let delivered = job.clone();
        self.in_flight = Some(InFlight {
            job,
            queued_at,
            deadline: now + display,
        });
        Some(delivered)
    }

    /// Records that at least one client received the in-flight alert.
    pub fn mark_displaying(&mut self, alert_id: &str) -> bool {
        match self.in_flight.as_mut() {
            Some(in_flight) if in_flight.job.alert_id == alert_id => {
                in_flight.job.state = AlertState::Displaying;
                true
            }
            _ => false,
        }
    }

    /// Puts the in-flight alert back at the head of the queue, keeping its original age.
    pub fn requeue_in_flight(&mut self) -> Option<String> {
        let InFlight {
            mut job, queued_at, ..
        } = self.in_flight.take()?;
        job.state = AlertState::Queued;
        job.delivery_deadline = None;
        let alert_id = job.alert_id.clone();
        self.pending.push_front(Pending { job, queued_at });
        Some(alert_id)
    }

    /// Completes the in-flight alert. Acks for any other id are rejected and change nothing.
    pub fn complete(&mut self, alert_id: &str, now: Instant) -> Result<AlertJob, QueueError> {
        match self.in_flight.as_ref() {
            Some(in_flight) if in_flight.job.alert_id == alert_id => {}
            _ => return Err(QueueError::NotInFlight(alert_id.to_string())),
        }
        let in_flight = self
            .in_flight
            .take()
            .ok_or_else(|| QueueError::NotInFlight(alert_id.to_string()))?;
        let mut job = in_flight.job;
        job.state = AlertState::Completed;
        self.cooldown_until = Some(now + self.config.cooldown);
        Ok(job)
    }

    /// Completes the in-flight alert if its deadline has passed.
    pub fn expire_deadline(&mut self, now: Instant) -> Option<AlertJob> {
        let due = self
            .in_flight
            .as_ref()
            .filter(|in_flight| in_flight.deadline <= now)
            .map(|in_flight| in_flight.job.alert_id.clone())?;
        self.complete(&due, now).ok()
    }

    /// Drops queued jobs older than the maximum age.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<AlertJob> {
        let max_age = self.config.max_age;
        let mut expired = Vec::new();
        self.pending.retain(|entry| {
            if now.saturating_duration_since(entry.queued_at) >= max_age {
                let mut job = entry.job.clone();
                job.state = AlertState::Expired;
                expired.push(job);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Earliest instant at which the owner needs to re-evaluate the queue.
    pub fn next_wakeup(&self, clients_connected: bool) -> Option<Instant> {
        if let Some(in_flight) = &self.in_flight {
            return Some(in_flight.deadline);
        }
        let head = self.pending.front()?;
        if clients_connected {
            self.cooldown_until
        } else {
            Some(head.queued_at + self.config.max_age)
        }
    }

    pub fn depth(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_id(&self) -> Option<&str> {
        self.in_flight
            .as_ref()
            .map(|in_flight| in_flight.job.alert_id.as_str())
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            depth: self.pending.len(),
            in_flight: self.in_flight_id().map(str::to_string),
            in_flight_state: self.in_flight.as_ref().map(|in_flight| in_flight.job.state),
            overflow_count: self.overflow_count,
            pending: self
                .pending
                .iter()
                .map(|entry| entry.job.alert_id.clone())
                .collect(),
        }
    }
}
