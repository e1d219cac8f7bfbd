use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use overlay_alerts_core::{
    queue::QueueConfig, retry::Backoff, signature::SignatureVerifier, types::Provider,
};
use overlay_alerts_storage::Database;
use overlay_alerts_util::AppConfig;

use crate::alerts::AlertHub;
use crate::control::{self, AdminTokenValidator};
use crate::overlay::{self, OverlayHub};
use crate::reconciler::Reconciler;
use crate::retry::RetryScheduler;
use crate::security::SecurityGate;
use crate::{telemetry, trigger, webhook};

/// Wall clock shared by every component so tests can pin time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    metrics: PrometheusHandle,
    storage: Database,
    clock: Clock,
    verifier: SignatureVerifier,
    reconciler: Reconciler,
    alerts: AlertHub,
    overlay: OverlayHub,
    gate: SecurityGate,
    admin_tokens: AdminTokenValidator,
}

impl AppState {
    pub fn new(config: AppConfig, metrics: PrometheusHandle, storage: Database) -> Self {
        Self::build(Arc::new(config), metrics, storage, Arc::new(Utc::now))
    }

    fn build(
        config: Arc<AppConfig>,
        metrics: PrometheusHandle,
        storage: Database,
        clock: Clock,
    ) -> Self {
        let webhooks = &config.webhooks;
        let verifier = SignatureVerifier::new(webhooks.timestamp_tolerance.as_secs() as i64);
        let reconciler = Reconciler::new(
            storage.clone(),
            Backoff::new(webhooks.retry_base, webhooks.retry_max),
            clock.clone(),
        );
        let overlay = OverlayHub::new();
        let queue = QueueConfig {
            capacity: config.alerts.queue_capacity,
            cooldown: config.alerts.cooldown,
            max_age: config.alerts.max_age,
            grace: config.alerts.grace,
        };
        let alerts = AlertHub::new(overlay.clone(), queue, clock.clone());
        let gate = SecurityGate::new(storage.clone(), config.security.clone(), clock.clone());
        let admin_tokens = AdminTokenValidator::new(&config.security.admin_token_secret);
        Self {
            config,
            metrics,
            storage,
            clock,
            verifier,
            reconciler,
            alerts,
            overlay,
            gate,
            admin_tokens,
        }
    }

    #[cfg(test)]
    pub fn with_clock(self, clock: Clock) -> Self {
        Self::build(self.config, self.metrics, self.storage, clock)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn webhook_secret(&self, provider: Provider) -> Option<&str> {
        let webhooks = &self.config.webhooks;
        match provider {
            Provider::Stripe => webhooks.stripe_secret.as_deref(),
            Provider::PayPal => webhooks.paypal_secret.as_deref(),
            Provider::Custom => webhooks.custom_secret.as_deref(),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn alerts(&self) -> &AlertHub {
        &self.alerts
    }

    pub fn overlay(&self) -> &OverlayHub {
        &self.overlay
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    pub fn admin_tokens(&self) -> &AdminTokenValidator {
        &self.admin_tokens
    }

    /// Retry worker sharing this state's reconciler and alert hub.
    pub fn retry_scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(
            self.storage.clone(),
            self.reconciler.clone(),
            self.alerts.clone(),
            self.clock.clone(),
            &self.config.webhooks,
        )
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhooks/:provider", post(webhook::handle))
        .route("/overlay/:alert_token/ws", get(overlay::overlay_ws))
        .route("/widget/:alert_token/donation-alert", post(trigger::handle))
        .route(
            "/security/:streamer_id/validate-token",
            post(control::validate_token),
        )
        .route("/security/:streamer_id/signature", post(control::create_signature))
        .route("/security/:streamer_id/revoke-token", post(control::revoke_token))
        .route(
            "/security/:streamer_id/regenerate-token",
            post(control::regenerate_token),
        )
        .route("/security/:streamer_id/settings", put(control::update_settings))
        .route("/security/:streamer_id/audit", get(control::audit))
        .route("/security/:streamer_id/status", get(control::status))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}
