use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;

use overlay_alerts_core::types::{SecuritySettings, StreamerProfile, VisualConfig};
use overlay_alerts_storage::Database;
use overlay_alerts_util::{AppConfig, WebhookConfig};

use crate::router::{app_router, AppState, Clock};
use crate::telemetry;

pub const TOKEN: &str = "tok_0123456789abcdefghijklmnopqrstuvwxyz";
pub const STRIPE_SECRET: &str = "whsec_test";
pub const PAYPAL_SECRET: &str = "paypal-test-secret";
pub const CUSTOM_SECRET: &str = "custom-test-secret";
pub const ADMIN_SECRET: &[u8] = b"admin-test-secret";

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn fixed_clock() -> Clock {
    Arc::new(fixed_now)
}

pub async fn test_database() -> Database {
    let db = Database::connect_with("sqlite::memory:", 1)
        .await
        .expect("connect");
    db.run_migrations().await.expect("migrations");
    db
}

pub async fn seed_streamer(db: &Database, streamer_id: &str, token: &str) -> StreamerProfile {
    let profile = StreamerProfile {
        streamer_id: streamer_id.to_string(),
        display_name: format!("{streamer_id} display"),
        security: SecuritySettings::with_token(token),
        default_alert: VisualConfig::default(),
    };
    db.streamers()
        .insert(&profile, fixed_now())
        .await
        .expect("insert streamer");
    profile
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        webhooks: WebhookConfig {
            stripe_secret: Some(STRIPE_SECRET.to_string()),
            paypal_secret: Some(PAYPAL_SECRET.to_string()),
            custom_secret: Some(CUSTOM_SECRET.to_string()),
            ..WebhookConfig::default()
        },
        ..AppConfig::default()
    };
    config.security.admin_token_secret = ADMIN_SECRET.to_vec();
    config
}

/// State over a fresh database with streamer `s-1` owning [`TOKEN`].
pub async fn test_state() -> (AppState, Database) {
    test_state_with(test_config()).await
}

pub async fn test_state_with(config: AppConfig) -> (AppState, Database) {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let db = test_database().await;
    seed_streamer(&db, "s-1", TOKEN).await;
    let state = AppState::new(config, metrics, db.clone()).with_clock(fixed_clock());
    (state, db)
}

/// HS256 control-plane token for `streamer_id`, valid for an hour after [`fixed_now`].
pub fn admin_token(streamer_id: &str) -> String {
    let claims = json!({
        "sub": streamer_id,
        "aud": "admin",
        "exp": fixed_now().timestamp() + 3_600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(ADMIN_SECRET),
    )
    .expect("encode token")
}

/// Sends `request` through the router and decodes the JSON body (`Null` when empty).
pub async fn read_json(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = app_router(state.clone())
        .oneshot(request)
        .await
        .expect("handler should respond");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should read")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}
