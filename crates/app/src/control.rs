use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use overlay_alerts_core::{
    security::{parse_allow_list, sign_request},
    types::StreamerProfile,
};
use overlay_alerts_storage::StreamerError;

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::security::{client_context, ClientContext, GateRejection};

const ADMIN_AUDIENCE: &str = "admin";
const AUDIT_DEFAULT_LIMIT: u32 = 50;
const MAX_CONNECTIONS_LIMIT: u32 = 100;

/// HS256 bearer tokens for the control plane, scoped to one streamer.
#[derive(Clone)]
pub struct AdminTokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AdminTokenValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(
        &self,
        token: &str,
        streamer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AdminTokenError> {
        let claims = decode::<AdminClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| AdminTokenError::Invalid(format!("{err}")))?
            .claims;
        if claims.aud != ADMIN_AUDIENCE {
            return Err(AdminTokenError::Invalid("audience_mismatch".to_string()));
        }
        if claims.sub != streamer_id {
            return Err(AdminTokenError::Invalid("subject_mismatch".to_string()));
        }
        let now_ts = now.timestamp();
        if let Some(nbf) = claims.nbf {
            if now_ts < nbf {
                return Err(AdminTokenError::Invalid("token_not_yet_valid".to_string()));
            }
        }
        if now_ts >= claims.exp {
            return Err(AdminTokenError::Invalid("token_expired".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AdminClaims {
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    #[serde(default)]
    pub nbf: Option<i64>,
}

#[derive(Debug, Error)]
pub enum AdminTokenError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid token: {0}")]
    Invalid(String),
}

impl From<AdminTokenError> for ProblemResponse {
    fn from(err: AdminTokenError) -> Self {
        ProblemResponse::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
    }
}

fn streamer_problem(err: StreamerError) -> ProblemResponse {
    match err {
        StreamerError::NotFound => ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "streamer_not_found",
            "streamer not found",
        ),
        other => {
            error!(stage = "control", error = %other, "streamer store failed");
            ProblemResponse::internal("failed to access streamer record")
        }
    }
}

/// Checks the bearer token for `streamer_id` and loads the streamer.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    streamer_id: &str,
) -> Result<StreamerProfile, ProblemResponse> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AdminTokenError::Missing)?;
    state
        .admin_tokens()
        .validate(token, streamer_id, state.now())
        .inspect_err(|err| {
            warn!(stage = "control", streamer_id, error = %err, "control-plane token rejected");
        })?;
    state
        .storage()
        .streamers()
        .fetch(streamer_id)
        .await
        .map_err(streamer_problem)
}

/// Bearer token plus, when the streamer requires it, the request signature.
async fn authenticate_signed(
    state: &AppState,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    streamer_id: &str,
) -> Result<(StreamerProfile, ClientContext), ProblemResponse> {
    let profile = authenticate(state, headers, streamer_id).await?;
    let context = client_context(
        headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.config().security.trust_forwarded_for,
    );
    state
        .gate()
        .verify_signed_request(&profile, headers, &context)
        .await?;
    Ok((profile, context))
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenBody {
    alert_token: String,
}

/// `POST /security/:streamer_id/validate-token`
pub async fn validate_token(
    State(state): State<AppState>,
    Path(streamer_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<ValidateTokenBody>, JsonRejection>,
) -> Result<Json<Value>, ProblemResponse> {
    authenticate(&state, &headers, &streamer_id).await?;
    let Json(body) =
        body.map_err(|err| ProblemResponse::bad_request("invalid_body", err.body_text()))?;

    let verdict = match state.gate().check_token(&body.alert_token).await {
        Ok(profile) if profile.streamer_id == streamer_id => Ok(()),
        Ok(_) => Err(GateRejection::InvalidToken),
        Err(GateRejection::Storage(message)) => {
            error!(stage = "control", %streamer_id, error = %message, "token lookup failed");
            return Err(ProblemResponse::internal("failed to look up token"));
        }
        Err(rejection) => Err(rejection),
    };

    Ok(Json(match verdict {
        Ok(()) => json!({"valid": true, "streamerId": streamer_id}),
        Err(rejection) => json!({
            "valid": false,
            "streamerId": streamer_id,
            "reason": rejection.kind().map(|kind| kind.as_str()),
        }),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureBody {
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    nonce: Option<String>,
}

/// `POST /security/:streamer_id/signature`
///
/// Signs `timestamp:nonce` with the streamer's request secret, filling in the current time and a
/// fresh nonce when omitted.
pub async fn create_signature(
    State(state): State<AppState>,
    Path(streamer_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<SignatureBody>>,
) -> Result<Json<Value>, ProblemResponse> {
    let profile = authenticate(&state, &headers, &streamer_id).await?;
    let Some(secret) = profile
        .security
        .request_signature_secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
    else {
        return Err(ProblemResponse::new(
            StatusCode::CONFLICT,
            "signing_not_configured",
            "no request signature secret is configured",
        ));
    };

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let timestamp = body.timestamp.unwrap_or_else(|| state.now().timestamp());
    let nonce = body
        .nonce
        .filter(|nonce| !nonce.is_empty())
        .unwrap_or_else(|| random_hex(16));
    let signature = sign_request(secret, timestamp, &nonce);

    Ok(Json(json!({
        "timestamp": timestamp,
        "nonce": nonce,
        "signature": signature,
    })))
}

/// `POST /security/:streamer_id/revoke-token`
pub async fn revoke_token(
    State(state): State<AppState>,
    Path(streamer_id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProblemResponse> {
    let (profile, context) =
        authenticate_signed(&state, &headers, connect_info, &streamer_id).await?;
    state
        .storage()
        .streamers()
        .revoke_token(&profile.streamer_id, state.now())
        .await
        .map_err(streamer_problem)?;

    info!(stage = "control", %streamer_id, ip = %context.ip_label(), "alert token revoked");
    Ok(Json(json!({"success": true, "streamerId": streamer_id, "revoked": true})))
}

/// `POST /security/:streamer_id/regenerate-token`
pub async fn regenerate_token(
    State(state): State<AppState>,
    Path(streamer_id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProblemResponse> {
    let (profile, context) =
        authenticate_signed(&state, &headers, connect_info, &streamer_id).await?;
    let alert_token = random_hex(32);
    state
        .storage()
        .streamers()
        .rotate_token(&profile.streamer_id, &alert_token, state.now())
        .await
        .map_err(streamer_problem)?;

    info!(stage = "control", %streamer_id, ip = %context.ip_label(), "alert token regenerated");
    Ok(Json(json!({
        "success": true,
        "streamerId": streamer_id,
        "alertToken": alert_token,
        "widgetUrl": format!("{}/overlay/{}/ws", state.config().public_base_url, alert_token),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsBody {
    #[serde(default)]
    allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    max_connections: Option<u32>,
    #[serde(default)]
    require_ip_validation: Option<bool>,
    #[serde(default)]
    require_request_signing: Option<bool>,
    #[serde(default)]
    request_signature_secret: Option<String>,
}

/// `PUT /security/:streamer_id/settings`
///
/// Partial update. Enabling request signing without a secret generates one and returns it once.
pub async fn update_settings(
    State(state): State<AppState>,
    Path(streamer_id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<SettingsBody>, JsonRejection>,
) -> Result<Json<Value>, ProblemResponse> {
    let (profile, _context) =
        authenticate_signed(&state, &headers, connect_info, &streamer_id).await?;
    let Json(body) =
        body.map_err(|err| ProblemResponse::bad_request("invalid_body", err.body_text()))?;

    let mut settings = profile.security;
    if let Some(allowed_ips) = body.allowed_ips {
        let entries: Vec<String> = allowed_ips
            .into_iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();
        parse_allow_list(&entries).map_err(|err| {
            ProblemResponse::bad_request("validation_error", format!("invalid allow-list entry: {}", err.0))
        })?;
        settings.allowed_ips = entries;
    }
    if let Some(max_connections) = body.max_connections {
        if !(1..=MAX_CONNECTIONS_LIMIT).contains(&max_connections) {
            return Err(ProblemResponse::bad_request(
                "validation_error",
                format!("maxConnections must be between 1 and {MAX_CONNECTIONS_LIMIT}"),
            ));
        }
        settings.max_connections = max_connections;
    }
    if let Some(require) = body.require_ip_validation {
        settings.require_ip_validation = require;
    }
    if let Some(secret) = body.request_signature_secret.filter(|s| !s.is_empty()) {
        settings.request_signature_secret = Some(secret);
    }
    if let Some(require) = body.require_request_signing {
        settings.require_request_signing = require;
    }

    let mut generated_secret = None;
    if settings.require_request_signing && settings.request_signature_secret.is_none() {
        let secret = random_hex(32);
        settings.request_signature_secret = Some(secret.clone());
        generated_secret = Some(secret);
    }

    state
        .storage()
        .streamers()
        .save_security(&streamer_id, &settings, state.now())
        .await
        .map_err(streamer_problem)?;
    info!(
        stage = "control",
        %streamer_id,
        require_ip_validation = settings.require_ip_validation,
        require_request_signing = settings.require_request_signing,
        allowed_ips = settings.allowed_ips.len(),
        "security settings updated"
    );

    let mut response = json!({"success": true, "settings": settings});
    if let Some(secret) = generated_secret {
        response["requestSignatureSecret"] = Value::String(secret);
    }
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    limit: Option<u32>,
}

/// `GET /security/:streamer_id/audit`
pub async fn audit(
    State(state): State<AppState>,
    Path(streamer_id): Path<String>,
    Query(query): Query<AuditQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProblemResponse> {
    authenticate(&state, &headers, &streamer_id).await?;
    let max = state.config().security.violation_log_max.max(1);
    let limit = query.limit.unwrap_or(AUDIT_DEFAULT_LIMIT).clamp(1, max);

    let violations = state.storage().violations();
    let entries = violations.list(&streamer_id, limit).await.map_err(|err| {
        error!(stage = "control", %streamer_id, error = %err, "failed to read violation log");
        ProblemResponse::internal("failed to read violation log")
    })?;
    let total = violations.count(&streamer_id).await.map_err(|err| {
        error!(stage = "control", %streamer_id, error = %err, "failed to count violations");
        ProblemResponse::internal("failed to read violation log")
    })?;

    Ok(Json(json!({
        "streamerId": streamer_id,
        "total": total,
        "violations": entries,
    })))
}

/// `GET /security/:streamer_id/status`
pub async fn status(
    State(state): State<AppState>,
    Path(streamer_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProblemResponse> {
    let profile = authenticate(&state, &headers, &streamer_id).await?;
    let queue = state.alerts().snapshot(&streamer_id).await.map_err(|err| {
        error!(stage = "control", %streamer_id, error = %err, "queue snapshot failed");
        ProblemResponse::internal("alert queue unavailable")
    })?;
    let violation_count = state
        .storage()
        .violations()
        .count(&streamer_id)
        .await
        .map_err(|err| {
            error!(stage = "control", %streamer_id, error = %err, "failed to count violations");
            ProblemResponse::internal("failed to read violation log")
        })?;

    Ok(Json(json!({
        "streamerId": profile.streamer_id,
        "displayName": profile.display_name,
        "security": profile.security,
        "connectedWidgets": state.overlay().client_count(&streamer_id),
        "queue": queue,
        "violationCount": violation_count,
    })))
}
