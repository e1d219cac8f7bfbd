use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::counter;
use thiserror::Error;
use tracing::{error, warn};

use overlay_alerts_core::{
    security::{
        ip_allowed, is_well_formed_token, verify_request_signature, FixedWindowLimiter,
        NonceCache, RequestSignatureError,
    },
    types::{SecurityViolation, StreamerProfile, ViolationKind},
};
use overlay_alerts_storage::Database;
use overlay_alerts_util::SecurityConfig;

use crate::{problem::ProblemResponse, router::Clock};

pub const SIGNATURE_TIMESTAMP_HEADER: &str = "x-signature-timestamp";
pub const SIGNATURE_NONCE_HEADER: &str = "x-signature-nonce";
pub const SIGNATURE_HEADER: &str = "x-signature";

const RATE_WINDOW: Duration = Duration::from_secs(60);
const LIMITER_PRUNE_THRESHOLD: usize = 4_096;

/// Where a request came from, as far as the gate can tell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn ip_label(&self) -> String {
        self.ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Resolves the client address from the peer, or the first `X-Forwarded-For` hop when trusted.
pub fn client_context(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> ClientContext {
    let forwarded = trust_forwarded_for
        .then(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .and_then(|hop| hop.trim().parse::<IpAddr>().ok())
        })
        .flatten();

    ClientContext {
        ip: forwarded.or_else(|| peer.map(|addr| addr.ip())),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Connection,
    Trigger,
}

#[derive(Debug, Error)]
pub enum GateRejection {
    #[error("alert token is malformed or unknown")]
    InvalidToken,
    #[error("alert token has been revoked")]
    TokenRevoked,
    #[error("client address is not in the allow-list")]
    IpBlocked,
    #[error("too many requests, try again later")]
    RateLimitExceeded,
    #[error("connection limit of {max} reached")]
    ConnectionLimit { max: usize },
    #[error("request timestamp is outside the allowed window")]
    StaleTimestamp,
    #[error("request signature does not match")]
    SignatureMismatch,
    #[error("request nonce has already been used")]
    ReplayDetected,
    #[error("security store unavailable: {0}")]
    Storage(String),
}

impl GateRejection {
    pub fn kind(&self) -> Option<ViolationKind> {
        match self {
            Self::InvalidToken => Some(ViolationKind::InvalidToken),
            Self::TokenRevoked => Some(ViolationKind::TokenRevoked),
            Self::IpBlocked => Some(ViolationKind::IpBlocked),
            Self::RateLimitExceeded => Some(ViolationKind::RateLimitExceeded),
            Self::ConnectionLimit { .. } => Some(ViolationKind::ConnectionLimit),
            Self::StaleTimestamp => Some(ViolationKind::StaleTimestamp),
            Self::SignatureMismatch => Some(ViolationKind::SignatureMismatch),
            Self::ReplayDetected => Some(ViolationKind::ReplayDetected),
            Self::Storage(_) => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidToken
            | Self::StaleTimestamp
            | Self::SignatureMismatch
            | Self::ReplayDetected => StatusCode::UNAUTHORIZED,
            Self::TokenRevoked | Self::IpBlocked => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ConnectionLimit { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn problem(&self) -> ProblemResponse {
        let problem_type = self.kind().map(ViolationKind::as_str).unwrap_or("storage_error");
        ProblemResponse::new(self.status(), problem_type, self.to_string())
    }
}

impl From<RequestSignatureError> for GateRejection {
    fn from(err: RequestSignatureError) -> Self {
        match err {
            RequestSignatureError::StaleTimestamp => Self::StaleTimestamp,
            RequestSignatureError::SignatureMismatch => Self::SignatureMismatch,
            RequestSignatureError::ReplayDetected | RequestSignatureError::NonceCacheFull => {
                Self::ReplayDetected
            }
        }
    }
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        self.problem().into_response()
    }
}

impl From<GateRejection> for ProblemResponse {
    fn from(rejection: GateRejection) -> Self {
        rejection.problem()
    }
}

/// Token, address, rate and request-signature checks for the overlay channel and control plane.
#[derive(Clone)]
pub struct SecurityGate {
    storage: Database,
    config: Arc<SecurityConfig>,
    limiter: Arc<Mutex<FixedWindowLimiter<(String, String)>>>,
    nonces: Arc<Mutex<HashMap<String, NonceCache>>>,
    clock: Clock,
}

impl SecurityGate {
    pub fn new(storage: Database, config: SecurityConfig, clock: Clock) -> Self {
        let limiter = FixedWindowLimiter::new(config.rate_limit_per_minute, RATE_WINDOW);
        Self {
            storage,
            config: Arc::new(config),
            limiter: Arc::new(Mutex::new(limiter)),
            nonces: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    async fn lookup(&self, alert_token: &str) -> Result<Option<StreamerProfile>, GateRejection> {
        if !is_well_formed_token(alert_token) {
            return Ok(None);
        }
        self.storage
            .streamers()
            .fetch_by_token(alert_token)
            .await
            .map_err(|err| GateRejection::Storage(err.to_string()))
    }

    /// Format check, lookup and revocation. Records nothing.
    pub async fn check_token(&self, alert_token: &str) -> Result<StreamerProfile, GateRejection> {
        let profile = self
            .lookup(alert_token)
            .await?
            .ok_or(GateRejection::InvalidToken)?;
        if profile.security.is_token_revoked {
            return Err(GateRejection::TokenRevoked);
        }
        Ok(profile)
    }

    /// Full admission check for an overlay connection or a public trigger request.
    pub async fn authorize(
        &self,
        alert_token: &str,
        context: &ClientContext,
        access: AccessKind,
    ) -> Result<StreamerProfile, GateRejection> {
        let Some(profile) = self.lookup(alert_token).await? else {
            return Err(self
                .reject(
                    None,
                    GateRejection::InvalidToken,
                    context,
                    "malformed or unknown alert token",
                )
                .await);
        };
        if profile.security.is_token_revoked {
            return Err(self
                .reject(
                    Some(&profile.streamer_id),
                    GateRejection::TokenRevoked,
                    context,
                    "revoked alert token presented",
                )
                .await);
        }

        let security = &profile.security;
        if security.require_ip_validation {
            let allowed = context
                .ip
                .map(|ip| ip_allowed(&security.allowed_ips, ip))
                .unwrap_or(false);
            if !allowed {
                let details = format!("address {} is not allow-listed", context.ip_label());
                return Err(self
                    .reject(
                        Some(&profile.streamer_id),
                        GateRejection::IpBlocked,
                        context,
                        &details,
                    )
                    .await);
            }
        }

        if access == AccessKind::Trigger && !self.take_rate_budget(alert_token, context) {
            let details = format!(
                "more than {} trigger requests per minute",
                self.config.rate_limit_per_minute
            );
            return Err(self
                .reject(
                    Some(&profile.streamer_id),
                    GateRejection::RateLimitExceeded,
                    context,
                    &details,
                )
                .await);
        }

        Ok(profile)
    }

    fn take_rate_budget(&self, alert_token: &str, context: &ClientContext) -> bool {
        let now = tokio::time::Instant::now().into_std();
        let Ok(mut limiter) = self.limiter.lock() else {
            return false;
        };
        if limiter.len() > LIMITER_PRUNE_THRESHOLD {
            limiter.prune(now);
        }
        limiter.check((alert_token.to_string(), context.ip_label()), now)
    }

    /// Verifies the `timestamp:nonce` signature on a privileged request when the streamer
    /// requires it.
    pub async fn verify_signed_request(
        &self,
        profile: &StreamerProfile,
        headers: &HeaderMap,
        context: &ClientContext,
    ) -> Result<(), GateRejection> {
        let security = &profile.security;
        if !security.require_request_signing {
            return Ok(());
        }

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let (Some(timestamp), Some(nonce), Some(signature)) = (
            header(SIGNATURE_TIMESTAMP_HEADER),
            header(SIGNATURE_NONCE_HEADER),
            header(SIGNATURE_HEADER),
        ) else {
            return Err(self
                .reject(
                    Some(&profile.streamer_id),
                    GateRejection::SignatureMismatch,
                    context,
                    "missing request signature headers",
                )
                .await);
        };
        let Ok(timestamp) = timestamp.trim().parse::<i64>() else {
            return Err(self
                .reject(
                    Some(&profile.streamer_id),
                    GateRejection::StaleTimestamp,
                    context,
                    "unparseable request timestamp",
                )
                .await);
        };

        let Some(secret) = security.request_signature_secret.as_deref() else {
            return Err(self
                .reject(
                    Some(&profile.streamer_id),
                    GateRejection::SignatureMismatch,
                    context,
                    "request signing enabled without a secret",
                )
                .await);
        };
        let now = (self.clock)().timestamp();
        let tolerance = self.config.request_signature_tolerance.as_secs() as i64;
        let verdict = {
            let mut caches = self
                .nonces
                .lock()
                .map_err(|_| GateRejection::Storage("nonce cache poisoned".to_string()))?;
            let cache = caches
                .entry(profile.streamer_id.clone())
                .or_insert_with(|| NonceCache::new(self.config.nonce_cache_max));
            verify_request_signature(secret, timestamp, &nonce, &signature, now, tolerance, cache)
        };

        match verdict {
            Ok(()) => Ok(()),
            Err(err) => {
                let details = format!("{err} (nonce {nonce})");
                Err(self
                    .reject(Some(&profile.streamer_id), err.into(), context, &details)
                    .await)
            }
        }
    }

    /// Records a refused connection because every slot is taken.
    pub async fn connection_limit(
        &self,
        streamer_id: &str,
        context: &ClientContext,
        max: usize,
    ) -> GateRejection {
        let details = format!("{max} overlay connections already open");
        self.reject(
            Some(streamer_id),
            GateRejection::ConnectionLimit { max },
            context,
            &details,
        )
        .await
    }

    async fn reject(
        &self,
        streamer_id: Option<&str>,
        rejection: GateRejection,
        context: &ClientContext,
        details: &str,
    ) -> GateRejection {
        let Some(kind) = rejection.kind() else {
            return rejection;
        };
        counter!("security_violations_total", "type" => kind.as_str()).increment(1);
        warn!(
            stage = "security",
            streamer_id = streamer_id.unwrap_or("unknown"),
            violation = kind.as_str(),
            ip = %context.ip_label(),
            details,
            "request rejected by security gate"
        );

        if let Some(streamer_id) = streamer_id {
            let violation = SecurityViolation {
                kind,
                timestamp: (self.clock)(),
                ip: context.ip.map(|ip| ip.to_string()),
                user_agent: context.user_agent.clone(),
                details: details.to_string(),
            };
            if let Err(err) = self
                .storage
                .violations()
                .append(streamer_id, &violation, self.config.violation_log_max)
                .await
            {
                error!(stage = "security", streamer_id, error = %err, "failed to record violation");
            }
        }
        rejection
    }
}
