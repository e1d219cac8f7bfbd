use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use overlay_alerts_core::{
    queue::QueueError,
    types::{AlertRequest, Currency, PaymentMethod, ANONYMOUS_DONOR},
};

use crate::alerts::AlertError;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::security::{client_context, AccessKind};

const DONOR_NAME_MAX: usize = 50;
const MESSAGE_MAX: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBody {
    #[serde(default)]
    donor_name: Option<String>,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    donation_id: Option<String>,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    is_anonymous: bool,
}

/// `POST /widget/:alert_token/donation-alert`
pub async fn handle(
    State(state): State<AppState>,
    Path(alert_token): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<TriggerBody>, JsonRejection>,
) -> Result<Json<Value>, ProblemResponse> {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let context = client_context(&headers, peer, state.config().security.trust_forwarded_for);

    let profile = state
        .gate()
        .authorize(&alert_token, &context, AccessKind::Trigger)
        .await
        .map_err(|rejection| {
            record("rejected");
            ProblemResponse::from(rejection)
        })?;

    let Json(body) = body.map_err(|rejection| {
        record("invalid");
        ProblemResponse::bad_request("invalid_body", rejection.body_text())
    })?;
    let request = validate(&profile.streamer_id, body).inspect_err(|_| record("invalid"))?;

    let submitted = state
        .alerts()
        .submit(state.storage(), request)
        .await
        .map_err(|err| match err {
            AlertError::Queue(QueueError::Overflow { capacity }) => {
                record("overflow");
                ProblemResponse::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "queue_overflow",
                    format!("alert queue is full ({capacity} pending)"),
                )
            }
            other => {
                record("error");
                error!(stage = "alerts", streamer_id = %profile.streamer_id, error = %other, "trigger failed");
                ProblemResponse::internal("failed to queue alert")
            }
        })?;

    record("accepted");
    let connected = state.overlay().client_count(&submitted.streamer_id);
    info!(
        stage = "alerts",
        streamer_id = %submitted.streamer_id,
        alert_id = %submitted.alert_id,
        connected,
        "trigger accepted"
    );
    Ok(Json(json!({
        "success": true,
        "alertId": submitted.alert_id,
        "streamerId": submitted.streamer_id,
        "widgetUrl": format!("{}/overlay/{}/ws", state.config().public_base_url, alert_token),
        "connectedWidgets": connected,
    })))
}

fn record(result: &'static str) {
    counter!("trigger_requests_total", "result" => result).increment(1);
}

fn validate(streamer_id: &str, body: TriggerBody) -> Result<AlertRequest, ProblemResponse> {
    let invalid = |detail: &str| ProblemResponse::bad_request("validation_error", detail.to_string());

    let donor_name = body
        .donor_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    let donor_name = match (donor_name, body.is_anonymous) {
        (_, true) => ANONYMOUS_DONOR.to_string(),
        (Some(name), false) if name.chars().count() <= DONOR_NAME_MAX => name,
        (Some(_), false) => return Err(invalid("donorName must be at most 50 characters")),
        (None, false) => return Err(invalid("donorName is required")),
    };

    let amount = body
        .amount
        .as_ref()
        .and_then(parse_amount)
        .ok_or_else(|| invalid("amount must be a positive integer"))?;

    let currency = body
        .currency
        .as_deref()
        .ok_or_else(|| invalid("currency is required"))?
        .parse::<Currency>()
        .map_err(|_| invalid("currency is not supported"))?;

    if let Some(method) = body.payment_method.as_deref() {
        method
            .parse::<PaymentMethod>()
            .map_err(|_| invalid("paymentMethod is not supported"))?;
    }

    let message = body.message.filter(|message| !message.trim().is_empty());
    if message
        .as_deref()
        .is_some_and(|message| message.chars().count() > MESSAGE_MAX)
    {
        return Err(invalid("message must be at most 200 characters"));
    }

    Ok(AlertRequest {
        streamer_id: streamer_id.to_string(),
        donor_name,
        amount,
        currency,
        message,
        donation_id: body.donation_id,
    })
}

fn parse_amount(value: &Value) -> Option<i64> {
    let amount = match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                .map(|float| float as i64)
        })?,
        Value::String(text) => text.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (amount > 0).then_some(amount)
}
