use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, info, warn};

use overlay_alerts_core::{normalizer::ProviderEvent, types::Provider};
use overlay_alerts_storage::NewWebhookEvent;

use crate::problem::ProblemResponse;
use crate::reconciler::{dispatch_alert, ReconcileError};
use crate::router::AppState;

/// `POST /webhooks/:provider`
///
/// Records the receipt durably, then gives processing a bounded amount of time before
/// acknowledging. Work that does not finish in time continues in the background or through the
/// retry sweep.
pub async fn handle(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let provider: Provider = provider.parse().map_err(|_| {
        ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "unknown_provider",
            format!("no webhook ingress for provider '{provider}'"),
        )
    })?;
    let label = provider.as_str();
    counter!("webhook_ingress_total", "provider" => label).increment(1);

    let result = ingest(&state, provider, &headers, &body).await;
    histogram!("webhook_ack_latency_seconds", "provider" => label)
        .record(start.elapsed().as_secs_f64());
    result
}

async fn ingest(
    state: &AppState,
    provider: Provider,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ProblemResponse> {
    let envelope = ProviderEvent::from_slice(provider, body).map_err(|err| {
        ProblemResponse::bad_request("invalid_payload", format!("failed to parse payload: {err}"))
    })?;
    let payload = std::str::from_utf8(body).map_err(|_| {
        ProblemResponse::bad_request("invalid_payload", "request body must be valid UTF-8")
    })?;
    let event_id = envelope.event_id().to_string();
    let event_type = envelope.event_type().to_string();

    let signature = headers
        .get(provider.signature_header())
        .and_then(|value| value.to_str().ok());
    let verdict = state.verifier().verify(
        provider,
        state.webhook_secret(provider),
        signature,
        body,
        state.now(),
    );

    let receipt = state
        .storage()
        .webhook_events()
        .record_receipt(NewWebhookEvent {
            event_id: &event_id,
            provider,
            event_type: &event_type,
            raw_payload: payload,
            signature: signature.unwrap_or_default(),
            signature_valid: verdict.is_valid(),
            max_retries: state.config().webhooks.max_retries,
            received_at: state.now(),
        })
        .await
        .map_err(|err| {
            error!(stage = "ingress", %event_id, error = %err, "failed to record webhook");
            ProblemResponse::internal("failed to record webhook")
        })?;
    let duplicate = receipt.is_duplicate();

    if !verdict.is_valid() {
        counter!("webhook_invalid_signature_total", "provider" => provider.as_str()).increment(1);
        if !duplicate {
            if let Err(err) = state
                .reconciler()
                .process(&event_id, provider, &event_type, payload, false)
                .await
            {
                if !matches!(err, ReconcileError::InvalidSignature) {
                    error!(stage = "ingress", %event_id, error = %err, "failed to persist signature failure");
                }
            }
        }
        warn!(
            stage = "ingress",
            %event_id,
            provider = provider.as_str(),
            duplicate,
            "webhook signature rejected"
        );
        return Err(ProblemResponse::new(
            StatusCode::FORBIDDEN,
            "invalid_signature",
            "webhook signature verification failed",
        ));
    }

    let task = {
        let reconciler = state.reconciler().clone();
        let alerts = state.alerts().clone();
        let storage = state.storage().clone();
        let event_id = event_id.clone();
        let event_type = event_type.clone();
        let payload = payload.to_string();
        tokio::spawn(async move {
            let result = reconciler
                .process(&event_id, provider, &event_type, &payload, true)
                .await;
            if let Ok(Some(request)) = &result {
                dispatch_alert(&alerts, &storage, request.clone()).await;
            }
            result
        })
    };

    match tokio::time::timeout(state.config().webhooks.processing_timeout, task).await {
        Ok(Ok(Ok(alert))) => {
            info!(
                stage = "ingress",
                %event_id,
                %event_type,
                duplicate,
                alert = alert.is_some(),
                "webhook processed"
            );
        }
        Ok(Ok(Err(err))) => {
            warn!(stage = "ingress", %event_id, %event_type, error = %err, "webhook processing did not complete");
        }
        Ok(Err(join_err)) => {
            error!(stage = "ingress", %event_id, error = %join_err, "webhook processing task panicked");
        }
        Err(_) => {
            info!(stage = "ingress", %event_id, "webhook processing continues in background");
        }
    }

    let status = match state.storage().webhook_events().fetch(&event_id).await {
        Ok(Some(event)) => event.status.as_str(),
        Ok(None) => "received",
        Err(err) => {
            warn!(stage = "ingress", %event_id, error = %err, "failed to reload webhook status");
            receipt.event().status.as_str()
        }
    };

    Ok((
        StatusCode::OK,
        Json(json!({
            "received": true,
            "eventId": event_id,
            "duplicate": duplicate,
            "status": status,
        })),
    )
        .into_response())
}
