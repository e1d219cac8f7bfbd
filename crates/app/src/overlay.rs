use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use overlay_alerts_core::types::AlertJob;

use crate::{
    router::AppState,
    security::{client_context, AccessKind},
};

/// Server to client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage<'a> {
    Connected {
        #[serde(rename = "streamerId")]
        streamer_id: &'a str,
    },
    Alert { alert: &'a AlertJob },
}

/// Client to server frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    AlertCompleted {
        #[serde(rename = "alertId")]
        alert_id: String,
        #[serde(rename = "streamerId")]
        streamer_id: String,
    },
    Ping,
}

pub fn parse_client_message(text: &str) -> Option<ClientMessage> {
    serde_json::from_str(text).ok()
}

type Subscribers = HashMap<u64, mpsc::UnboundedSender<Arc<str>>>;

#[derive(Default)]
struct OverlayInner {
    streamers: Mutex<HashMap<String, Subscribers>>,
    next_id: AtomicU64,
    total: AtomicUsize,
}

/// Registry of connected overlay clients, keyed by streamer.
#[derive(Clone, Default)]
pub struct OverlayHub {
    inner: Arc<OverlayInner>,
}

/// A registered client slot: the outbound receiver plus the guard that frees the slot.
pub struct Registration {
    pub guard: ClientGuard,
    pub receiver: mpsc::UnboundedReceiver<Arc<str>>,
}

impl OverlayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client unless the streamer already has `max_connections` clients.
    pub fn try_register(&self, streamer_id: &str, max_connections: usize) -> Option<Registration> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut streamers = self.inner.streamers.lock().ok()?;
            let subscribers = streamers.entry(streamer_id.to_string()).or_default();
            subscribers.retain(|_, tx| !tx.is_closed());
            if subscribers.len() >= max_connections {
                return None;
            }
            subscribers.insert(id, sender);
        }
        let total = self.inner.total.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("overlay_clients").set(total as f64);

        Some(Registration {
            guard: ClientGuard {
                hub: self.clone(),
                streamer_id: streamer_id.to_string(),
                id,
            },
            receiver,
        })
    }

    pub fn client_count(&self, streamer_id: &str) -> usize {
        self.inner
            .streamers
            .lock()
            .map(|streamers| {
                streamers
                    .get(streamer_id)
                    .map(|subscribers| subscribers.values().filter(|tx| !tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Sends `message` to every client of the streamer and returns how many received it.
    pub fn broadcast(&self, streamer_id: &str, message: &ServerMessage<'_>) -> usize {
        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => Arc::from(json),
            Err(err) => {
                warn!(stage = "overlay", streamer_id, error = %err, "failed to encode overlay message");
                return 0;
            }
        };
        let Ok(mut streamers) = self.inner.streamers.lock() else {
            return 0;
        };
        let Some(subscribers) = streamers.get_mut(streamer_id) else {
            return 0;
        };
        subscribers.retain(|_, tx| tx.send(Arc::clone(&payload)).is_ok());
        subscribers.len()
    }

    fn release(&self, streamer_id: &str, id: u64) {
        if let Ok(mut streamers) = self.inner.streamers.lock() {
            if let Some(subscribers) = streamers.get_mut(streamer_id) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    streamers.remove(streamer_id);
                }
            }
        }
        let total = self.inner.total.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("overlay_clients").set(total as f64);
    }
}

pub struct ClientGuard {
    hub: OverlayHub,
    streamer_id: String,
    id: u64,
}

impl ClientGuard {
    pub fn streamer_id(&self) -> &str {
        &self.streamer_id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.hub.release(&self.streamer_id, self.id);
    }
}

/// `GET /overlay/:alert_token/ws`
///
/// Admission runs before the upgrade so refused clients get a problem response.
pub async fn overlay_ws(
    State(state): State<AppState>,
    Path(alert_token): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let context = client_context(&headers, peer, state.config().security.trust_forwarded_for);

    let profile = match state
        .gate()
        .authorize(&alert_token, &context, AccessKind::Connection)
        .await
    {
        Ok(profile) => profile,
        Err(rejection) => return rejection.into_response(),
    };

    let max_connections = profile.security.max_connections as usize;
    let Some(registration) = state
        .overlay()
        .try_register(&profile.streamer_id, max_connections)
    else {
        let rejection = state
            .gate()
            .connection_limit(&profile.streamer_id, &context, max_connections)
            .await;
        return rejection.into_response();
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    info!(
        stage = "overlay",
        streamer_id = %profile.streamer_id,
        ip = %context.ip_label(),
        "overlay client admitted"
    );
    upgrade.on_upgrade(move |socket| run_session(socket, state, registration))
}

async fn run_session(socket: WebSocket, state: AppState, registration: Registration) {
    let Registration { guard, receiver } = registration;
    let streamer_id = guard.streamer_id().to_string();
    let (mut sender, mut inbound) = socket.split();

    let hello = ServerMessage::Connected {
        streamer_id: &streamer_id,
    };
    if let Ok(json) = serde_json::to_string(&hello) {
        if sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }
    state.alerts().clients_changed(&streamer_id);

    let mut send_task = tokio::spawn(async move {
        let mut outbound = UnboundedReceiverStream::new(receiver);
        while let Some(payload) = outbound.next().await {
            if sender.send(Message::Text(payload.to_string())).await.is_err() {
                break;
            }
        }
    });

    let alerts = state.alerts().clone();
    let session_streamer = streamer_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = inbound.next().await {
            match message {
                Message::Text(text) => match parse_client_message(&text) {
                    Some(ClientMessage::AlertCompleted {
                        alert_id,
                        streamer_id,
                    }) => {
                        if streamer_id != session_streamer {
                            warn!(
                                stage = "overlay",
                                streamer_id = %session_streamer,
                                claimed = %streamer_id,
                                "ignoring ack for another streamer"
                            );
                            continue;
                        }
                        alerts.ack(&session_streamer, &alert_id);
                    }
                    Some(ClientMessage::Ping) => {}
                    None => {
                        warn!(stage = "overlay", streamer_id = %session_streamer, "ignoring malformed client message");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    drop(guard);
    debug!(stage = "overlay", streamer_id = %streamer_id, "overlay client disconnected");
    state.alerts().clients_changed(&streamer_id);
}
