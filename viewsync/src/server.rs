//! WebSocket and HTTP front for the engine.
//!
//! Each socket gets two halves: a writer task draining the client's hub
//! queue onto the socket under the write deadline, and the reader loop
//! below, which feeds inbound envelopes to the hub and the chat bridge.
//! Whichever half stops first ends the session and unregisters the client.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{ChatBridge, Origin};
use crate::config::{ConfigError, ViewSyncConfig};
use crate::hub::{ClientConnection, Envelope, EnvelopeType, Outbound, SessionHub, SessionId};
use crate::llm::ModelBackend;
use crate::state::{PlacementPlanner, StateModel, ViewState};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    bridge: Arc<ChatBridge>,
    shutdown: CancellationToken,
}

/// One engine instance: state, hub, bridge and the socket front.
pub struct ViewSyncServer {
    config: ViewSyncConfig,
    bridge: Arc<ChatBridge>,
    shutdown: CancellationToken,
}

impl ViewSyncServer {
    pub fn new(config: ViewSyncConfig, backend: Arc<dyn ModelBackend>) -> Self {
        Self::with_shutdown(config, backend, CancellationToken::new())
    }

    /// Build on a caller-supplied cancellation token; cancelling it has the
    /// same effect as [`ViewSyncServer::stop`].
    pub fn with_shutdown(
        config: ViewSyncConfig,
        backend: Arc<dyn ModelBackend>,
        shutdown: CancellationToken,
    ) -> Self {
        let state = Arc::new(StateModel::new(PlacementPlanner::new(&config.placement)));
        let hub = Arc::new(SessionHub::new(config.hub.clone(), shutdown.clone()));
        let bridge = Arc::new(ChatBridge::new(
            state,
            hub,
            backend,
            config.bridge.clone(),
            shutdown.clone(),
        ));
        Self {
            config,
            bridge,
            shutdown,
        }
    }

    pub fn config(&self) -> &ViewSyncConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<ChatBridge> {
        &self.bridge
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        self.bridge.hub()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            bridge: self.bridge.clone(),
            shutdown: self.shutdown.clone(),
        };
        Router::new()
            .route(&self.config.server.ws_path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/api/state", get(state_handler))
            .route("/api/chat", post(chat_handler))
            .with_state(state)
    }

    /// Bind the configured address and serve until stopped.
    pub async fn start(&self) -> Result<(), ServerError> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!(
            "[Server] Listening on {} (socket path {}, model backend {})",
            local.map(|a| a.to_string()).unwrap_or_else(|| "?".to_string()),
            self.config.server.ws_path,
            self.bridge.backend_name()
        );

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        // Covers shutdowns triggered by cancelling the token directly.
        self.hub().close_all();
        info!("[Server] Stopped");
        Ok(())
    }

    /// Cancel every task of this engine and close all clients.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("[Server] Shutting down");
        }
        self.shutdown.cancel();
        self.hub().close_all();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: AppState) {
    let connection = state.bridge.attach_client();
    let id = connection.id().clone();
    let hub = state.bridge.hub().clone();
    let write_deadline = hub.config().write_deadline();

    let (sender, mut receiver) = socket.split();
    let mut writer = tokio::spawn(write_loop(sender, connection, write_deadline));
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(message)) => {
                    hub.touch(&id);
                    if !handle_message(&state.bridge, &id, message) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("[Server] Read from {} failed: {}", id, e);
                    break;
                }
                None => break,
            },
        }
    }

    hub.unregister(&id);
    // The writer drains the Close marker queued by unregister and exits.
    if !writer_done && tokio::time::timeout(write_deadline, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!("[Server] Session {} ended", id);
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut connection: ClientConnection,
    deadline: Duration,
) {
    let id = connection.id().clone();
    while let Some(outbound) = connection.next_outbound().await {
        match outbound {
            Outbound::Frame(frame) => {
                match tokio::time::timeout(deadline, sender.send(Message::Text(frame.to_string())))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("[Server] Write to {} failed: {}", id, e);
                        break;
                    }
                    Err(_) => {
                        warn!("[Server] Write to {} exceeded {:?}", id, deadline);
                        break;
                    }
                }
            }
            Outbound::Close => {
                let _ = tokio::time::timeout(deadline, sender.send(Message::Close(None))).await;
                break;
            }
        }
    }
    let _ = sender.close().await;
}

/// Handle one inbound socket message. Returns `false` when the session
/// should end.
fn handle_message(bridge: &Arc<ChatBridge>, id: &SessionId, message: Message) -> bool {
    match message {
        Message::Text(text) => {
            match Envelope::from_json(&text) {
                Ok(envelope) => handle_envelope(bridge, id, envelope),
                Err(e) => debug!("[Server] Ignoring undecodable frame from {}: {}", id, e),
            }
            true
        }
        Message::Close(_) => false,
        // Transport-level ping/pong is answered by the socket layer; binary
        // frames carry nothing for us.
        Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => true,
    }
}

fn handle_envelope(bridge: &Arc<ChatBridge>, id: &SessionId, envelope: Envelope) {
    let hub = bridge.hub();
    match envelope.kind() {
        EnvelopeType::Ping => {
            hub.send_to(id, &Envelope::pong());
        }
        EnvelopeType::Pong => {}
        EnvelopeType::ChatMessage => {
            let Some(text) = envelope.message_text().map(str::to_string) else {
                hub.send_to(id, &Envelope::chat_error("chat_message needs data.message"));
                return;
            };
            // The model call may take a while; keep reading pings meanwhile.
            let bridge = bridge.clone();
            let id = id.clone();
            tokio::spawn(async move {
                bridge.handle_client_message(&id, &text).await;
            });
        }
        EnvelopeType::ViewUpdate => {
            let Some(action) = envelope.action() else {
                hub.send_to(id, &Envelope::chat_error("view_update needs an action"));
                return;
            };
            bridge.handle_client_view_update(id, action, envelope.data());
        }
        EnvelopeType::StateReplace => {
            let result = serde_json::from_value::<ViewState>(envelope.data().clone())
                .map_err(|e| e.to_string())
                .and_then(|view| bridge.replace_state(view).map_err(|e| e.to_string()));
            if let Err(reason) = result {
                debug!("[Server] Rejected state_replace from {}: {}", id, reason);
                hub.send_to(id, &Envelope::chat_error(reason));
            }
        }
        EnvelopeType::LiveUpdate | EnvelopeType::ChatResponse => {
            debug!("[Server] Ignoring server-only {:?} from {}", envelope.kind(), id);
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    clients: usize,
    components: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: !state.shutdown.is_cancelled(),
        clients: state.bridge.hub().client_count(),
        components: state.bridge.state().component_count(),
    })
}

async fn state_handler(State(state): State<AppState>) -> Json<ViewState> {
    Json(state.bridge.state().snapshot())
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    match state.bridge.handle_turn(Origin::Http, &payload.message).await {
        Ok(outcome) => {
            let (action, data) = match outcome.applied {
                Some(update) => (update.action, Some(update.data)),
                None => (None, None),
            };
            Ok(Json(ChatResponse {
                response: outcome.text,
                action,
                data,
            }))
        }
        Err(e) => {
            warn!("[Server] Chat turn failed: {}", e);
            Err((StatusCode::SERVICE_UNAVAILABLE, e.user_message()))
        }
    }
}
