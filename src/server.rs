//! Operator Surface
//!
//! JSON-over-HTTP commands and queries against a running orchestrator, plus a
//! WebSocket that forwards every fleet event as it is published.

use axum::{
    extract::{ws::{Message as WsMessage, WebSocket, WebSocketUpgrade}, Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::FleetError;
use crate::orchestrator::{HarvestMode, OrchestratorHandle};

pub struct ServerError(anyhow::Error);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<FleetError>() {
            Some(FleetError::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for ServerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
}

#[derive(Deserialize)]
struct FailureQuery {
    hours: Option<i64>,
}

#[derive(Deserialize)]
struct HarvestModeRequest {
    mode: String,
}

#[derive(Deserialize)]
struct EmergencyRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/api/status", get(status))
        .route("/api/failures", get(failures))
        .route("/api/manual-queue", get(manual_queue))
        .route("/api/cycle", post(force_cycle))
        .route("/api/harvest-mode", post(set_harvest_mode))
        .route("/api/emergency", post(trigger_emergency))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState, addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Operator API listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot().await)
}

async fn failures(State(state): State<AppState>, Query(q): Query<FailureQuery>) -> Result<impl IntoResponse, ServerError> {
    let hours = q.hours.unwrap_or(24);
    if hours <= 0 {
        return Err(FleetError::invalid("hours must be positive").into());
    }
    Ok(Json(state.orchestrator.failure_report(hours)))
}

async fn manual_queue(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.manual_queue())
}

async fn force_cycle(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.force_cycle().await)
}

async fn set_harvest_mode(
    State(state): State<AppState>,
    Json(req): Json<HarvestModeRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let mode: HarvestMode = req.mode.parse()?;
    let previous = state.orchestrator.set_harvest_mode(mode).await;
    Ok(Json(serde_json::json!({ "previous": previous, "mode": mode })))
}

async fn trigger_emergency(
    State(state): State<AppState>,
    Json(req): Json<EmergencyRequest>,
) -> impl IntoResponse {
    let reason = req.reason.unwrap_or_else(|| "manual trigger".to_string());
    let activated = state.orchestrator.trigger_emergency(reason);
    let status = if activated { StatusCode::OK } else { StatusCode::CONFLICT };
    (
        status,
        Json(serde_json::json!({ "activated": activated, "emergency_mode": state.orchestrator.is_emergency() })),
    )
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_events(socket, state))
}

async fn forward_events(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.orchestrator.subscribe());

    // Greet with the current state so observers need not wait for a heartbeat.
    let snapshot = state.orchestrator.snapshot().await;
    let initial = serde_json::json!({ "type": "Hello", "payload": snapshot });
    if sender.send(WsMessage::Text(initial.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("dropping unserializable {} event: {}", event.kind(), e);
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                    debug!(skipped = n, "websocket observer lagging");
                    continue;
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            },
        }
    }
    debug!("websocket observer disconnected");
}
