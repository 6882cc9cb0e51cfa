//! HTTP API for the owl.
//!
//! Runs on port 9123 by default. `/owl/command` accepts the same body shape
//! older owl clients send:
//!
//! ```text
//! { "speech": { "text": "..." },
//!   "movements": [ { "type": 1, "duration": 0.5 }, ... ]   // or
//!   "macro": "happy"                                       // or
//!   "movement": { "type": 3 } }
//! ```
//!
//! Everything is published on the event bus and the response returns
//! immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::warn;

use hoot_core::annotate::MovementDescriptor;
use hoot_core::types::{ConnectionState, Macro, MovementRequest, OwlStatus};

use crate::events::{EventBus, OwlEvent};
use crate::sequencer::Sequencer;

#[derive(Clone)]
pub struct AppState {
    pub sequencer: Sequencer,
    pub bus: EventBus,
    /// Utterances in progress, maintained by [`crate::speech::SpeechHooks::tracking`].
    pub speaking: Arc<AtomicUsize>,
}

/// Build the axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/owl/command", post(command))
        .route("/owl/say", post(say))
        .route("/owl/cancel", post(cancel))
        .route("/owl/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request / response types ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub speech: Option<SpeechBody>,
    #[serde(default)]
    pub movements: Option<Vec<MovementDescriptor>>,
    #[serde(default, rename = "macro")]
    pub macro_name: Option<String>,
    #[serde(default)]
    pub movement: Option<MovementDescriptor>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SpeechBody {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize)]
struct SayRequest {
    text: String,
}

#[derive(Serialize)]
struct CommandResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

type ApiError = (StatusCode, String);

/// Turn a command body into events. Speech comes first; then `movements`,
/// `macro` or `movement`, whichever is present first in that order.
pub fn plan_command(req: CommandRequest) -> Result<Vec<OwlEvent>, String> {
    let mut events = Vec::new();

    if let Some(text) = req.speech.map(|s| s.text).filter(|t| !t.trim().is_empty()) {
        events.push(OwlEvent::TextReceived(text));
    }

    if let Some(movements) = req.movements {
        let batch: Vec<MovementRequest> = movements
            .iter()
            .filter_map(|d| match d.key.resolve() {
                Some(movement) => Some(MovementRequest::new(movement, d.duration)),
                None => {
                    warn!("server: invalid movement type {:?}", d.key);
                    None
                }
            })
            .collect();
        if !batch.is_empty() {
            events.push(OwlEvent::MovementBatch(batch));
        }
    } else if let Some(name) = req.macro_name {
        let macro_kind: Macro = name.parse().map_err(|_| "Unknown macro".to_string())?;
        events.push(OwlEvent::MovementBatch(macro_kind.batch()));
    } else if let Some(single) = req.movement {
        let movement = single
            .key
            .resolve()
            .ok_or_else(|| "Invalid movement type".to_string())?;
        events.push(OwlEvent::MovementBatch(vec![MovementRequest::new(movement, 0.0)]));
    }

    Ok(events)
}

/// Snapshot of the owl's state.
pub fn owl_status(state: &AppState) -> OwlStatus {
    let sequencer = &state.sequencer;
    let (link, port) = match sequencer.motion() {
        Some(motion) => (motion.link().state(), motion.link().port().to_string()),
        None => (ConnectionState::Disconnected, String::new()),
    };
    OwlStatus {
        link,
        port,
        active_runs: sequencer.active_runs(),
        motion_enabled: sequencer.motion_enabled(),
        speaking: state.speaking.load(Ordering::SeqCst) > 0,
    }
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let events = plan_command(req).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    for event in events {
        state.bus.publish(event);
    }
    Ok(Json(CommandResponse {
        status: "command received",
    }))
}

async fn say(
    State(state): State<AppState>,
    Json(req): Json<SayRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if req.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "text is empty".into()));
    }
    state.bus.publish(OwlEvent::TextReceived(req.text));
    Ok(Json(OkResponse { ok: true }))
}

async fn cancel(State(state): State<AppState>) -> Json<OkResponse> {
    state.sequencer.cancel_all();
    Json(OkResponse { ok: true })
}

async fn status(State(state): State<AppState>) -> Json<OwlStatus> {
    Json(owl_status(&state))
}
