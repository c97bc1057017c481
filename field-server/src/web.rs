//! Operator and display HTTP surface.
//!
//! A handful of match-control routes, the arena status document, and a
//! WebSocket that forwards notifier events as JSON so displays, sound
//! players and scoreboards can follow along without touching the arena
//! lock.

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::arena::{ArenaError, MatchState, ScoreUpdate, SharedArena, StationId};
use crate::store::{EventSettings, Match, MatchType, Team};

/// One event on the display socket.
#[derive(Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum DisplayEvent {
    MatchState { state: MatchState },
    MatchTime { seconds: i64 },
    RealtimeScore { scores: ScoreUpdate },
    AudienceDisplay { screen: String },
    PlaySound { sound: String },
}

/// Request body for a team substitution.
#[derive(Deserialize)]
struct SubstituteRequest {
    team_id: u32,
    station: StationId,
}

/// Builds the operator router around the shared arena.
pub fn router(arena: SharedArena) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/settings", get(get_settings_handler).post(save_settings_handler))
        .route("/teams", post(create_team_handler))
        .route("/matches", post(create_match_handler).delete(truncate_matches_handler))
        .route("/matches/{id}", delete(delete_match_handler))
        .route("/matches/type/{type}", get(list_matches_handler))
        .route("/match/load-next", post(load_next_handler))
        .route("/match/substitute", post(substitute_handler))
        .route("/match/start", post(start_handler))
        .route("/match/abort", post(abort_handler))
        .route("/match/reset", post(reset_handler))
        .route("/displays/websocket", get(display_websocket_handler))
        .with_state(arena)
}

async fn status_handler(State(arena): State<SharedArena>) -> impl IntoResponse {
    axum::Json(arena.lock().await.status())
}

async fn get_settings_handler(State(arena): State<SharedArena>) -> impl IntoResponse {
    axum::Json(arena.lock().await.store.get_event_settings().clone())
}

/// Persists new event settings and reinitializes the components derived
/// from them.
async fn save_settings_handler(
    State(arena): State<SharedArena>,
    axum::Json(settings): axum::Json<EventSettings>,
) -> (StatusCode, String) {
    let mut arena = arena.lock().await;
    if let Err(err) = arena.store.save_event_settings(settings).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }
    command_response(arena.load_settings().await)
}

async fn create_team_handler(
    State(arena): State<SharedArena>,
    axum::Json(team): axum::Json<Team>,
) -> (StatusCode, String) {
    match arena.lock().await.store.create_team(team).await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn create_match_handler(
    State(arena): State<SharedArena>,
    axum::Json(mut match_record): axum::Json<Match>,
) -> (StatusCode, String) {
    match arena.lock().await.store.create_match(&mut match_record).await {
        Ok(()) => (StatusCode::OK, match_record.id.to_string()),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn truncate_matches_handler(State(arena): State<SharedArena>) -> (StatusCode, String) {
    match arena.lock().await.store.truncate_matches().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn delete_match_handler(
    State(arena): State<SharedArena>,
    Path(match_id): Path<i64>,
) -> (StatusCode, String) {
    let mut arena = arena.lock().await;
    if arena.store.get_match_by_id(match_id).is_none() {
        return (StatusCode::NOT_FOUND, "no such match".to_string());
    }
    match arena.store.delete_match(match_id).await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn list_matches_handler(
    State(arena): State<SharedArena>,
    Path(match_type): Path<MatchType>,
) -> impl IntoResponse {
    axum::Json(arena.lock().await.store.get_matches_by_type(match_type))
}

async fn substitute_handler(
    State(arena): State<SharedArena>,
    axum::Json(request): axum::Json<SubstituteRequest>,
) -> (StatusCode, String) {
    command_response(
        arena
            .lock()
            .await
            .substitute_team(request.team_id, request.station)
            .await,
    )
}

async fn load_next_handler(State(arena): State<SharedArena>) -> impl IntoResponse {
    command_response(arena.lock().await.load_next_match())
}

async fn start_handler(State(arena): State<SharedArena>) -> impl IntoResponse {
    command_response(arena.lock().await.start_match().await)
}

async fn abort_handler(State(arena): State<SharedArena>) -> impl IntoResponse {
    command_response(arena.lock().await.abort_match())
}

async fn reset_handler(State(arena): State<SharedArena>) -> impl IntoResponse {
    command_response(arena.lock().await.reset_match())
}

/// Precondition and gate failures carry their operator-readable message.
fn command_response(result: Result<(), ArenaError>) -> (StatusCode, String) {
    match result {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn display_websocket_handler(
    ws: WebSocketUpgrade,
    State(arena): State<SharedArena>,
) -> impl IntoResponse {
    // Snapshot the subscriptions while the lock is held, then stream.
    let (states, times, scores, screens, sounds) = {
        let arena = arena.lock().await;
        (
            arena.match_state_notifier.subscribe(),
            arena.match_time_notifier.subscribe(),
            arena.realtime_score_notifier.subscribe(),
            arena.audience_display_notifier.subscribe(),
            arena.play_sound_notifier.subscribe(),
        )
    };
    ws.on_upgrade(move |socket| {
        forward_display_events(socket, states, times, scores, screens, sounds)
    })
}

async fn forward_display_events(
    socket: WebSocket,
    mut states: tokio::sync::broadcast::Receiver<MatchState>,
    mut times: tokio::sync::broadcast::Receiver<i64>,
    mut scores: tokio::sync::broadcast::Receiver<ScoreUpdate>,
    mut screens: tokio::sync::broadcast::Receiver<String>,
    mut sounds: tokio::sync::broadcast::Receiver<String>,
) {
    // By splitting, inbound pings keep flowing while we push events.
    let (mut sender, _receiver) = socket.split();

    loop {
        let event = tokio::select! {
            state = states.recv() => match state {
                Ok(state) => DisplayEvent::MatchState { state },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            seconds = times.recv() => match seconds {
                Ok(seconds) => DisplayEvent::MatchTime { seconds },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            update = scores.recv() => match update {
                Ok(scores) => DisplayEvent::RealtimeScore { scores },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            screen = screens.recv() => match screen {
                Ok(screen) => DisplayEvent::AudienceDisplay { screen },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            sound = sounds.recv() => match sound {
                Ok(sound) => DisplayEvent::PlaySound { sound },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        };
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}
