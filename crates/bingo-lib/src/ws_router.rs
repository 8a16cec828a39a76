// ============================
// bingo-lib/src/ws_router.rs
// ============================
//! WebSocket relay route and the REST persistence routes.
use crate::error::AppError;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION, WS_DISCONNECTION};
use crate::storage::{BingoCall, RoomRepository};
use crate::validation;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bingo_common::{ClientFrame, RoomState};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Create the relay router
pub fn create_router<S: RoomRepository + Clone + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<S>))
        .route("/health", get(health))
        .route(
            "/api/rooms/{room_id}",
            get(fetch_room::<S>).put(save_room::<S>).delete(clear_room::<S>),
        )
        .route("/api/rooms/{room_id}/exists", get(room_exists::<S>))
        .route(
            "/api/rooms/{room_id}/calls",
            get(list_calls::<S>).post(record_call::<S>),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Handler for WebSocket connections
pub async fn ws_handler<S: RoomRepository + Clone + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    counter!(WS_CONNECTION).increment(1);
    gauge!(WS_ACTIVE).increment(1.0);

    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection<S: RoomRepository + Clone + 'static>(
    socket: WebSocket,
    state: Arc<AppState<S>>,
) {
    let (mut tx, mut rx) = socket.split();
    let (mut conn, mut frames) = state.hub.connect();
    let member = conn.member_id();
    debug!(member, "websocket connected");

    // Forward hub frames to the socket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                },
            };
            if tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = rx.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(frame) => conn.process(frame),
                Err(e) => conn.reply_error(&AppError::Json(e)),
            },
            Message::Close(_) => break,
            _ => {},
        }
    }

    // Leaving the channel happens when the connection drops
    let channel = conn.channel().map(str::to_string);
    drop(conn);
    send_task.abort();

    info!(member, channel = ?channel, "websocket disconnected");
    counter!(WS_DISCONNECTION).increment(1);
    gauge!(WS_ACTIVE).decrement(1.0);
}

async fn fetch_room<S: RoomRepository + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomState>, AppError> {
    validation::validate_room_id(&room_id)?;
    state
        .storage
        .fetch(&room_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("room {room_id}")))
}

async fn save_room<S: RoomRepository + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(room_id): Path<String>,
    Json(room): Json<RoomState>,
) -> Result<StatusCode, AppError> {
    validation::validate_room_id(&room_id)?;
    state.storage.save(&room_id, &room).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_room<S: RoomRepository + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(room_id): Path<String>,
) -> Result<StatusCode, AppError> {
    validation::validate_room_id(&room_id)?;
    state.storage.clear(&room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn room_exists<S: RoomRepository + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(room_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    validation::validate_room_id(&room_id)?;
    let exists = state.storage.exists(&room_id).await?;
    Ok(Json(json!({ "exists": exists })))
}

async fn list_calls<S: RoomRepository + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<BingoCall>>, AppError> {
    validation::validate_room_id(&room_id)?;
    Ok(Json(state.storage.list_calls(&room_id).await?))
}

async fn record_call<S: RoomRepository + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(room_id): Path<String>,
    Json(call): Json<BingoCall>,
) -> Result<StatusCode, AppError> {
    validation::validate_room_id(&room_id)?;
    if call.room_id != room_id {
        return Err(AppError::InvalidInput(format!(
            "call belongs to room {}, not {room_id}",
            call.room_id
        )));
    }
    state.storage.record_call(&room_id, &call).await?;
    Ok(StatusCode::CREATED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::storage::MemoryStorage;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, MemoryStorage) {
        let storage = MemoryStorage::new();
        let state = Arc::new(AppState::new(storage.clone(), Settings::default()));
        (create_router(state), storage)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_room_is_404() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/api/rooms/abc123").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_then_exists() {
        let (app, storage) = app();
        let mut room = RoomState::default();
        room.drawn_balls = vec![33];

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/rooms/abc123")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&room).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(storage.snapshot("abc123"), Some(room));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/rooms/abc123/exists")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_room_id_is_rejected() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/api/rooms/NOT_OK").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
