//! # API Module
//!
//! Router assembly and shared application state. Room change notifications
//! flow through per-room broadcast channels exposed as Server-Sent Event
//! streams: subscribers get an event whenever presence or messages change in
//! their room and re-fetch the room queries in response.

use crate::cleanup::CleanupService;
use crate::db::{validate_room_id, RoomStore};
use crate::error::RoomError;
use crate::files::FileService;
use crate::identity::IdentityService;
use crate::messages::MessageService;
use crate::presence::PresenceService;

use axum::{
    extract::{Path, State},
    response::{sse::Event, IntoResponse, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RoomStore>,
    pub identity: IdentityService,
    pub presence: PresenceService,
    pub messages: MessageService,
    pub files: FileService,
    pub cleanup: CleanupService,
    /// Broadcast channel for change events per room
    broadcasters: Arc<dashmap::DashMap<String, broadcast::Sender<Value>>>,
}

impl AppState {
    pub fn new(store: Arc<RoomStore>, jwt_secret: Vec<u8>, storage_root: Option<PathBuf>) -> Self {
        let identity = IdentityService::new(Arc::clone(&store), jwt_secret);
        let presence = PresenceService::new(Arc::clone(&store));
        let messages = MessageService::new(Arc::clone(&store));
        let files = FileService::new(Arc::clone(&store), storage_root);
        let cleanup = CleanupService::new(
            Arc::clone(&store),
            presence.clone(),
            messages.clone(),
            files.clone(),
        );
        Self {
            store,
            identity,
            presence,
            messages,
            files,
            cleanup,
            broadcasters: Arc::new(dashmap::DashMap::new()),
        }
    }

    /// Get or create the broadcaster for a room
    fn room_sender(&self, room_id: &str) -> broadcast::Sender<Value> {
        self.broadcasters
            .entry(room_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(100);
                tx
            })
            .clone()
    }

    /// Publish a change event to a room's subscribers. Rooms with no
    /// subscribers drop the event.
    pub fn publish(&self, room_id: &str, event: Value) {
        let _ = self.room_sender(room_id).send(event);
    }
}

/// Creates the Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .merge(crate::identity::router())
        .merge(crate::presence::router())
        .merge(crate::messages::router())
        .merge(crate::files::router())
        .route("/rooms/:room_id/stream", get(stream_handler))
        .route("/admin/cleanup", post(cleanup_handler));

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Root handler - API info
async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "name": "roomsync",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Presence, chat, and ephemeral file service with SSE room streams",
        "endpoints": {
            "anonymous": "POST /v1/auth/anonymous",
            "refresh": "POST /v1/auth/refresh",
            "logout": "POST /v1/auth/logout",
            "me": "GET /v1/auth/me",
            "profile": "PUT /v1/auth/profile",
            "user": "GET /v1/users/:id",
            "heartbeat": "PUT /v1/rooms/:room_id/presence",
            "presence": "GET /v1/rooms/:room_id/presence",
            "leave": "DELETE /v1/rooms/:room_id/presence",
            "send": "POST /v1/rooms/:room_id/messages",
            "messages": "GET /v1/rooms/:room_id/messages",
            "delete_message": "DELETE /v1/messages/:id",
            "upload": "POST /v1/files",
            "files": "GET /v1/files",
            "download": "GET /v1/files/:storage_id/content",
            "delete_file": "DELETE /v1/files/:id",
            "stream": "GET /v1/rooms/:room_id/stream",
            "cleanup": "POST /v1/admin/cleanup",
            "health": "GET /health"
        }
    }))
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.query_simple("SELECT 1".to_string()).await {
        Ok(_) => Json(json!({
            "status": "healthy",
            "database": "connected"
        })),
        Err(e) => Json(json!({
            "status": "unhealthy",
            "database": "disconnected",
            "error": e.to_string()
        })),
    }
}

/// POST /v1/admin/cleanup - run one sweep now and return the counts
async fn cleanup_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, RoomError> {
    let report = state.cleanup.run_all().await?;
    Ok(Json(json!({ "success": true, "data": report })))
}

/// GET /v1/rooms/:room_id/stream - Server-Sent Events stream of room changes
async fn stream_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RoomError> {
    validate_room_id(&room_id)?;
    info!("New stream subscriber for room: {}", room_id);

    let tx = state.room_sender(&room_id);
    let mut rx = tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().data(json!({
            "event": "connected",
            "room_id": room_id
        }).to_string()));

        loop {
            match rx.recv().await {
                Ok(value) => {
                    yield Ok(Event::default().data(value.to_string()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    yield Ok(Event::default().data(json!({
                        "event": "warning",
                        "message": format!("Missed {} events", n)
                    }).to_string()));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("ping"),
    ))
}
