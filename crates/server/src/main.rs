use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{ApiContext, ChangeFeed};
use shared::{
    domain::{ActionId, ActionItem, Card, CardId, RetroSession, SessionId, Vote},
    error::{ApiError, ErrorCode},
    protocol::{
        CardPatch, CreateActionRequest, CreateCardRequest, CreateSessionRequest,
        ParticipantQuery, ServerEvent, SessionPatch, Table, VoteRequest,
    },
    template::RetroTemplate,
};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct WsQuery {
    session_id: SessionId,
    table: Table,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        feed: ChangeFeed::new(settings.broadcast_capacity),
    };

    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "retro server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/templates", get(http_list_templates))
        .route("/sessions", get(http_list_sessions).post(http_create_session))
        .route(
            "/sessions/:session_id",
            get(http_get_session).patch(http_update_session),
        )
        .route("/sessions/:session_id/cards", get(http_list_cards))
        .route("/sessions/:session_id/votes", get(http_list_votes))
        .route("/sessions/:session_id/actions", get(http_list_actions))
        .route("/cards", post(http_create_card))
        .route("/cards/:card_id", patch(http_update_card).delete(http_delete_card))
        .route("/votes", post(http_cast_vote).delete(http_remove_vote))
        .route("/actions", post(http_create_action))
        .route("/actions/:action_id", delete(http_delete_action))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    if err.code == ErrorCode::Internal {
        error!(message = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok("ok")
}

async fn http_list_templates() -> Json<Vec<RetroTemplate>> {
    Json(server_api::list_templates())
}

async fn http_list_sessions(State(state): State<Arc<AppState>>) -> ApiResult<Vec<RetroSession>> {
    let sessions = state
        .api
        .storage
        .list_sessions()
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?;
    Ok(Json(sessions))
}

async fn http_create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<RetroSession> {
    let session = server_api::create_session(&state.api, req)
        .await
        .map_err(reject)?;
    Ok(Json(session))
}

async fn http_get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<RetroSession> {
    let session = server_api::get_session(&state.api, session_id)
        .await
        .map_err(reject)?;
    Ok(Json(session))
}

async fn http_update_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(patch): Json<SessionPatch>,
) -> ApiResult<RetroSession> {
    let session = server_api::update_session(&state.api, session_id, patch)
        .await
        .map_err(reject)?;
    Ok(Json(session))
}

async fn http_list_cards(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Vec<Card>> {
    let cards = server_api::list_cards(&state.api, session_id)
        .await
        .map_err(reject)?;
    Ok(Json(cards))
}

async fn http_create_card(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCardRequest>,
) -> ApiResult<Card> {
    let card = server_api::create_card(&state.api, req)
        .await
        .map_err(reject)?;
    Ok(Json(card))
}

async fn http_update_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<CardId>,
    Json(patch): Json<CardPatch>,
) -> ApiResult<Card> {
    let card = server_api::update_card(&state.api, card_id, patch)
        .await
        .map_err(reject)?;
    Ok(Json(card))
}

async fn http_delete_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<CardId>,
    Query(q): Query<ParticipantQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    server_api::delete_card(&state.api, card_id, &q.participant_id)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_votes(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Vec<Vote>> {
    let votes = server_api::list_votes(&state.api, session_id)
        .await
        .map_err(reject)?;
    Ok(Json(votes))
}

/// Returns the stored vote, or `null` when the participant had already voted.
async fn http_cast_vote(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<Option<Vote>> {
    let vote = server_api::cast_vote(&state.api, req.card_id, &req.participant_id)
        .await
        .map_err(reject)?;
    Ok(Json(vote))
}

async fn http_remove_vote(
    State(state): State<Arc<AppState>>,
    Query(q): Query<VoteRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    server_api::remove_vote(&state.api, q.card_id, &q.participant_id)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_actions(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Vec<ActionItem>> {
    let actions = server_api::list_actions(&state.api, session_id)
        .await
        .map_err(reject)?;
    Ok(Json(actions))
}

async fn http_create_action(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateActionRequest>,
) -> ApiResult<ActionItem> {
    let action = server_api::create_action(&state.api, req)
        .await
        .map_err(reject)?;
    Ok(Json(action))
}

async fn http_delete_action(
    State(state): State<Arc<AppState>>,
    Path(action_id): Path<ActionId>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    server_api::delete_action(&state.api, action_id)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, q.session_id, q.table))
}

/// Streams one `(session, table)` change feed to a single subscriber.
///
/// A subscriber that falls behind the broadcast buffer is disconnected rather
/// than left with a silent gap; it resubscribes and refetches.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, session_id: SessionId, table: Table) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.api.feed.subscribe();
    debug!(%session_id, table = table.as_str(), "subscriber connected");

    let send_task = tokio::spawn(async move {
        let ack = ServerEvent::Subscribed { session_id, table };
        let Ok(text) = serde_json::to_string(&ack) else {
            return;
        };
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%session_id, table = table.as_str(), skipped, "subscriber lagged; closing");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Closed) => break,
            };
            if event.session_id != session_id || event.table != table {
                continue;
            }
            let text = match serde_json::to_string(&ServerEvent::Change(event)) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    send_task.abort();
    debug!(%session_id, table = table.as_str(), "subscriber disconnected");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
