use crate::state::AppState;
use crate::storage::MirrorError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chatmirror_messaging::{
    ChatAggregate, Message, ReactionType, Received, SendReceipt, TransportError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
pub struct ChatSummary {
    id: i64,
    name: String,
    recipients: Vec<String>,
    is_group: bool,
    is_imessage: bool,
    most_recent: Option<Received>,
}

impl ChatSummary {
    fn of(chat: &ChatAggregate) -> Self {
        Self {
            id: chat.id(),
            name: chat.name(),
            recipients: chat.recipients(),
            is_group: chat.is_group(),
            is_imessage: chat.is_imessage(),
            most_recent: chat.most_recent_message(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    chat_id: i64,
    checkpoint: i64,
    messages: Vec<Message>,
    pending: usize,
}

#[derive(Debug, Deserialize)]
pub struct SendPayload {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct NewChatPayload {
    pub recipients: Vec<String>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionPayload {
    pub message_id: i64,
    /// Host reaction code, 2000..=2005 to add or 3000..=3005 to remove.
    pub reaction: ReactionType,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("chat {0} not found")]
    ChatNotFound(i64),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Mirror(MirrorError),
}

impl From<MirrorError> for ApiError {
    fn from(err: MirrorError) -> Self {
        match err {
            MirrorError::ChatGone(id) => ApiError::ChatNotFound(id),
            other => ApiError::Mirror(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ChatNotFound(_) | ApiError::Transport(TransportError::UnknownTarget(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Transport(TransportError::Unreachable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Transport(_) => StatusCode::BAD_GATEWAY,
            ApiError::Mirror(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(%status, error = %self, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chats", get(list_chats).post(new_chat))
        .route("/chats/:chat_id/messages", get(messages).post(send_message))
        .route("/chats/:chat_id/reactions", post(send_reaction))
}

async fn list_chats(State(state): State<Arc<AppState>>) -> Json<Vec<ChatSummary>> {
    let chats = state.directory().chats_by_recent();
    Json(chats.iter().map(|chat| ChatSummary::of(chat)).collect())
}

async fn messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let chat = state.directory().open(chat_id)?;
    Ok(Json(MessagesResponse {
        chat_id,
        checkpoint: chat.checkpoint(),
        messages: chat.messages(),
        pending: chat.pending_len(),
    }))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(payload): Json<SendPayload>,
) -> Result<(StatusCode, Json<SendReceipt>), ApiError> {
    if payload.text.trim().is_empty() {
        return Err(ApiError::BadRequest("message text is empty".into()));
    }
    let chat = state.directory().open(chat_id)?;
    let recipients = chat.recipients();
    let receipt = chat
        .send_message(state.transport(), &payload.text, &recipients)
        .await;
    debug!(chat_id, temp_id = receipt.temp_id, status = ?receipt.status, "send accepted");
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn new_chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewChatPayload>,
) -> Result<(StatusCode, Json<SendReceipt>), ApiError> {
    if payload.text.trim().is_empty() {
        return Err(ApiError::BadRequest("message text is empty".into()));
    }
    if payload.recipients.is_empty() {
        return Err(ApiError::BadRequest("at least one recipient is required".into()));
    }
    let chat = state.directory().start_conversation(Vec::<String>::new());
    if !chat.add_recipients(payload.recipients) {
        return Err(ApiError::BadRequest("recipients must not be empty".into()));
    }
    let recipients = chat.recipients();
    let receipt = chat
        .send_message(state.transport(), &payload.text, &recipients)
        .await;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn send_reaction(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(payload): Json<ReactionPayload>,
) -> Result<StatusCode, ApiError> {
    let chat = state.directory().open(chat_id)?;
    chat.send_reaction(state.transport(), payload.message_id, payload.reaction)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
