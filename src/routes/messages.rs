use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    debug_handler,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    model::{AudioBlob, Message},
    sync::MessageSync,
    AppResult,
};

const DEFAULT_VOICE_TYPE: &str = "audio/webm";

#[derive(Deserialize)]
pub(crate) struct SendMessageQuery {
    pub(crate) content: String,
}

#[derive(Deserialize)]
pub(crate) struct ReactQuery {
    emoji: String,
}

#[derive(Deserialize)]
pub(crate) struct ReportQuery {
    reason: String,
}

#[derive(Deserialize)]
pub(crate) struct AutoRefreshQuery {
    enabled: bool,
    interval_ms: Option<u64>,
}

/// A view of a message for the signed-in viewer.
#[derive(Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    message: Message,
    author_name: String,
    can_delete: bool,
}

#[debug_handler(state = crate::AppState)]
pub async fn list(State(sync): State<Arc<MessageSync>>) -> Json<Vec<MessageView>> {
    let viewer = sync.store().current_user().await;
    let views = sync
        .messages()
        .into_iter()
        .map(|message| MessageView {
            author_name: message.author_name().to_owned(),
            can_delete: viewer.as_ref().is_some_and(|v| v.user_id == message.user_id),
            message,
        })
        .collect();
    Json(views)
}

#[debug_handler(state = crate::AppState)]
pub async fn pinned(State(sync): State<Arc<MessageSync>>) -> Json<Vec<Message>> {
    Json(sync.pinned())
}

#[debug_handler(state = crate::AppState)]
pub async fn send(
    State(sync): State<Arc<MessageSync>>,
    Json(SendMessageQuery { content }): Json<SendMessageQuery>,
) -> AppResult<Response> {
    Ok(match sync.send(&content).await? {
        Some(message) => (StatusCode::CREATED, Json(message)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[debug_handler(state = crate::AppState)]
pub async fn edit(
    State(sync): State<Arc<MessageSync>>,
    Path(id): Path<String>,
    Json(SendMessageQuery { content }): Json<SendMessageQuery>,
) -> AppResult<StatusCode> {
    sync.edit(&id, &content).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = crate::AppState)]
pub async fn delete(
    State(sync): State<Arc<MessageSync>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    sync.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = crate::AppState)]
pub async fn toggle_pin(
    State(sync): State<Arc<MessageSync>>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    Ok(match sync.toggle_pin(&id).await? {
        Some(is_pinned) => Json(json!({ "is_pinned": is_pinned })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

#[debug_handler(state = crate::AppState)]
pub async fn react(
    State(sync): State<Arc<MessageSync>>,
    Path(id): Path<String>,
    Json(ReactQuery { emoji }): Json<ReactQuery>,
) -> AppResult<StatusCode> {
    sync.react(&id, &emoji).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = crate::AppState)]
pub async fn report(
    State(sync): State<Arc<MessageSync>>,
    Path(id): Path<String>,
    Json(ReportQuery { reason }): Json<ReportQuery>,
) -> AppResult<StatusCode> {
    sync.report(&id, &reason).await?;
    Ok(StatusCode::CREATED)
}

#[debug_handler(state = crate::AppState)]
pub async fn history(State(sync): State<Arc<MessageSync>>) -> impl IntoResponse {
    Json(json!({ "messages": sync.history(), "has_more": sync.has_more() }))
}

/// Answers with just the newly paged-in messages.
#[debug_handler(state = crate::AppState)]
pub async fn load_more(State(sync): State<Arc<MessageSync>>) -> AppResult<impl IntoResponse> {
    let added = sync.load_more().await?;
    let history = sync.history();
    let page = &history[history.len() - added..];
    Ok(Json(json!({ "messages": page, "has_more": sync.has_more() })))
}

#[debug_handler(state = crate::AppState)]
pub async fn refresh(State(sync): State<Arc<MessageSync>>) -> AppResult<impl IntoResponse> {
    let applied = sync.refresh().await?;
    Ok(Json(json!({ "applied": applied })))
}

/// The body is the raw recording; its `Content-Type` picks the file extension.
#[debug_handler(state = crate::AppState)]
pub async fn send_voice(
    State(sync): State<Arc<MessageSync>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_VOICE_TYPE);

    let message = sync.send_voice(AudioBlob::new(body.to_vec(), content_type)).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[debug_handler(state = crate::AppState)]
pub async fn auto_refresh(
    State(sync): State<Arc<MessageSync>>,
    Json(AutoRefreshQuery { enabled, interval_ms }): Json<AutoRefreshQuery>,
) -> impl IntoResponse {
    match interval_ms {
        Some(ms) if enabled => sync.schedule_auto_refresh(Duration::from_millis(ms)),
        _ => sync.set_auto_refresh(enabled),
    }
    Json(json!({
        "enabled": sync.auto_refresh_enabled(),
        "interval_ms": sync.refresh_interval().as_millis() as u64,
    }))
}
