use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::Deserialize;
use tracing::{error, warn};

use murmur_sync::{MessageCache, SyncError};
use murmur_types::api::{
    CountResponse, CreateChannelRequest, MarkReadRequest, RebuildResponse, SendMessageRequest,
    UpdateProfileRequest, WatermarkResponse,
};
use murmur_types::{Channel, ChannelId, MessageId, Order, UserId};

pub type AppState = Arc<MessageCache>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/channels", post(create_channel))
        .route("/channels/{channel_id}/messages", get(get_messages).post(send_message))
        .route("/channels/{channel_id}/count", get(get_count))
        .route("/channels/{channel_id}/read", post(mark_read))
        .route("/users/{user_id}/unread", get(get_unread))
        .route("/users/{user_id}/profile", put(update_profile))
        .route("/admin/rebuild", post(rebuild))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub after: i64,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub order: Option<String>,
    /// When set, the newest returned message is marked read for this user.
    pub user_id: Option<i64>,
}

/// Run a blocking cache call off the async runtime.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce(&MessageCache) -> Result<T, SyncError> + Send + 'static,
{
    let cache = state.clone();
    tokio::task::spawn_blocking(move || f(&cache))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(status_for)
}

fn status_for(err: SyncError) -> StatusCode {
    match err {
        SyncError::UnknownAuthor(user) => {
            warn!(user = %user, "rejected request for unknown user");
            StatusCode::NOT_FOUND
        }
        other => {
            error!("request failed: {}", other);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn channel_id(raw: i64) -> Result<ChannelId, StatusCode> {
    if raw <= 0 {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(ChannelId(raw))
}

pub async fn create_channel(
    State(state): State<AppState>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let description = req.description;
    let (n, d) = (name.clone(), description.clone());
    let id = blocking(&state, move |cache| cache.create_channel(&n, &d)).await?;

    Ok((StatusCode::CREATED, Json(Channel { id, name, description })))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(raw_channel): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let channel = channel_id(raw_channel)?;
    if req.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let message = blocking(&state, move |cache| cache.append(channel, req.user_id, &req.content)).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(raw_channel): Path<i64>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let channel = channel_id(raw_channel)?;
    if query.after < 0 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let order = match query.order.as_deref() {
        Some(raw) => raw.parse::<Order>().map_err(|_| StatusCode::BAD_REQUEST)?,
        None => Order::Ascending,
    };
    let after = MessageId(query.after);

    let messages = blocking(&state, move |cache| match query.user_id {
        Some(user) => cache.fetch_and_mark(UserId(user), channel, after, query.limit),
        None => cache.range(channel, after, query.limit, query.offset, order),
    })
    .await?;
    Ok(Json(messages))
}

pub async fn get_count(
    State(state): State<AppState>,
    Path(raw_channel): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let channel_id = channel_id(raw_channel)?;
    let count = blocking(&state, move |cache| cache.count(channel_id)).await?;
    Ok(Json(CountResponse { channel_id, count }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(raw_channel): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let channel_id = channel_id(raw_channel)?;
    if req.message_id.get() < 0 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let user_id = req.user_id;

    let message_id = blocking(&state, move |cache| {
        cache.mark_read(user_id, channel_id, req.message_id)?;
        cache.watermark(user_id, channel_id)
    })
    .await?;
    Ok(Json(WatermarkResponse {
        user_id,
        channel_id,
        message_id,
    }))
}

pub async fn get_unread(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let unread = blocking(&state, move |cache| cache.unread_counts(UserId(user_id))).await?;
    Ok(Json(unread))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.display_name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let changed = blocking(&state, move |cache| {
        cache.update_profile(UserId(user_id), &req.display_name, &req.avatar_icon)
    })
    .await?;
    if !changed {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rebuild(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let report = blocking(&state, |cache| cache.initialize_all()).await?;
    Ok(Json(RebuildResponse {
        channels: report.channels,
        messages: report.messages,
        read_positions: report.read_positions,
    }))
}
