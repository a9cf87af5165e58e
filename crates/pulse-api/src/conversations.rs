use axum::{
    Json,
    extract::{Path, Query, State},
};
use tracing::error;
use uuid::Uuid;

use pulse_types::api::{ConversationResponse, MessageResponse, ThreadQuery};
use pulse_types::error::CoreError;

use crate::{AppState, error::ApiError};

/// `GET /users/{user_id}/conversations`
///
/// Per-peer summaries (last message, unread count), most recent first.
pub async fn get_conversations(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<ConversationResponse>>, ApiError> {
    let db = state.db.clone();
    let uid = user_id.to_string();

    let summaries = tokio::task::spawn_blocking(move || db.list_conversations(&uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError(CoreError::Persistence(e.into()))
        })??;

    Ok(Json(summaries.into_iter().map(Into::into).collect()))
}

/// `GET /users/{user_id}/threads/{other_user_id}?limit=N`
///
/// The most recent `limit` messages between the pair, oldest-first. Opening
/// a thread is what marks it read: every returned message addressed to the
/// viewer transitions to delivered+read as a side effect.
pub async fn get_thread(
    State(state): State<AppState>,
    Path((user_id, other_user_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    if user_id == other_user_id {
        return Err(ApiError(CoreError::Validation(
            "a thread needs two distinct users".into(),
        )));
    }

    let db = state.db.clone();
    let viewer = user_id.to_string();
    let other = other_user_id.to_string();
    let limit = query.limit.min(200);

    let messages = tokio::task::spawn_blocking(move || db.fetch_thread(&viewer, &other, limit))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError(CoreError::Persistence(e.into()))
        })??;

    Ok(Json(messages.into_iter().map(Into::into).collect()))
}
