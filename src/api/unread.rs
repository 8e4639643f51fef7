use axum::{debug_handler, extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::{auth::AuthUser, db, ApiError, AppResult, AppState};

use super::non_empty;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UnreadBody {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn add_unread(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(UnreadBody { chat_id, message_id }): Json<UnreadBody>,
) -> AppResult<Json<Value>> {
    let (Some(chat_id), Some(message_id)) = (non_empty(chat_id), non_empty(message_id)) else {
        return Err(ApiError::BadRequest("required data not passed with the request").into());
    };
    if !db::is_participant(&db_pool, &chat_id, &user_id).await? {
        return Err(ApiError::NotFound("chat").into());
    }
    if !db::message_in_chat(&db_pool, &chat_id, &message_id).await? {
        return Err(ApiError::NotFound("message").into());
    }

    let added = db::add_unread(&db_pool, &user_id, &chat_id, &message_id).await?;
    Ok(Json(json!({ "success": true, "added": added })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn remove_unread(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(UnreadBody { chat_id, .. }): Json<UnreadBody>,
) -> AppResult<Json<Value>> {
    let Some(chat_id) = non_empty(chat_id) else {
        return Err(ApiError::BadRequest("chat not sent with request").into());
    };

    let removed = db::clear_unread(&db_pool, &user_id, &chat_id).await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn list_unread(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<Value>> {
    let unread = db::unread_for_user(&db_pool, &user_id).await?;
    Ok(Json(json!({ "success": true, "unread": unread })))
}
