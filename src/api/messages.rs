use axum::{debug_handler, extract::{Path, State}, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::{auth::AuthUser, db::{self, Chat, Message}, ApiError, AppResult, AppState};

use super::non_empty;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendMessageBody {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Builds the payload clients relay through `send-message`: the message with its chat and
/// participant list populated.
fn relay_payload(message: &Message, chat: &Chat) -> Value {
    json!({
        "id": message.id,
        "content": message.content,
        "createdAt": message.created_at,
        "sender": { "id": message.sender_id },
        "chat": {
            "id": chat.id,
            "isGroupChat": chat.is_group_chat,
            "groupName": chat.group_name,
            "latestMessage": chat.latest_message,
            "users": chat.users.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
        },
    })
}

#[debug_handler(state = AppState)]
pub(crate) async fn send_message(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(SendMessageBody { chat_id, content }): Json<SendMessageBody>,
) -> AppResult<Json<Value>> {
    let (Some(chat_id), Some(content)) = (non_empty(chat_id), non_empty(content)) else {
        return Err(ApiError::BadRequest("required data not passed with the request").into());
    };
    if !db::is_participant(&db_pool, &chat_id, &user_id).await? {
        return Err(ApiError::NotFound("chat").into());
    }

    let message = db::insert_message(&db_pool, &chat_id, &user_id, &content).await?;
    let chat = db::chat(&db_pool, &chat_id)
        .await?
        .ok_or(ApiError::NotFound("chat"))?;

    tracing::debug!(chat_id = %chat_id, message_id = %message.id, sender = %user_id, "message stored");
    Ok(Json(json!({ "success": true, "message": relay_payload(&message, &chat) })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn fetch_all_messages(
    Path(chat_id): Path<String>,
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<Value>> {
    if !db::is_participant(&db_pool, &chat_id, &user_id).await? {
        return Err(ApiError::NotFound("chat").into());
    }

    let messages = db::messages_for_chat(&db_pool, &chat_id).await?;
    Ok(Json(json!({ "success": true, "allMessages": messages })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeleteMessageBody {
    #[serde(default)]
    message_id: Option<String>,
}

/// Deletes one of the caller's own messages.
#[debug_handler(state = AppState)]
pub(crate) async fn delete_message(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(DeleteMessageBody { message_id }): Json<DeleteMessageBody>,
) -> AppResult<Json<Value>> {
    let Some(message_id) = non_empty(message_id) else {
        return Err(ApiError::BadRequest("message not sent with request").into());
    };

    let message = db::delete_message(&db_pool, &message_id, &user_id)
        .await?
        .ok_or(ApiError::NotFound("message"))?;
    Ok(Json(json!({ "success": true, "message": message })))
}
