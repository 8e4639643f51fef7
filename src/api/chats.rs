use std::collections::BTreeSet;

use axum::{debug_handler, extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::{auth::AuthUser, db::{self, Chat}, ApiError, AppResult, AppState};

use super::non_empty;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccessChatBody {
    #[serde(default)]
    user_id: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn access_single_chat(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(AccessChatBody { user_id: other_id }): Json<AccessChatBody>,
) -> AppResult<Json<Chat>> {
    let Some(other_id) = non_empty(other_id) else {
        return Err(ApiError::BadRequest("user id not sent with the request").into());
    };
    if other_id == user_id {
        return Err(ApiError::BadRequest("cannot open a chat with yourself").into());
    }

    let chat = db::access_direct_chat(&db_pool, &user_id, &other_id).await?;
    Ok(Json(chat))
}

#[debug_handler(state = AppState)]
pub(crate) async fn fetch_all_chats(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<Vec<Chat>>> {
    Ok(Json(db::chats_for_user(&db_pool, &user_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewGroupBody {
    #[serde(default)]
    group_name: Option<String>,
    #[serde(default)]
    users: Option<Vec<String>>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn create_group_chat(
    State(db_pool): State<SqlitePool>,
    AuthUser(admin_id): AuthUser,
    Json(NewGroupBody { group_name, users }): Json<NewGroupBody>,
) -> AppResult<Json<Chat>> {
    let Some(users) = users else {
        return Err(ApiError::BadRequest("add members to the group first").into());
    };
    let Some(group_name) = non_empty(group_name) else {
        return Err(ApiError::BadRequest("group name cannot be left empty").into());
    };

    let members: BTreeSet<String> = users
        .into_iter()
        .filter(|user_id| !user_id.is_empty() && *user_id != admin_id)
        .collect();
    if members.len() < 2 {
        return Err(ApiError::BadRequest("cannot create a group with less than two users").into());
    }

    let members: Vec<String> = members.into_iter().collect();
    let chat = db::create_group_chat(&db_pool, &admin_id, group_name.trim(), &members).await?;
    tracing::info!(chat_id = %chat.id, admin = %admin_id, members = members.len(), "group chat created");
    Ok(Json(chat))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupBody {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    group_name: Option<String>,
    #[serde(default)]
    users: Option<Vec<String>>,
}

/// Loads a group chat `user_id` belongs to.
async fn member_group(db_pool: &SqlitePool, chat_id: Option<String>, user_id: &str) -> AppResult<Chat> {
    let Some(chat_id) = non_empty(chat_id) else {
        return Err(ApiError::BadRequest("chat not sent with request").into());
    };
    match db::chat(db_pool, &chat_id).await? {
        Some(chat) if chat.is_group_chat && chat.users.iter().any(|member| member == user_id) => Ok(chat),
        _ => Err(ApiError::NotFound("group chat").into()),
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn rename_group(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(GroupBody { chat_id, group_name, .. }): Json<GroupBody>,
) -> AppResult<Json<Chat>> {
    let group = member_group(&db_pool, chat_id, &user_id).await?;
    let Some(group_name) = non_empty(group_name) else {
        return Err(ApiError::BadRequest("group name cannot be left empty").into());
    };

    let chat = db::rename_group(&db_pool, &group.id, group_name.trim())
        .await?
        .ok_or(ApiError::NotFound("group chat"))?;
    Ok(Json(chat))
}

#[debug_handler(state = AppState)]
pub(crate) async fn add_to_group(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(GroupBody { chat_id, users, .. }): Json<GroupBody>,
) -> AppResult<Json<Value>> {
    let group = member_group(&db_pool, chat_id, &user_id).await?;
    if group.group_admin.as_deref() != Some(user_id.as_str()) {
        return Err(ApiError::Forbidden("only the group admin can add members").into());
    }
    let users: Vec<String> = users
        .unwrap_or_default()
        .into_iter()
        .filter(|member| !member.is_empty())
        .collect();
    if users.is_empty() {
        return Err(ApiError::BadRequest("no users to add").into());
    }

    let added = db::add_group_members(&db_pool, &group.id, &users).await?;
    let chat = db::chat(&db_pool, &group.id).await?;
    tracing::info!(chat_id = %group.id, admin = %user_id, added, "group members added");
    Ok(Json(json!({ "success": true, "added": added, "chat": chat })))
}

#[debug_handler(state = AppState)]
pub(crate) async fn leave_group(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(GroupBody { chat_id, .. }): Json<GroupBody>,
) -> AppResult<Json<Value>> {
    let group = member_group(&db_pool, chat_id, &user_id).await?;

    let updated = db::leave_group(&db_pool, &group.id, &user_id).await?;
    tracing::info!(chat_id = %group.id, user_id = %user_id, dissolved = updated.is_none(), "left group");
    Ok(Json(json!({ "success": true, "updatedChat": updated })))
}

/// Deletes a group with its history. Only the admin, or the last member left, may do this.
#[debug_handler(state = AppState)]
pub(crate) async fn delete_group(
    State(db_pool): State<SqlitePool>,
    AuthUser(user_id): AuthUser,
    Json(GroupBody { chat_id, .. }): Json<GroupBody>,
) -> AppResult<Json<Value>> {
    let group = member_group(&db_pool, chat_id, &user_id).await?;
    let is_admin = group.group_admin.as_deref() == Some(user_id.as_str());
    if !is_admin && group.users.len() > 1 {
        return Err(ApiError::Forbidden("only the group admin can delete the group").into());
    }

    db::delete_chat(&db_pool, &group.id).await?;
    tracing::info!(chat_id = %group.id, user_id = %user_id, "group deleted");
    Ok(Json(json!({ "success": true, "message": "group deleted" })))
}
