//! REST gateway over the chat store.

mod chats;
mod messages;
mod unread;

use axum::{debug_handler, routing::{delete, get, post, put}, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(connected))
        .route("/chat/single/access", post(chats::access_single_chat))
        .route("/chat/findall", get(chats::fetch_all_chats))
        .route("/chat/group/create", post(chats::create_group_chat))
        .route("/chat/group/rename", put(chats::rename_group))
        .route("/chat/group/add", put(chats::add_to_group))
        .route("/chat/group/remove", put(chats::leave_group))
        .route("/chat/group/delete", delete(chats::delete_group))
        .route("/chat/message/send", post(messages::send_message))
        .route("/chat/message/deletemessage", delete(messages::delete_message))
        .route("/chat/message/{chat_id}", get(messages::fetch_all_messages))
        .route("/chat/unread", get(unread::list_unread))
        .route("/chat/unread/add", put(unread::add_unread))
        .route("/chat/unread/remove", put(unread::remove_unread))
}

#[debug_handler]
async fn connected() -> Json<Value> {
    Json(json!({ "message": "Connected!" }))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
