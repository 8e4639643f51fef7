//! Chat and message persistence.

use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS chats (
        id TEXT PRIMARY KEY,
        is_group BOOLEAN NOT NULL DEFAULT 0,
        group_name TEXT,
        group_admin TEXT,
        direct_key TEXT UNIQUE,
        latest_message_id TEXT,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_users (
        chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        PRIMARY KEY (chat_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        sender_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS unread (
        user_id TEXT NOT NULL,
        chat_id TEXT NOT NULL,
        message_id TEXT NOT NULL,
        PRIMARY KEY (user_id, message_id)
    )",
    "CREATE INDEX IF NOT EXISTS chat_users_by_user ON chat_users (user_id)",
    "CREATE INDEX IF NOT EXISTS messages_by_chat ON messages (chat_id, created_at)",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub is_group_chat: bool,
    pub group_name: Option<String>,
    pub group_admin: Option<String>,
    pub users: Vec<String>,
    pub latest_message: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unread {
    pub chat_id: String,
    pub message_id: String,
}

pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    // each in-memory connection is its own database
    let max_connections = if database_url.contains(":memory:") { 1 } else { 16 };
    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    migrate(&db_pool).await?;
    Ok(db_pool)
}

pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(db_pool).await?;
    }
    Ok(())
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub async fn chat(db_pool: &SqlitePool, chat_id: &str) -> Result<Option<Chat>, sqlx::Error> {
    let row: Option<(String, bool, Option<String>, Option<String>, Option<String>, i64)> =
        sqlx::query_as(
            "SELECT id,is_group,group_name,group_admin,latest_message_id,updated_at FROM chats WHERE id=?",
        )
        .bind(chat_id)
        .fetch_optional(db_pool)
        .await?;

    let Some((id, is_group_chat, group_name, group_admin, latest_message, updated_at)) = row else {
        return Ok(None);
    };

    Ok(Some(Chat {
        users: chat_participants(db_pool, &id).await?,
        id,
        is_group_chat,
        group_name,
        group_admin,
        latest_message,
        updated_at,
    }))
}

pub async fn chat_participants(db_pool: &SqlitePool, chat_id: &str) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT user_id FROM chat_users WHERE chat_id=? ORDER BY rowid")
            .bind(chat_id)
            .fetch_all(db_pool)
            .await?;
    Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
}

pub async fn is_participant(db_pool: &SqlitePool, chat_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
    Ok(sqlx::query("SELECT 1 FROM chat_users WHERE chat_id=? AND user_id=?")
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(db_pool)
        .await?
        .is_some())
}

/// Order-independent key of the direct chat between two users.
fn direct_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}\u{1f}{hi}")
}

/// Finds the direct chat between `user_id` and `other_id`, creating it on first access.
///
/// `direct_key` is unique, so two users opening the chat at once still end up in the same one.
pub async fn access_direct_chat(db_pool: &SqlitePool, user_id: &str, other_id: &str) -> Result<Chat, sqlx::Error> {
    let key = direct_key(user_id, other_id);
    let id = Uuid::now_v7().to_string();

    let mut tx = db_pool.begin().await?;
    let created = sqlx::query(
        "INSERT OR IGNORE INTO chats (id,is_group,direct_key,updated_at) VALUES (?,0,?,?)",
    )
    .bind(&id)
    .bind(&key)
    .bind(now_millis())
    .execute(&mut *tx)
    .await?
    .rows_affected()
        > 0;
    if created {
        for participant in [user_id, other_id] {
            sqlx::query("INSERT INTO chat_users (chat_id,user_id) VALUES (?,?)")
                .bind(&id)
                .bind(participant)
                .execute(&mut *tx)
                .await?;
        }
    }
    let (id,): (String,) = sqlx::query_as("SELECT id FROM chats WHERE direct_key=?")
        .bind(&key)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    chat(db_pool, &id).await?.ok_or(sqlx::Error::RowNotFound)
}

/// Creates a group chat administered by `admin_id`, who is added as a participant.
pub async fn create_group_chat(
    db_pool: &SqlitePool,
    admin_id: &str,
    group_name: &str,
    users: &[String],
) -> Result<Chat, sqlx::Error> {
    let id = Uuid::now_v7().to_string();
    let mut tx = db_pool.begin().await?;
    sqlx::query("INSERT INTO chats (id,is_group,group_name,group_admin,updated_at) VALUES (?,1,?,?,?)")
        .bind(&id)
        .bind(group_name)
        .bind(admin_id)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;
    for user_id in users.iter().map(String::as_str).chain([admin_id]) {
        sqlx::query("INSERT OR IGNORE INTO chat_users (chat_id,user_id) VALUES (?,?)")
            .bind(&id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    chat(db_pool, &id).await?.ok_or(sqlx::Error::RowNotFound)
}

/// Renames a group chat. Returns `None` when `chat_id` is not a group.
pub async fn rename_group(db_pool: &SqlitePool, chat_id: &str, group_name: &str) -> Result<Option<Chat>, sqlx::Error> {
    let updated = sqlx::query("UPDATE chats SET group_name=?, updated_at=? WHERE id=? AND is_group=1")
        .bind(group_name)
        .bind(now_millis())
        .bind(chat_id)
        .execute(db_pool)
        .await?;
    if updated.rows_affected() == 0 {
        return Ok(None);
    }
    chat(db_pool, chat_id).await
}

/// Adds `users` to a group. Existing members are skipped; returns how many were added.
pub async fn add_group_members(db_pool: &SqlitePool, chat_id: &str, users: &[String]) -> Result<u64, sqlx::Error> {
    let mut tx = db_pool.begin().await?;
    let mut added = 0;
    for user_id in users {
        added += sqlx::query("INSERT OR IGNORE INTO chat_users (chat_id,user_id) VALUES (?,?)")
            .bind(chat_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    sqlx::query("UPDATE chats SET updated_at=? WHERE id=?")
        .bind(now_millis())
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(added)
}

/// Removes `user_id` from a group and drops their unread entries for it.
///
/// When the admin leaves, the longest-standing remaining member takes over. A group left
/// without members is deleted, in which case `None` is returned.
pub async fn leave_group(db_pool: &SqlitePool, chat_id: &str, user_id: &str) -> Result<Option<Chat>, sqlx::Error> {
    let mut tx = db_pool.begin().await?;
    sqlx::query("DELETE FROM chat_users WHERE chat_id=? AND user_id=?")
        .bind(chat_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM unread WHERE chat_id=? AND user_id=?")
        .bind(chat_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    let successor: Option<(String,)> =
        sqlx::query_as("SELECT user_id FROM chat_users WHERE chat_id=? ORDER BY rowid LIMIT 1")
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await?;
    match successor {
        Some((successor,)) => {
            sqlx::query("UPDATE chats SET group_admin=?, updated_at=? WHERE id=? AND group_admin=?")
                .bind(&successor)
                .bind(now_millis())
                .bind(chat_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            chat(db_pool, chat_id).await
        }
        None => {
            delete_chat_in(&mut tx, chat_id).await?;
            tx.commit().await?;
            Ok(None)
        }
    }
}

/// Deletes a chat with its messages and unread entries. Returns `false` for an unknown chat.
pub async fn delete_chat(db_pool: &SqlitePool, chat_id: &str) -> Result<bool, sqlx::Error> {
    let mut tx = db_pool.begin().await?;
    let deleted = delete_chat_in(&mut tx, chat_id).await?;
    tx.commit().await?;
    Ok(deleted)
}

async fn delete_chat_in(tx: &mut Transaction<'_, Sqlite>, chat_id: &str) -> Result<bool, sqlx::Error> {
    for statement in [
        "DELETE FROM unread WHERE chat_id=?",
        "DELETE FROM messages WHERE chat_id=?",
        "DELETE FROM chat_users WHERE chat_id=?",
    ] {
        sqlx::query(statement).bind(chat_id).execute(&mut **tx).await?;
    }
    let deleted = sqlx::query("DELETE FROM chats WHERE id=?")
        .bind(chat_id)
        .execute(&mut **tx)
        .await?;
    Ok(deleted.rows_affected() > 0)
}

/// All chats of `user_id`, most recently active first.
pub async fn chats_for_user(db_pool: &SqlitePool, user_id: &str) -> Result<Vec<Chat>, sqlx::Error> {
    let ids: Vec<(String,)> = sqlx::query_as(
        "SELECT c.id FROM chats c JOIN chat_users u ON u.chat_id = c.id
          WHERE u.user_id = ?
          ORDER BY c.updated_at DESC, c.id DESC",
    )
    .bind(user_id)
    .fetch_all(db_pool)
    .await?;

    let mut chats = Vec::with_capacity(ids.len());
    for (id,) in ids {
        if let Some(chat) = chat(db_pool, &id).await? {
            chats.push(chat);
        }
    }
    Ok(chats)
}

/// Persists a message and makes it the chat's latest.
pub async fn insert_message(
    db_pool: &SqlitePool,
    chat_id: &str,
    sender_id: &str,
    content: &str,
) -> Result<Message, sqlx::Error> {
    let message = Message {
        id: Uuid::now_v7().to_string(),
        chat_id: chat_id.to_owned(),
        sender_id: sender_id.to_owned(),
        content: content.to_owned(),
        created_at: now_millis(),
    };

    let mut tx = db_pool.begin().await?;
    let exists = sqlx::query("SELECT 1 FROM chats WHERE id=?")
        .bind(chat_id)
        .fetch_optional(&mut *tx)
        .await?
        .is_some();
    if !exists {
        return Err(sqlx::Error::RowNotFound);
    }
    sqlx::query("INSERT INTO messages (id,chat_id,sender_id,content,created_at) VALUES (?,?,?,?,?)")
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE chats SET latest_message_id=?, updated_at=? WHERE id=?")
        .bind(&message.id)
        .bind(message.created_at)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(message)
}

/// Messages of a chat, oldest first.
pub async fn messages_for_chat(db_pool: &SqlitePool, chat_id: &str) -> Result<Vec<Message>, sqlx::Error> {
    let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
        "SELECT id,chat_id,sender_id,content,created_at FROM messages WHERE chat_id=? ORDER BY created_at, id",
    )
    .bind(chat_id)
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, chat_id, sender_id, content, created_at)| Message {
            id,
            chat_id,
            sender_id,
            content,
            created_at,
        })
        .collect())
}

pub async fn message_in_chat(db_pool: &SqlitePool, chat_id: &str, message_id: &str) -> Result<bool, sqlx::Error> {
    Ok(sqlx::query("SELECT 1 FROM messages WHERE id=? AND chat_id=?")
        .bind(message_id)
        .bind(chat_id)
        .fetch_optional(db_pool)
        .await?
        .is_some())
}

/// Deletes a message sent by `sender_id`, returning it. Someone else's message, or an unknown
/// id, yields `None`. The chat's latest-message reference falls back to the previous message.
pub async fn delete_message(
    db_pool: &SqlitePool,
    message_id: &str,
    sender_id: &str,
) -> Result<Option<Message>, sqlx::Error> {
    let mut tx = db_pool.begin().await?;
    let row: Option<(String, String, String, String, i64)> = sqlx::query_as(
        "SELECT id,chat_id,sender_id,content,created_at FROM messages WHERE id=? AND sender_id=?",
    )
    .bind(message_id)
    .bind(sender_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some((id, chat_id, sender_id, content, created_at)) = row else {
        return Ok(None);
    };

    sqlx::query("DELETE FROM unread WHERE message_id=?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM messages WHERE id=?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE chats SET latest_message_id = (
            SELECT id FROM messages WHERE chat_id=? ORDER BY created_at DESC, id DESC LIMIT 1
         ) WHERE id=? AND latest_message_id=?",
    )
    .bind(&chat_id)
    .bind(&chat_id)
    .bind(&id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Some(Message {
        id,
        chat_id,
        sender_id,
        content,
        created_at,
    }))
}

/// Adds a message to the user's unread set. Returns `false` if it was already there.
pub async fn add_unread(
    db_pool: &SqlitePool,
    user_id: &str,
    chat_id: &str,
    message_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("INSERT OR IGNORE INTO unread (user_id,chat_id,message_id) VALUES (?,?,?)")
        .bind(user_id)
        .bind(chat_id)
        .bind(message_id)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Empties the user's unread set for one chat. Returns how many entries were removed.
pub async fn clear_unread(db_pool: &SqlitePool, user_id: &str, chat_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM unread WHERE user_id=? AND chat_id=?")
        .bind(user_id)
        .bind(chat_id)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn unread_for_user(db_pool: &SqlitePool, user_id: &str) -> Result<Vec<Unread>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT u.chat_id,u.message_id FROM unread u JOIN messages m ON m.id = u.message_id
          WHERE u.user_id=?
          ORDER BY m.created_at DESC, m.id DESC",
    )
    .bind(user_id)
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(chat_id, message_id)| Unread { chat_id, message_id })
        .collect())
}
