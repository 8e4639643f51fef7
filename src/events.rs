//! Wire format of the real-time channel.
//!
//! Every frame is a JSON text message of the form `{"event": "<name>", "data": <payload>}`.
//! Events without a payload omit `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    AnnounceIdentity(Announcement),
    JoinChat(String),
    Typing(String),
    StopTyping(String),
    /// Relayed verbatim; only the routing fields are interpreted.
    SendMessage(Value),
}

impl ClientEvent {
    pub fn from_frame(frame: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(frame)?)
    }

    pub fn name(&self) -> &'static str {
        use ClientEvent::*;
        match self {
            AnnounceIdentity(_) => "announce-identity",
            JoinChat(_) => "join-chat",
            Typing(_) => "typing",
            StopTyping(_) => "stop-typing",
            SendMessage(_) => "send-message",
        }
    }
}

/// Payload of `announce-identity`.
///
/// Clients present the bearer token they use against the REST api. A bare user id is
/// only honoured when the server is configured to trust announced identities.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Announcement {
    Bare(String),
    Signed {
        #[serde(default, alias = "userId", alias = "_id")]
        id: Option<String>,
        token: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected,
    UserJoined,
    TypingOn(String),
    TypingDone,
    ReceiveMessage(Value),
    ReceiveNotification(Value),
    Error(Failure),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        use ServerEvent::*;
        match self {
            Connected => "connected",
            UserJoined => "user-joined",
            TypingOn(_) => "typing-on",
            TypingDone => "typing-done",
            ReceiveMessage(_) => "receive-message",
            ReceiveNotification(_) => "receive-notification",
            Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed {event}: {reason}")]
    Malformed {
        event: &'static str,
        reason: &'static str,
    },
    #[error(transparent)]
    Unauthenticated(#[from] AuthError),
}

impl EventError {
    pub(crate) fn malformed(event: &'static str, reason: &'static str) -> Self {
        EventError::Malformed { event, reason }
    }
}
