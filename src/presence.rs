use std::{collections::BTreeSet, fmt};

use serde::Serialize;
use uuid::Uuid;

/// Server-assigned handle of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState<'a> {
    Connected,
    Identified(&'a str),
}

/// In-memory state of one live connection.
///
/// Room membership itself lives in the [`RoomRegistry`](crate::rooms::RoomRegistry); the
/// session only remembers who the connection claims to be and which chats it entered.
/// Teardown goes through [`EventRouter::disconnect`](crate::router::EventRouter::disconnect),
/// which consumes the session.
#[derive(Debug)]
pub struct PresenceSession {
    id: ConnectionId,
    user: Option<String>,
    chats: BTreeSet<String>,
}

impl PresenceSession {
    pub(crate) fn new(id: ConnectionId) -> Self {
        Self {
            id,
            user: None,
            chats: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn state(&self) -> SessionState<'_> {
        match &self.user {
            Some(user) => SessionState::Identified(user),
            None => SessionState::Connected,
        }
    }

    pub fn chats(&self) -> impl Iterator<Item = &str> {
        self.chats.iter().map(String::as_str)
    }

    /// Binds the connection to `user`, returning the identity it replaced.
    pub(crate) fn identify(&mut self, user: String) -> Option<String> {
        self.user.replace(user)
    }

    pub(crate) fn enter_chat(&mut self, chat_id: &str) -> bool {
        self.chats.insert(chat_id.to_owned())
    }
}
