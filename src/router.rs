use std::{collections::BTreeSet, sync::Arc};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthError, IdentityResolver},
    events::{Announcement, ClientEvent, EventError, Failure, ServerEvent},
    presence::{ConnectionId, PresenceSession},
    rooms::{Outbox, RoomRegistry},
};

/// Dispatches inbound real-time events onto the room registry.
#[derive(Debug, Clone)]
pub struct EventRouter {
    rooms: RoomRegistry,
    identity: IdentityResolver,
    trust_announced_identity: bool,
}

impl EventRouter {
    pub fn new(rooms: RoomRegistry, identity: IdentityResolver) -> Self {
        Self {
            rooms,
            identity,
            trust_announced_identity: false,
        }
    }

    /// Accept bare, unsigned user ids in `announce-identity`.
    pub fn trust_announced_identity(mut self, trust: bool) -> Self {
        self.trust_announced_identity = trust;
        self
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn connect(&self, outbox: Outbox) -> PresenceSession {
        let session = PresenceSession::new(ConnectionId::new());
        self.rooms.register(session.id(), outbox);
        debug!(conn_id = %session.id(), "connection opened");
        session
    }

    pub fn disconnect(&self, session: PresenceSession) {
        let left = self.rooms.leave_all(session.id());
        debug!(
            conn_id = %session.id(),
            user_id = session.user().unwrap_or("-"),
            rooms = left.len(),
            "connection closed"
        );
    }

    /// Decodes and dispatches one text frame. Failures stay local to the connection.
    pub fn handle_frame(&self, session: &mut PresenceSession, frame: &str) {
        let result = ClientEvent::from_frame(frame).and_then(|event| self.dispatch(session, event));
        match result {
            Ok(()) => {}
            Err(EventError::Unauthenticated(err)) => {
                warn!(conn_id = %session.id(), error = %err, "identity announcement refused");
                self.rooms.emit(
                    session.id(),
                    ServerEvent::Error(Failure {
                        code: "unauthenticated",
                        message: err.to_string(),
                    }),
                );
            }
            Err(err) => {
                debug!(conn_id = %session.id(), error = %err, "dropped event");
            }
        }
    }

    pub fn dispatch(&self, session: &mut PresenceSession, event: ClientEvent) -> Result<(), EventError> {
        match event {
            ClientEvent::AnnounceIdentity(announcement) => self.announce(session, announcement),
            ClientEvent::JoinChat(chat_id) => {
                let chat_id = room_key("join-chat", &chat_id)?;
                self.rooms.join(session.id(), chat_id);
                session.enter_chat(chat_id);
                let reached = self.rooms.broadcast(chat_id, ServerEvent::UserJoined, None);
                debug!(conn_id = %session.id(), room = chat_id, reached, "joined chat");
                Ok(())
            }
            ClientEvent::Typing(chat_id) => {
                let chat_id = room_key("typing", &chat_id)?;
                self.rooms.broadcast(
                    chat_id,
                    ServerEvent::TypingOn(chat_id.to_owned()),
                    Some(session.id()),
                );
                Ok(())
            }
            ClientEvent::StopTyping(chat_id) => {
                let chat_id = room_key("stop-typing", &chat_id)?;
                self.rooms.broadcast(chat_id, ServerEvent::TypingDone, Some(session.id()));
                Ok(())
            }
            ClientEvent::SendMessage(message) => self.relay_message(session, message),
        }
    }

    fn announce(&self, session: &mut PresenceSession, announcement: Announcement) -> Result<(), EventError> {
        let user_id = match announcement {
            Announcement::Bare(user_id) if self.trust_announced_identity => user_id,
            Announcement::Bare(_) => return Err(AuthError::Missing.into()),
            Announcement::Signed { id, token } => {
                let subject = self.identity.resolve(&token)?;
                if id.is_some_and(|id| id != subject) {
                    return Err(AuthError::SubjectMismatch.into());
                }
                subject
            }
        };
        room_key("announce-identity", &user_id)?;

        if let Some(previous) = session.identify(user_id.clone()) {
            if previous != user_id {
                self.rooms.leave(session.id(), &previous);
            }
        }
        self.rooms.join(session.id(), &user_id);
        self.rooms.emit(session.id(), ServerEvent::Connected);
        info!(conn_id = %session.id(), user_id = %user_id, "connection identified");
        Ok(())
    }

    /// Fans a message out to the personal room of every participant except the sender.
    fn relay_message(&self, session: &PresenceSession, message: Value) -> Result<(), EventError> {
        const EVENT: &str = "send-message";

        let routing = MessageRouting::deserialize(&message)
            .map_err(|_| EventError::malformed(EVENT, "unreadable chat or sender"))?;
        let participants = routing
            .chat
            .and_then(|chat| chat.users)
            .filter(|users| !users.is_empty())
            .ok_or_else(|| EventError::malformed(EVENT, "chat.users is not populated"))?;
        let sender = routing
            .sender
            .as_ref()
            .and_then(participant_id)
            .or(session.user())
            .map(str::to_owned)
            .ok_or_else(|| EventError::malformed(EVENT, "no sender"))?;

        // unreadable entries are skipped, the rest still get the message
        let recipients: BTreeSet<&str> = participants
            .iter()
            .filter_map(participant_id)
            .filter(|user_id| *user_id != sender)
            .collect();

        let delivery = Arc::new(ServerEvent::ReceiveMessage(message.clone()));
        let notification = Arc::new(ServerEvent::ReceiveNotification(message));
        for user_id in &recipients {
            self.rooms.broadcast(user_id, delivery.clone(), Some(session.id()));
            self.rooms.broadcast(user_id, notification.clone(), Some(session.id()));
        }
        debug!(
            conn_id = %session.id(),
            sender = %sender,
            recipients = recipients.len(),
            "relayed message"
        );
        Ok(())
    }
}

fn room_key<'a>(event: &'static str, key: &'a str) -> Result<&'a str, EventError> {
    match key.trim() {
        "" => Err(EventError::malformed(event, "empty room key")),
        _ => Ok(key),
    }
}

#[derive(Deserialize)]
struct MessageRouting {
    #[serde(default)]
    chat: Option<ChatRouting>,
    #[serde(default)]
    sender: Option<Value>,
}

#[derive(Deserialize)]
struct ChatRouting {
    #[serde(default)]
    users: Option<Vec<Value>>,
}

/// A participant is a bare user id or an object carrying `id` (or the legacy `_id`).
fn participant_id(participant: &Value) -> Option<&str> {
    match participant {
        Value::String(id) => Some(id.as_str()),
        Value::Object(fields) => ["id", "_id"]
            .into_iter()
            .find_map(|key| fields.get(key)?.as_str()),
        _ => None,
    }
    .filter(|id| !id.is_empty())
}
