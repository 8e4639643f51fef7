//! End-to-end tests: a real server on an ephemeral port, driven over WebSocket and HTTP.

use std::{net::SocketAddr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use murmur::{
    auth::{Claims, IdentityResolver},
    rooms::RoomRegistry,
    router::EventRouter,
    AppState, IdleTimeout,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    identity: IdentityResolver,
    events: EventRouter,
}

async fn start_server(idle_timeout: Duration) -> TestServer {
    let db_pool = murmur::db::connect("sqlite::memory:").await.unwrap();
    let identity = IdentityResolver::new(b"integration-secret", Duration::from_secs(600));
    let events = EventRouter::new(RoomRegistry::new(), identity.clone());
    let state = AppState {
        db_pool,
        identity: identity.clone(),
        events: events.clone(),
        idle_timeout: IdleTimeout(idle_timeout),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, murmur::app(state)).await.unwrap();
    });

    TestServer { addr, identity, events }
}

impl TestServer {
    async fn open(&self) -> Socket {
        let (socket, _) = connect_async(format!("ws://{}/ws", self.addr)).await.unwrap();
        socket
    }

    /// Opens a socket and announces `user_id`, waiting for the confirmation.
    async fn open_as(&self, user_id: &str) -> Socket {
        let mut socket = self.open().await;
        let token = self.identity.issue(user_id).unwrap();
        emit(&mut socket, json!({"event": "announce-identity", "data": {"id": user_id, "token": token}})).await;
        assert_eq!(next_event(&mut socket).await, Some(json!({"event": "connected"})));
        socket
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn emit(socket: &mut Socket, frame: Value) {
    socket.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next event frame, or `None` when nothing arrives shortly.
async fn next_event(socket: &mut Socket) -> Option<Value> {
    loop {
        match tokio::time::timeout(Duration::from_millis(300), socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

async fn join_chat(socket: &mut Socket, chat_id: &str) {
    emit(socket, json!({"event": "join-chat", "data": chat_id})).await;
    assert_eq!(next_event(socket).await, Some(json!({"event": "user-joined"})));
}

#[tokio::test]
async fn announce_identity_confirms_to_the_caller_only() {
    let server = start_server(Duration::from_secs(70)).await;
    let mut bystander = server.open_as("u9").await;

    let _a = server.open_as("u1").await;

    assert_eq!(server.events.rooms().members("u1").len(), 1);
    assert_eq!(next_event(&mut bystander).await, None);
}

#[tokio::test]
async fn typing_reaches_the_room_but_not_the_typist() {
    let server = start_server(Duration::from_secs(70)).await;
    let mut a = server.open_as("u1").await;
    let mut b = server.open_as("u2").await;

    join_chat(&mut a, "c1").await;
    join_chat(&mut b, "c1").await;
    assert_eq!(next_event(&mut a).await, Some(json!({"event": "user-joined"})));

    emit(&mut a, json!({"event": "typing", "data": "c1"})).await;
    assert_eq!(next_event(&mut b).await, Some(json!({"event": "typing-on", "data": "c1"})));

    emit(&mut a, json!({"event": "stop-typing", "data": "c1"})).await;
    assert_eq!(next_event(&mut b).await, Some(json!({"event": "typing-done"})));
    assert_eq!(next_event(&mut a).await, None);
}

#[tokio::test]
async fn messages_reach_only_the_other_participants() {
    let server = start_server(Duration::from_secs(70)).await;
    let mut a = server.open_as("u1").await;
    let mut b = server.open_as("u2").await;
    let mut b_phone = server.open_as("u2").await;
    let mut outsider = server.open_as("u3").await;

    let message = json!({
        "chat": {"id": "c1", "users": [{"id": "u1"}, {"id": "u2"}]},
        "sender": {"id": "u1"},
        "content": "hello"
    });
    emit(&mut a, json!({"event": "send-message", "data": message})).await;

    for device in [&mut b, &mut b_phone] {
        assert_eq!(
            next_event(device).await,
            Some(json!({"event": "receive-message", "data": message}))
        );
        assert_eq!(
            next_event(device).await,
            Some(json!({"event": "receive-notification", "data": message}))
        );
    }
    assert_eq!(next_event(&mut a).await, None);
    assert_eq!(next_event(&mut outsider).await, None);
}

#[tokio::test]
async fn malformed_messages_are_dropped_quietly() {
    let server = start_server(Duration::from_secs(70)).await;
    let mut a = server.open_as("u1").await;
    let mut b = server.open_as("u2").await;

    emit(&mut a, json!({"event": "send-message", "data": {"sender": {"id": "u1"}, "content": "?"}})).await;
    socket_send_raw(&mut a, "definitely not json").await;

    assert_eq!(next_event(&mut a).await, None);
    assert_eq!(next_event(&mut b).await, None);

    // the connection is still usable afterwards
    join_chat(&mut a, "c1").await;
}

async fn socket_send_raw(socket: &mut Socket, text: &str) {
    socket.send(Message::Text(text.to_owned().into())).await.unwrap();
}

#[tokio::test]
async fn disconnect_removes_the_connection_from_every_room() {
    let server = start_server(Duration::from_secs(70)).await;
    let mut a = server.open_as("u1").await;
    let mut b = server.open_as("u2").await;
    join_chat(&mut a, "c1").await;
    join_chat(&mut b, "c1").await;

    a.close(None).await.unwrap();

    let rooms = server.events.rooms();
    for _ in 0..50 {
        if rooms.members("u1").is_empty() && rooms.members("c1").len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(rooms.members("u1").is_empty());
    assert_eq!(rooms.members("c1").len(), 1);
    assert_eq!(rooms.connection_count(), 1);
}

#[tokio::test]
async fn expired_credentials_are_refused_on_announce() {
    let server = start_server(Duration::from_secs(70)).await;
    let mut a = server.open().await;

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let expired = server
        .identity
        .sign(&Claims { sub: "u1".into(), iat: now - 7200, exp: now - 3600 })
        .unwrap();
    emit(&mut a, json!({"event": "announce-identity", "data": {"token": expired}})).await;

    let reply = next_event(&mut a).await.unwrap();
    assert_eq!(reply["event"], "error");
    assert_eq!(reply["data"]["code"], "unauthenticated");
    assert!(server.events.rooms().members("u1").is_empty());

    emit(&mut a, json!({"event": "announce-identity", "data": "u1"})).await;
    assert_eq!(next_event(&mut a).await.unwrap()["event"], "error");
}

#[tokio::test]
async fn silent_connections_are_dropped() {
    let server = start_server(Duration::from_millis(300)).await;
    let mut a = server.open_as("u1").await;

    // without polling the socket the client never answers the server's pings
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(server.events.rooms().members("u1").is_empty());

    let closed = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn receive_only_clients_outlive_the_idle_timeout() {
    let server = start_server(Duration::from_millis(400)).await;
    let mut a = server.open_as("u1").await;
    let mut b = server.open_as("u2").await;

    let message = json!({
        "chat": {"id": "c1", "users": [{"id": "u1"}, {"id": "u2"}]},
        "sender": {"id": "u1"},
        "content": "still there?"
    });
    let mut received = 0;
    for _ in 0..15 {
        emit(&mut a, json!({"event": "send-message", "data": message})).await;
        for _ in 0..2 {
            if next_event(&mut b).await.is_some() {
                received += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(received, 30);
    assert_eq!(server.events.rooms().members("u2").len(), 1);
}

#[tokio::test]
async fn rest_gateway_persists_messages_ready_for_relay() {
    let server = start_server(Duration::from_secs(70)).await;
    let http = reqwest::Client::new();
    let u1 = server.identity.issue("u1").unwrap();
    let u2 = server.identity.issue("u2").unwrap();

    let health: Value = http.get(server.url("/api")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health, json!({"message": "Connected!"}));

    let unauthorised = http.get(server.url("/api/chat/findall")).send().await.unwrap();
    assert_eq!(unauthorised.status().as_u16(), 401);

    let chat: Value = http
        .post(server.url("/api/chat/single/access"))
        .bearer_auth(&u1)
        .json(&json!({"userId": "u2"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["id"].as_str().unwrap().to_owned();
    assert_eq!(chat["users"], json!(["u1", "u2"]));

    let missing = http
        .post(server.url("/api/chat/message/send"))
        .bearer_auth(&u1)
        .json(&json!({"chatId": chat_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 400);

    let sent: Value = http
        .post(server.url("/api/chat/message/send"))
        .bearer_auth(&u1)
        .json(&json!({"chatId": chat_id, "content": "hi there"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let message = sent["message"].clone();
    assert_eq!(message["sender"]["id"], "u1");
    let message_id = message["id"].as_str().unwrap().to_owned();

    // relayed through the socket layer exactly as the REST layer shaped it
    let mut a = server.open_as("u1").await;
    let mut b = server.open_as("u2").await;
    emit(&mut a, json!({"event": "send-message", "data": message})).await;
    assert_eq!(
        next_event(&mut b).await,
        Some(json!({"event": "receive-message", "data": message}))
    );

    let history: Value = http
        .get(server.url(&format!("/api/chat/message/{chat_id}")))
        .bearer_auth(&u2)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["allMessages"][0]["content"], "hi there");

    let outsider = server.identity.issue("u3").unwrap();
    let hidden = http
        .get(server.url(&format!("/api/chat/message/{chat_id}")))
        .bearer_auth(&outsider)
        .send()
        .await
        .unwrap();
    assert_eq!(hidden.status().as_u16(), 404);

    let added: Value = http
        .put(server.url("/api/chat/unread/add"))
        .bearer_auth(&u2)
        .json(&json!({"chatId": chat_id, "messageId": message_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(added["added"], true);

    let unread: Value = http
        .get(server.url("/api/chat/unread"))
        .bearer_auth(&u2)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unread["unread"], json!([{"chatId": chat_id, "messageId": message_id}]));

    let removed: Value = http
        .put(server.url("/api/chat/unread/remove"))
        .bearer_auth(&u2)
        .json(&json!({"chatId": chat_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(removed["removed"], 1);

    let not_theirs = http
        .delete(server.url("/api/chat/message/deletemessage"))
        .bearer_auth(&u2)
        .json(&json!({"messageId": message_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(not_theirs.status().as_u16(), 404);

    let deleted: Value = http
        .delete(server.url("/api/chat/message/deletemessage"))
        .bearer_auth(&u1)
        .json(&json!({"messageId": message_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["message"]["id"], message_id.as_str());

    let history: Value = http
        .get(server.url(&format!("/api/chat/message/{chat_id}")))
        .bearer_auth(&u1)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["allMessages"], json!([]));
}

#[tokio::test]
async fn group_chats_need_two_other_members() {
    let server = start_server(Duration::from_secs(70)).await;
    let http = reqwest::Client::new();
    let admin = server.identity.issue("u1").unwrap();

    let too_small = http
        .post(server.url("/api/chat/group/create"))
        .bearer_auth(&admin)
        .json(&json!({"groupName": "pair", "users": ["u2", "u1"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(too_small.status().as_u16(), 400);

    let group: Value = http
        .post(server.url("/api/chat/group/create"))
        .bearer_auth(&admin)
        .json(&json!({"groupName": "crew", "users": ["u2", "u3"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(group["isGroupChat"], true);
    assert_eq!(group["groupAdmin"], "u1");
    assert_eq!(group["users"].as_array().unwrap().len(), 3);

    let chats: Value = http
        .get(server.url("/api/chat/findall"))
        .bearer_auth(&server.identity.issue("u3").unwrap())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chats[0]["groupName"], "crew");
}

#[tokio::test]
async fn group_membership_changes_reach_the_relay_payload() {
    let server = start_server(Duration::from_secs(70)).await;
    let http = reqwest::Client::new();
    let token = |user_id: &str| server.identity.issue(user_id).unwrap();

    let group: Value = http
        .post(server.url("/api/chat/group/create"))
        .bearer_auth(token("u1"))
        .json(&json!({"groupName": "crew", "users": ["u2", "u3"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = group["id"].as_str().unwrap().to_owned();

    let renamed: Value = http
        .put(server.url("/api/chat/group/rename"))
        .bearer_auth(token("u2"))
        .json(&json!({"chatId": chat_id, "groupName": "deck"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(renamed["groupName"], "deck");

    let not_admin = http
        .put(server.url("/api/chat/group/add"))
        .bearer_auth(token("u2"))
        .json(&json!({"chatId": chat_id, "users": ["u4"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(not_admin.status().as_u16(), 403);

    let added: Value = http
        .put(server.url("/api/chat/group/add"))
        .bearer_auth(token("u1"))
        .json(&json!({"chatId": chat_id, "users": ["u4"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(added["added"], 1);

    // the new member shows up in the payload clients relay, so they receive the fanout
    let sent: Value = http
        .post(server.url("/api/chat/message/send"))
        .bearer_auth(token("u1"))
        .json(&json!({"chatId": chat_id, "content": "welcome"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let mut sender = server.open_as("u1").await;
    let mut newcomer = server.open_as("u4").await;
    emit(&mut sender, json!({"event": "send-message", "data": sent["message"]})).await;
    assert_eq!(next_event(&mut newcomer).await.unwrap()["event"], "receive-message");

    let left: Value = http
        .put(server.url("/api/chat/group/remove"))
        .bearer_auth(token("u1"))
        .json(&json!({"chatId": chat_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(left["updatedChat"]["groupAdmin"], "u2");
    assert_eq!(left["updatedChat"]["users"], json!(["u2", "u3", "u4"]));

    let refused = http
        .delete(server.url("/api/chat/group/delete"))
        .bearer_auth(token("u3"))
        .json(&json!({"chatId": chat_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status().as_u16(), 403);

    let deleted = http
        .delete(server.url("/api/chat/group/delete"))
        .bearer_auth(token("u2"))
        .json(&json!({"chatId": chat_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status().as_u16(), 200);

    let chats: Value = http
        .get(server.url("/api/chat/findall"))
        .bearer_auth(token("u3"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chats, json!([]));
}
