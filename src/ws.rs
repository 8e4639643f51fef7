use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    sync::mpsc,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{events::ServerEvent, router::EventRouter, AppState, IdleTimeout};

#[debug_handler(state = AppState)]
pub async fn socket(
    State(events): State<EventRouter>,
    State(IdleTimeout(idle)): State<IdleTimeout>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |stream| async move {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = events.connect(tx);
        let conn_id = session.id();
        let (sender, mut receiver) = stream.split();

        let mut writer = tokio::spawn(forward_events(sender, rx, heartbeat_period(idle)));

        loop {
            let frame = tokio::select! {
                frame = timeout(idle, receiver.next()) => frame,
                _ = &mut writer => {
                    debug!(%conn_id, "socket writer stopped");
                    break;
                }
            };

            match frame {
                Ok(Some(Ok(Message::Text(text)))) => events.handle_frame(&mut session, text.as_str()),
                Ok(Some(Ok(Message::Binary(data)))) => match std::str::from_utf8(&data) {
                    Ok(text) => events.handle_frame(&mut session, text),
                    Err(_) => debug!(%conn_id, len = data.len(), "dropped non-utf8 binary frame"),
                },
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!(%conn_id, reason = ?frame, "client closed");
                    break;
                }
                Ok(Some(Err(err))) => {
                    warn!(%conn_id, error = %err, "socket receive error");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    info!(%conn_id, idle_secs = idle.as_secs(), "dropping idle connection");
                    break;
                }
            }
        }

        events.disconnect(session);
        writer.abort();
    })
}

/// Server pings go out twice per idle window; the client's pongs count as inbound traffic.
fn heartbeat_period(idle: Duration) -> Duration {
    (idle / 2).max(Duration::from_millis(10))
}

/// Drains a connection's outbox onto the socket until either side goes away, pinging the
/// client every `heartbeat`.
async fn forward_events(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Arc<ServerEvent>>,
    heartbeat: Duration,
) {
    let mut ping = interval_at(Instant::now() + heartbeat, heartbeat);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&*event) {
                    Ok(frame) => Message::Text(frame.into()),
                    Err(err) => {
                        warn!(event = event.name(), error = %err, "unserializable event");
                        continue;
                    }
                }
            }
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };
        if sender.send(frame).await.is_err() {
            break;
        }
    }
    let _ = sender.close().await;
}
