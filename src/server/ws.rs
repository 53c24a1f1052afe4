//! Control-socket endpoint used by the browser agent. The socket is split
//! into a writer task fed by the link's outbound queue, a heartbeat ticker,
//! and an inline read loop that feeds inbound frames to the link.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::state::AppState;

pub(crate) async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (writer, mut outbound) = mpsc::channel::<Message>(state.config.max_in_flight);
    state.link.attach(writer.clone());

    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let heartbeat = tokio::spawn({
        let writer = writer.clone();
        let interval = state.config.heartbeat_interval;
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let ping = Message::Text(json!({"type": "ping"}).to_string());
                if writer.send(ping).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(err) = state.link.handle_frame(&text) {
                    warn!(error = %err, "dropping control socket");
                    break;
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = writer.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "control socket closed by agent");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "control socket transport error");
                break;
            }
        }
    }

    heartbeat.abort();
    write_task.abort();
    state.link.detach();
}
