//! Room subscription socket: a client joins the room for a delivery id and
//! receives every subsequent location update for that delivery. Best-effort
//! push only — lagged subscribers skip frames, late joiners get no replay.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::relay::LocationUpdate;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { delivery_id: Uuid },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    LocationUpdate {
        delivery_id: Uuid,
        location: LocationUpdate,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    info!("tracking client connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        let mut joined: HashSet<Uuid> = HashSet::new();

        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else {
                continue;
            };

            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::JoinRoom { delivery_id }) => {
                    if !joined.insert(delivery_id) {
                        continue;
                    }
                    info!(%delivery_id, "client joined delivery room");
                    spawn_room_forwarder(&state, delivery_id, out_tx.clone());
                }
                Err(err) => {
                    warn!(error = %err, "ignoring unrecognized ws message");
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("tracking client disconnected");
}

fn spawn_room_forwarder(state: &Arc<AppState>, delivery_id: Uuid, out: mpsc::Sender<String>) {
    let mut room_rx = state.rooms.subscribe(delivery_id);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = room_rx.recv() => match received {
                    Ok(location) => {
                        let message = ServerMessage::LocationUpdate {
                            delivery_id,
                            location,
                        };
                        let frame = match serde_json::to_string(&message) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(error = %err, "failed to serialize location frame");
                                continue;
                            }
                        };
                        if out.send(frame).await.is_err() {
                            break;
                        }
                    }
                    // dropped frames are fine, the next update supersedes
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = out.closed() => break,
            }
        }
    });
}
