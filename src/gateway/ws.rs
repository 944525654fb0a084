//! WebSocket fan-out
//!
//! `/stream` and `/ws/stream` accept the Binance `streams` query for
//! compatibility but broadcast every bar-close and markPrice event to every
//! connected client. Each client forwards its own broadcast receiver; a
//! failed send drops that client, and a lagging client skips missed events
//! instead of stalling the bus.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::gateway::state::SharedState;

pub(crate) async fn ws_stream(
    State(st): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    // Accepted but unused: all events go to every client.
    let streams = params.get("streams").cloned().unwrap_or_default();
    debug!(streams = %streams, "ws client connecting");
    ws.on_upgrade(move |socket| client_loop(st, socket))
}

async fn client_loop(st: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(st.bus.subscribe());

    let mut send_task = tokio::spawn(async move {
        while let Some(evt) = events.next().await {
            match evt {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break; // client gone
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    debug!(missed, "ws client lagged, skipping");
                }
            }
        }
    });

    // Consume inbound frames to keep the connection alive; clients are not
    // expected to send anything meaningful.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("ws client disconnected");
}
