// WebSocket push sessions
//
// Each socket gets one writer task that owns the sink and drains the
// consumer's queue in order. The read half only answers keepalive pings and
// watches for the close frame.

use std::sync::Arc;

use adrelay_handlers::{IngestProcessor, Subscriber};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::AppState;

const CONTROL_QUEUE: usize = 16;

/// GET /ws - upgrade to a push session
pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state.processor))
}

async fn run_session(socket: WebSocket, processor: Arc<IngestProcessor>) {
    let Subscriber {
        mut subscription,
        replay,
    } = processor.subscribe();
    let consumer = subscription.id();
    info!(consumer = %consumer, clients = processor.client_count(), "Client connected");

    let (mut sink, mut stream) = socket.split();
    let (control_tx, mut control_rx) = mpsc::channel::<Message>(CONTROL_QUEUE);

    let writer = tokio::spawn(async move {
        if let Some(text) = replay {
            if sink.send(Message::Text(text.to_string())).await.is_err() {
                return;
            }
        }

        loop {
            let message = tokio::select! {
                frame = subscription.recv() => match frame {
                    Some(text) => Message::Text(text.to_string()),
                    // dropped by the fanout or unregistered
                    None => break,
                },
                control = control_rx.recv() => match control {
                    Some(message) => message,
                    None => break,
                },
            };

            if sink.send(message).await.is_err() {
                break;
            }
        }

        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) if text.trim() == "ping" => {
                if control_tx.send(Message::Text("pong".to_string())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(consumer = %consumer, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    drop(control_tx);
    processor.unsubscribe(consumer);
    let _ = writer.await;

    info!(consumer = %consumer, clients = processor.client_count(), "Client disconnected");
}
