//! WebSocket Client Sessions
//!
//! Handles a single connected client from upgrade through disconnect:
//!
//! 1. Registers with the hub, which queues the status snapshot first
//! 2. Forwards queued frames to the socket as text messages
//! 3. Ignores inbound frames until the client closes
//! 4. Deregisters on close, send failure, or relay shutdown

use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::broadcast::{ClientSession, SharedBroadcastHub};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The client sent Close or the stream ended.
    ClientClosed,
    /// Writing to the socket failed.
    SendFailed,
    /// The hub dropped this session's queue.
    Evicted,
    /// The relay is shutting down.
    Shutdown,
}

impl SessionEnd {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::SendFailed => "send_failed",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run a WebSocket session for a connected client.
pub async fn run_session(socket: WebSocket, hub: SharedBroadcastHub, shutdown: CancellationToken) {
    let ClientSession { id, mut frames } = hub.register();
    let (mut sink, mut stream) = socket.split();
    let started = Instant::now();

    let end = tokio::select! {
        () = shutdown.cancelled() => SessionEnd::Shutdown,
        end = forward_frames(&mut frames, &mut sink) => end,
        end = drain_inbound(&mut stream) => end,
    };

    if end == SessionEnd::Shutdown {
        let _ = sink.send(Message::Close(None)).await;
    }

    hub.disconnect(id);
    tracing::debug!(
        session_id = %id,
        reason = end.as_str(),
        duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "WebSocket session ended"
    );
}

async fn forward_frames(
    frames: &mut tokio::sync::mpsc::Receiver<std::sync::Arc<str>>,
    sink: &mut SplitSink<WebSocket, Message>,
) -> SessionEnd {
    while let Some(frame) = frames.recv().await {
        if sink.send(Message::Text(frame.as_ref().into())).await.is_err() {
            return SessionEnd::SendFailed;
        }
    }
    SessionEnd::Evicted
}

async fn drain_inbound(stream: &mut SplitStream<WebSocket>) -> SessionEnd {
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Close(_) => break,
            Message::Text(text) => {
                tracing::trace!(bytes = text.len(), "Ignoring client text frame");
            }
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    SessionEnd::ClientClosed
}
