//! WebSocket transport for the log relay.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

use crate::error::RelayError;
use crate::orchestrator::{LogRelay, RelayFrame, RelayOutcome, RelaySink, RelayTarget};

/// Write half of a socket, as a relay sink.
struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl RelaySink for WsSink {
    async fn send(&mut self, frame: RelayFrame) -> Result<(), RelayError> {
        let message = match frame {
            RelayFrame::Text(text) => Message::Text(text.into()),
            RelayFrame::Close => Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })),
        };
        SinkExt::send(&mut self.tx, message)
            .await
            .map_err(|e| RelayError::SendFailed(e.to_string()))
    }
}

/// Drive one upgraded connection until the relay ends or the client leaves.
pub(crate) async fn relay_session(socket: WebSocket, relay: Arc<LogRelay>, target: RelayTarget) {
    let (tx, mut rx) = socket.split();
    let mut sink = WsSink { tx };

    // Incoming frames are only watched for the peer going away.
    let mut reader = tokio::spawn(async move {
        while let Some(message) = rx.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let outcome = relay
        .run(target, &mut sink, async {
            let _ = (&mut reader).await;
        })
        .await;

    if outcome == RelayOutcome::Completed {
        let grace = relay.config().close_grace;
        if tokio::time::timeout(grace, &mut reader).await.is_err() {
            tracing::debug!("Subscriber did not acknowledge close, dropping connection");
        }
    }
    reader.abort();
}
