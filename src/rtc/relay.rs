//! WebSocket client for the signaling relay
//!
//! The relay forwards JSON [`RelayMessage`]s between participants of a room.
//! One writer task drains the outbound queue, one reader task parses inbound
//! text frames; both stop when the socket closes or the client is shut down.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::signaling::RelayMessage;
use super::SignalingTransport;
use crate::error::{AppError, Result};

const RELAY_CHANNEL_CAPACITY: usize = 64;

/// Connected relay client
pub struct WsRelayClient {
    url: String,
    outbound: mpsc::Sender<RelayMessage>,
    cancel: CancellationToken,
}

impl WsRelayClient {
    /// Connect to `url`; inbound messages arrive on the returned receiver
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<RelayMessage>)> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| AppError::SignalingError(format!("Connection to {} failed: {}", url, e)))?;
        info!("Connected to signaling relay {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<RelayMessage>(RELAY_CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel::<RelayMessage>(RELAY_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };

                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize relay message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    error!("Failed to send relay message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Relay writer stopped");
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = read.next() => frame,
                };

                match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(msg) => {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to parse relay message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Relay WebSocket error: {}", e);
                        break;
                    }
                }
            }
            reader_cancel.cancel();
        });

        Ok((
            Self {
                url: url.to_string(),
                outbound,
                cancel,
            },
            inbound,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// Stop both socket tasks
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl SignalingTransport for WsRelayClient {
    async fn send(&self, message: RelayMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::SignalingError("relay connection closed".to_string()));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| AppError::SignalingError("relay connection closed".to_string()))
    }
}

impl Drop for WsRelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::signaling::MuteState;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_relay_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let frame = ws.next().await.unwrap().unwrap();
            let join: RelayMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            assert!(matches!(join, RelayMessage::Join { .. }));

            let reply = RelayMessage::ParticipantJoined {
                participant_id: "bob".to_string(),
                display_name: "Bob".to_string(),
                initial_mute_state: MuteState::Muted,
            };
            ws.send(Message::Text(serde_json::to_string(&reply).unwrap()))
                .await
                .unwrap();
            ws.close(None).await.ok();
        });

        let (client, mut inbound) = WsRelayClient::connect(&format!("ws://{}", addr)).await.unwrap();
        client
            .send(RelayMessage::Join {
                display_name: "Alice".to_string(),
                initial_mute_state: MuteState::Unmuted,
            })
            .await
            .unwrap();

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.participant_id(), Some("bob"));
        server.await.unwrap();

        // reader stops once the server closes
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WsRelayClient::connect(&format!("ws://{}", addr)).await;
        assert!(matches!(result, Err(AppError::SignalingError(_))));
    }
}
