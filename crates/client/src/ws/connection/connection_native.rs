//! Socket transport on top of tokio-tungstenite.

use async_trait::async_trait;
use futures_channel::mpsc::unbounded;
use futures_util::{SinkExt, StreamExt};
use palaver_shared::{ChatError, ChatResult};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{Connector, Socket};

/// Opens real sockets; one read and one write task per socket.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn open(&self, url: &Url) -> ChatResult<Socket> {
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChatError::WebSocketConnectionFailure(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = unbounded::<String>();
        let (incoming_tx, incoming) = unbounded::<ChatResult<String>>();

        // Read task
        tokio::spawn(async move {
            let end = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(frame = %text, "socket received");
                        if incoming_tx.unbounded_send(Ok(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "socket received close frame");
                        break ChatError::ConnectionClosed;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is handled automatically by tungstenite
                    }
                    Some(Ok(_)) => {
                        // Ignore binary and protocol pongs
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "socket read error");
                        break ChatError::WebSocketConnectionFailure(e.to_string());
                    }
                    None => break ChatError::ConnectionClosed,
                }
            };
            let _ = incoming_tx.unbounded_send(Err(end));
        });

        // Write task
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.next().await {
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    tracing::error!(error = %e, "socket send failed");
                    break;
                }
            }
            tracing::debug!("sender dropped, closing socket");
            let _ = write.close().await;
        });

        Ok(Socket { outgoing, incoming })
    }
}
