//! Notifications delivered to the host application.

use palaver_shared::{Agent, ChatError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::context::ChatState;
use crate::stores::messages::ChatThread;
use crate::ws::connection::ConnectionState;

/// Everything the host may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChatStateChanged(ChatState),
    ConnectionStateChanged(ConnectionState),
    /// The socket is gone and will not come back on its own.
    Disconnected { unexpectedly: bool },
    /// The thread list changed as a whole (load, reset, adoption).
    ThreadsUpdated(Vec<ChatThread>),
    ThreadUpdated(ChatThread),
    AgentTyping {
        thread_id: Uuid,
        agent: Option<Agent>,
        typing: bool,
    },
    /// Failure not tied to any call the host made.
    Error(ChatError),
}

/// Cloneable sender side of the host event channel.
#[derive(Debug, Clone)]
pub struct ClientEvents {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ClientEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("host event receiver dropped");
        }
    }

    pub fn error(&self, error: ChatError) {
        tracing::warn!(%error, "reporting error to host");
        self.emit(ClientEvent::Error(error));
    }
}
