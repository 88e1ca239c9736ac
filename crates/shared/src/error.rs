//! Error taxonomy shared by every layer of the client.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::EventType;

/// Result alias used throughout the client.
pub type ChatResult<T> = Result<T, ChatError>;

/// Server-side error codes carried by operation error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    RecoveringThreadFailed,
    RecoveringLivechatFailed,
    #[serde(alias = "CustomerReconnectionFailed")]
    ConsumerReconnectionFailed,
    TokenRefreshingFailed,
    #[serde(alias = "CustomerAuthorizationFailed")]
    ConsumerAuthorizationFailed,
    InconsistentData,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RecoveringThreadFailed => "RecoveringThreadFailed",
            ErrorCode::RecoveringLivechatFailed => "RecoveringLivechatFailed",
            ErrorCode::ConsumerReconnectionFailed => "ConsumerReconnectionFailed",
            ErrorCode::TokenRefreshingFailed => "TokenRefreshingFailed",
            ErrorCode::ConsumerAuthorizationFailed => "ConsumerAuthorizationFailed",
            ErrorCode::InconsistentData => "InconsistentData",
            ErrorCode::Unknown => "Unknown",
        }
    }

    /// Whether this code means a thread or live chat could not be recovered.
    pub fn is_recovery_failure(&self) -> bool {
        matches!(
            self,
            ErrorCode::RecoveringThreadFailed | ErrorCode::RecoveringLivechatFailed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment validation and upload failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    #[error("attachment is {size} bytes, the channel allows at most {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("attachments of type {0} are not allowed")]
    FileTypeNotAllowed(String),

    #[error("attachment file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("attachments are disabled for this channel")]
    Disabled,

    #[error("attachment upload failed: {0}")]
    UploadFailed(String),
}

/// Every failure a public client operation can report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    // --- Connectivity ---
    #[error("not connected")]
    NotConnected,

    #[error("websocket connection failure: {0}")]
    WebSocketConnectionFailure(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no {expected} event received within {after:?}")]
    EventTimeout { expected: EventType, after: Duration },

    // --- Protocol / server ---
    #[error("operation failed with {code}: {message}")]
    Operation {
        code: ErrorCode,
        transaction_id: Option<String>,
        message: String,
    },

    #[error("server error: HTTP {status}: {body}")]
    Server { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    // --- Domain / usage ---
    #[error("unknown thread {0}")]
    InvalidThread(String),

    #[error("operation not supported by the channel configuration")]
    UnsupportedChannelConfig,

    #[error("thread is in a state that does not allow this operation")]
    IllegalThreadState,

    #[error("missing required pre-chat custom fields: {}", .0.join(", "))]
    MissingPreChatCustomFields(Vec<String>),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("no more messages to load")]
    NoMoreMessages,

    #[error("thread has no message to anchor pagination")]
    InvalidOldestDate,

    #[error("missing access token")]
    MissingAccessToken,

    #[error("customer could not be associated with the channel")]
    CustomerAssociationFailure,

    #[error(transparent)]
    Attachment(#[from] AttachmentError),
}

impl ChatError {
    /// Build an operation error from a server error frame.
    pub fn operation(code: ErrorCode, transaction_id: Option<String>, message: impl Into<String>) -> Self {
        ChatError::Operation {
            code,
            transaction_id,
            message: message.into(),
        }
    }

    /// The server error code, if this is an operation error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ChatError::Operation { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Connectivity failures the connection manager may recover from on its own.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ChatError::NotConnected
                | ChatError::WebSocketConnectionFailure(_)
                | ChatError::ConnectionClosed
                | ChatError::EventTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::InvalidData(e.to_string())
    }
}
