//! Palaver chat client core.
//!
//! Keeps one socket to the chat backend alive, turns the multiplexed event stream
//! into awaitable request/response pairs, and maintains a local model of threads
//! and messages that stays consistent with out-of-order server pushes.

pub mod api_client;
pub mod client;
pub mod config;
pub mod context;
pub mod events;
pub mod logging;
pub mod stores;
pub mod token;
pub mod ws;

pub use api_client::{ApiClient, AttachmentUpload, ChannelApi};
pub use client::ChatClient;
pub use config::ClientConfig;
pub use context::{ChatState, ConnectionContext};
pub use events::{ClientEvent, ClientEvents};
pub use stores::{ChatThread, Message, MessageContent, MessageStatus, OutboundMessage, ThreadRegistry, ThreadState};
pub use token::AccessToken;
pub use ws::{ConnectionManager, ConnectionState, Connector, ReconnectConfig, Socket};

pub use palaver_shared as shared;
