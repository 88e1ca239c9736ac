//! Local model of threads and messages.

pub mod messages;
pub mod threads;

pub use messages::{
    ChatThread, Message, MessageAuthor, MessageContent, MessageStatus, ThreadState,
    BEGIN_CONVERSATION_TEXT,
};
pub use threads::{OutboundMessage, ThreadRegistry};
