//! Shared wire types for the palaver chat client.
//!
//! Everything that crosses the socket or the HTTP collaborators lives here:
//! event tags, the outbound action envelope, inbound frame decoding, payload
//! DTOs, channel configuration and the error taxonomy.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
