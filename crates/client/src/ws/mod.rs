//! Socket layer: connection lifecycle and request/response correlation.
//!
//! ```text
//!   ThreadRegistry ──sink──▶ EventCorrelator ──send_event──▶ ConnectionManager ──▶ Connector
//!         ▲                        │  ▲                              │
//!         └──── broadcast ─────────┘  └──────── dispatch(frame) ─────┘
//! ```

pub mod connection;
pub mod correlator;

pub use connection::{
    ConnectionManager, ConnectionState, Connector, EventSender, ReconnectConfig, Socket,
    TungsteniteConnector,
};
pub use correlator::{EventCorrelator, Expectation};
