//! Client configuration from environment variables and builder setters.

use std::time::Duration;

use palaver_shared::{ChatError, ChatResult, PROTOCOL_VERSION};
use url::Url;

use crate::ws::connection::ReconnectConfig;

const DEFAULT_CHAT_URL: &str = "https://chat.palaver.dev/chat";
const DEFAULT_SOCKET_URL: &str = "wss://socket.palaver.dev";

/// Everything the client needs before `prepare`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the HTTP collaborator (channel configuration, uploads).
    pub chat_url: String,
    /// Base URL of the socket gateway.
    pub socket_url: String,
    /// Time between heartbeat frames.
    pub heartbeat_interval: Duration,
    /// How long a heartbeat may stay unanswered.
    pub pong_timeout: Duration,
    /// How long a request waits for its response event.
    pub event_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Capacity of the inbound event broadcast for passive subscribers.
    pub broadcast_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chat_url: DEFAULT_CHAT_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            event_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            broadcast_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Read the configuration from the environment.
    ///
    /// Environment variables:
    /// - `PALAVER_CHAT_URL`: HTTP base URL (default: "https://chat.palaver.dev/chat")
    /// - `PALAVER_SOCKET_URL`: socket gateway URL (default: "wss://socket.palaver.dev")
    /// - `PALAVER_HEARTBEAT_SECS`: heartbeat interval (default: 30)
    /// - `PALAVER_PONG_TIMEOUT_SECS`: heartbeat answer timeout (default: 10)
    /// - `PALAVER_EVENT_TIMEOUT_SECS`: request/response timeout (default: 10)
    /// - `PALAVER_RECONNECT_MAX_ATTEMPTS`: reconnect budget (default: 20)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut reconnect = defaults.reconnect.clone();
        reconnect.max_attempts = env_parse("PALAVER_RECONNECT_MAX_ATTEMPTS", reconnect.max_attempts);

        Self {
            chat_url: std::env::var("PALAVER_CHAT_URL").unwrap_or(defaults.chat_url),
            socket_url: std::env::var("PALAVER_SOCKET_URL").unwrap_or(defaults.socket_url),
            heartbeat_interval: env_secs("PALAVER_HEARTBEAT_SECS", defaults.heartbeat_interval),
            pong_timeout: env_secs("PALAVER_PONG_TIMEOUT_SECS", defaults.pong_timeout),
            event_timeout: env_secs("PALAVER_EVENT_TIMEOUT_SECS", defaults.event_timeout),
            reconnect,
            broadcast_capacity: defaults.broadcast_capacity,
        }
    }

    #[must_use]
    pub fn chat_url(mut self, url: impl Into<String>) -> Self {
        self.chat_url = url.into();
        self
    }

    #[must_use]
    pub fn socket_url(mut self, url: impl Into<String>) -> Self {
        self.socket_url = url.into();
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    #[must_use]
    pub fn event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.chat_url.is_empty() {
            return Err("chat URL cannot be empty".to_string());
        }
        let socket = Url::parse(&self.socket_url).map_err(|e| format!("invalid socket URL: {e}"))?;
        if !matches!(socket.scheme(), "ws" | "wss") {
            return Err(format!("socket URL scheme must be ws or wss, got {}", socket.scheme()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat interval must be > 0".to_string());
        }
        if self.pong_timeout >= self.heartbeat_interval {
            return Err("pong timeout must be shorter than the heartbeat interval".to_string());
        }
        if self.event_timeout.is_zero() {
            return Err("event timeout must be > 0".to_string());
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err("backoff multiplier must be >= 1.0".to_string());
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err("initial reconnect delay exceeds the maximum delay".to_string());
        }
        if self.broadcast_capacity == 0 {
            return Err("broadcast capacity must be > 0".to_string());
        }
        Ok(())
    }

    /// Build the gateway URL for a brand/channel and optional customer.
    pub fn socket_endpoint(
        &self,
        brand_id: i64,
        channel_id: &str,
        customer_id: Option<&str>,
    ) -> ChatResult<Url> {
        let mut url = Url::parse(&self.socket_url)
            .map_err(|e| ChatError::InvalidParameter(format!("socket URL: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChatError::InvalidParameter(format!(
                "socket URL scheme {}",
                url.scheme()
            )));
        }
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("brandId", &brand_id.to_string())
                .append_pair("channelId", channel_id);
            if let Some(customer_id) = customer_id {
                query.append_pair("customerId", customer_id);
            }
            query
                .append_pair("v", PROTOCOL_VERSION)
                .append_pair("EIO", "3")
                .append_pair("transport", "websocket");
        }
        Ok(url)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}
