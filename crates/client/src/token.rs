//! Access token lifetime and refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use palaver_shared::{
    AccessTokenDto, ChatError, ChatResult, ErrorCode, EventType, OutboundEvent, TokenRefreshedData,
};
use serde_json::json;
use tokio::sync::Mutex;

use crate::context::ConnectionContext;
use crate::events::ClientEvents;
use crate::ws::connection::EventSender;
use crate::ws::correlator::{EventCorrelator, Expectation};

/// Margin subtracted from the advertised lifetime.
pub const EXPIRY_MARGIN_SECS: i64 = 180;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_in: i64, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            issued_at,
            expires_in,
        }
    }

    /// Expired once `expires_in - 180s` have passed since issue. With the backend
    /// default lifetime of 180s a token counts as expired right away.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at >= chrono::Duration::seconds(self.expires_in - EXPIRY_MARGIN_SECS)
    }
}

impl From<AccessTokenDto> for AccessToken {
    fn from(dto: AccessTokenDto) -> Self {
        Self::new(dto.token, dto.expires_in, Utc::now())
    }
}

/// Serializes token refreshes: concurrent senders wait on the same gate and only the
/// first one talks to the backend. Waiters reuse any refresh that completed while
/// they queued, even when the new token is itself already inside the margin.
pub struct TokenRefresher {
    gate: Mutex<()>,
    /// Bumped after every successful refresh.
    generation: AtomicU64,
    context: Arc<ConnectionContext>,
    correlator: Arc<EventCorrelator>,
    events: ClientEvents,
}

impl TokenRefresher {
    pub fn new(context: Arc<ConnectionContext>, correlator: Arc<EventCorrelator>, events: ClientEvents) -> Self {
        Self {
            gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            context,
            correlator,
            events,
        }
    }

    fn expired_token(&self) -> Option<AccessToken> {
        self.context
            .access_token()
            .filter(|token| token.is_expired(Utc::now()))
    }

    pub async fn ensure_fresh(&self, sender: &dyn EventSender) -> ChatResult<()> {
        let seen = self.generation.load(Ordering::Acquire);
        if self.context.access_token().is_none() {
            let required = self
                .context
                .configuration()
                .is_some_and(|c| c.is_authorization_enabled);
            return if required { Err(ChatError::MissingAccessToken) } else { Ok(()) };
        }
        if self.expired_token().is_none() {
            return Ok(());
        }

        let _gate = self.gate.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            return Ok(());
        }
        let Some(expired) = self.expired_token() else {
            return Ok(());
        };

        tracing::debug!("refreshing access token");
        let request = OutboundEvent::new(
            EventType::RefreshToken,
            json!({ "accessToken": { "token": expired.token } }),
        );
        let expectation = Expectation::new(EventType::TokenRefreshed)
            .handling(&[ErrorCode::TokenRefreshingFailed])
            .without_token_check();

        let refreshed = self
            .correlator
            .sink(sender, request, expectation)
            .await
            .and_then(|event| event.decode::<TokenRefreshedData>());

        match refreshed {
            Ok(data) => {
                self.context.set_access_token(Some(data.access_token.into()));
                self.generation.fetch_add(1, Ordering::Release);
                tracing::info!("access token refreshed");
                Ok(())
            }
            Err(error) => {
                let error = match error {
                    ChatError::Operation {
                        code: ErrorCode::TokenRefreshingFailed,
                        ..
                    } => error,
                    other => ChatError::operation(ErrorCode::TokenRefreshingFailed, None, other.to_string()),
                };
                self.events.error(error.clone());
                Err(error)
            }
        }
    }
}
