//! Shared connection context.
//!
//! Every field sits behind its own lock and has a single writer: `prepare` owns the
//! channel fields, authorization owns the identity, the token refresher owns the token
//! and the client facade owns the chat state.

use std::sync::{PoisonError, RwLock};

use palaver_shared::{ChannelConfiguration, ChatError, ChatMode, ChatResult, CustomerIdentity};

use crate::events::{ClientEvent, ClientEvents};
use crate::token::AccessToken;

/// Lifecycle of the chat as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Initial,
    Preparing,
    Prepared,
    Connecting,
    Connected,
    Ready,
    Closed,
}

/// Values stamped on every outbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeFields {
    pub brand_id: i64,
    pub channel_id: String,
    pub customer: Option<CustomerIdentity>,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone)]
struct Channel {
    brand_id: i64,
    channel_id: String,
    configuration: ChannelConfiguration,
}

#[derive(Debug)]
pub struct ConnectionContext {
    channel: RwLock<Option<Channel>>,
    customer: RwLock<Option<CustomerIdentity>>,
    access_token: RwLock<Option<AccessToken>>,
    chat_state: RwLock<ChatState>,
    events: ClientEvents,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) -> T {
    let mut guard = lock.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *guard, value)
}

impl ConnectionContext {
    pub fn new(events: ClientEvents) -> Self {
        Self {
            channel: RwLock::new(None),
            customer: RwLock::new(None),
            access_token: RwLock::new(None),
            chat_state: RwLock::new(ChatState::Initial),
            events,
        }
    }

    pub fn set_channel(&self, brand_id: i64, channel_id: impl Into<String>, configuration: ChannelConfiguration) {
        write(
            &self.channel,
            Some(Channel {
                brand_id,
                channel_id: channel_id.into(),
                configuration,
            }),
        );
    }

    pub fn is_prepared(&self) -> bool {
        self.channel.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn brand_id(&self) -> Option<i64> {
        read(&self.channel).map(|c| c.brand_id)
    }

    pub fn channel_id(&self) -> Option<String> {
        read(&self.channel).map(|c| c.channel_id)
    }

    pub fn configuration(&self) -> Option<ChannelConfiguration> {
        read(&self.channel).map(|c| c.configuration)
    }

    /// Mode derived from the channel configuration, single thread until prepared.
    pub fn chat_mode(&self) -> ChatMode {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(ChatMode::SingleThread, |c| c.configuration.chat_mode())
    }

    pub fn customer(&self) -> Option<CustomerIdentity> {
        read(&self.customer)
    }

    pub fn set_customer(&self, customer: Option<CustomerIdentity>) {
        write(&self.customer, customer);
    }

    pub fn set_customer_name(&self, first_name: Option<String>, last_name: Option<String>) -> ChatResult<()> {
        let mut guard = self.customer.write().unwrap_or_else(PoisonError::into_inner);
        let customer = guard
            .as_mut()
            .ok_or_else(|| ChatError::MissingParameter("customer identity".to_string()))?;
        customer.first_name = first_name;
        customer.last_name = last_name;
        Ok(())
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        read(&self.access_token)
    }

    pub fn set_access_token(&self, token: Option<AccessToken>) {
        write(&self.access_token, token);
    }

    pub fn chat_state(&self) -> ChatState {
        read(&self.chat_state)
    }

    /// Update the chat state, notifying the host when it actually changes.
    pub fn set_chat_state(&self, state: ChatState) {
        let previous = write(&self.chat_state, state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "chat state changed");
            self.events.emit(ClientEvent::ChatStateChanged(state));
        }
    }

    pub fn envelope_fields(&self) -> ChatResult<EnvelopeFields> {
        let channel = read(&self.channel).ok_or_else(|| ChatError::MissingParameter("brandId".to_string()))?;
        Ok(EnvelopeFields {
            brand_id: channel.brand_id,
            channel_id: channel.channel_id,
            customer: self.customer(),
            access_token: self.access_token().map(|t| t.token),
        })
    }

    /// Forget everything tied to the signed-in customer.
    pub fn clear_customer(&self) {
        write(&self.customer, None);
        write(&self.access_token, None);
    }
}
