//! Socket connection with state management, heartbeat and auto-reconnect.
//!
//! The manager owns at most one live socket. Every successful open starts a new
//! connection epoch with its own listener and heartbeat task; failures reported by a
//! task of an older epoch are ignored, so one broken socket yields one reconnect cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use palaver_shared::{is_pong, ChatError, ChatResult, OutboundEvent, HEARTBEAT_FRAME};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::ClientConfig;
use crate::context::{ChatState, ConnectionContext};
use crate::events::{ClientEvent, ClientEvents};
use crate::token::TokenRefresher;
use crate::ws::correlator::EventCorrelator;

mod connection_native;
pub use connection_native::TungsteniteConnector;

/// Connection state for the socket
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts per failure
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(exponent);
        // `as` saturates, so an overflowing power still lands on the cap.
        (delay as u32).min(self.max_delay_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(u64::from(self.delay_for_attempt(attempt)))
    }
}

/// An open socket as a pair of text channels.
///
/// `incoming` yields frames until the socket dies; its last item is the error that
/// ended it.
pub struct Socket {
    pub outgoing: UnboundedSender<String>,
    pub incoming: UnboundedReceiver<ChatResult<String>>,
}

/// Opens sockets. The production implementation is [`TungsteniteConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> ChatResult<Socket>;
}

/// Sends chat events over the live connection.
#[async_trait]
pub trait EventSender: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Send one event. With `check_token` the access token is refreshed first when
    /// it has expired.
    async fn send_event(&self, event: &OutboundEvent, check_token: bool) -> ChatResult<()>;
}

#[derive(Default)]
struct Link {
    url: Option<Url>,
    outgoing: Option<UnboundedSender<String>>,
    epoch: u64,
    /// `None` once auto-reconnect is off.
    attempts: Option<u32>,
    listener: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Link {
    fn stop_epoch(&mut self) {
        if let Some(task) = self.listener.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        self.outgoing = None;
        self.epoch += 1;
    }
}

pub struct ConnectionManager {
    heartbeat_interval: Duration,
    pong_timeout: Duration,
    reconnect_config: ReconnectConfig,
    connector: Arc<dyn Connector>,
    correlator: Arc<EventCorrelator>,
    context: Arc<ConnectionContext>,
    refresher: TokenRefresher,
    events: ClientEvents,
    state: watch::Sender<ConnectionState>,
    reconnected: Notify,
    pong: AtomicBool,
    link: Mutex<Link>,
}

impl ConnectionManager {
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        correlator: Arc<EventCorrelator>,
        context: Arc<ConnectionContext>,
        events: ClientEvents,
    ) -> Arc<Self> {
        let refresher = TokenRefresher::new(context.clone(), correlator.clone(), events.clone());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            heartbeat_interval: config.heartbeat_interval,
            pong_timeout: config.pong_timeout,
            reconnect_config: config.reconnect.clone(),
            connector,
            correlator,
            context,
            refresher,
            events,
            state,
            reconnected: Notify::new(),
            pong: AtomicBool::new(false),
            link: Mutex::new(Link::default()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Completes after the next reconnect cycle that ends with an open socket.
    pub async fn reconnected(&self) {
        self.reconnected.notified().await
    }

    pub fn correlator(&self) -> &Arc<EventCorrelator> {
        &self.correlator
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "connection state changed");
            self.events.emit(ClientEvent::ConnectionStateChanged(state));
        }
    }

    /// Open the socket and start the listener and heartbeat for a new epoch.
    pub async fn connect(self: &Arc<Self>, url: Url) -> ChatResult<()> {
        {
            let mut link = self.link();
            if let Some(task) = link.reconnect.take() {
                task.abort();
            }
            link.stop_epoch();
        }
        self.set_state(ConnectionState::Connecting);
        tracing::info!(%url, "connecting");

        match self.connector.open(&url).await {
            Ok(socket) => {
                self.attach(url, socket);
                Ok(())
            }
            Err(error) => {
                tracing::error!(%error, "socket open failed");
                self.set_state(ConnectionState::Disconnected);
                Err(match error {
                    ChatError::WebSocketConnectionFailure(_) => error,
                    other => ChatError::WebSocketConnectionFailure(other.to_string()),
                })
            }
        }
    }

    fn attach(self: &Arc<Self>, url: Url, socket: Socket) {
        let mut link = self.link();
        link.stop_epoch();
        let epoch = link.epoch;
        link.url = Some(url);
        link.outgoing = Some(socket.outgoing);
        link.attempts = Some(0);
        self.pong.store(false, Ordering::SeqCst);
        link.listener = Some(tokio::spawn(listen(Arc::downgrade(self), epoch, socket.incoming)));
        link.heartbeat = Some(tokio::spawn(heartbeat(
            Arc::downgrade(self),
            epoch,
            self.heartbeat_interval,
            self.pong_timeout,
        )));
        drop(link);
        tracing::info!(epoch, "socket connected");
        self.set_state(ConnectionState::Connected);
    }

    /// Tear the connection down for good.
    pub fn disconnect(&self, unexpectedly: bool) {
        {
            let mut link = self.link();
            if let Some(task) = link.reconnect.take() {
                task.abort();
            }
            link.stop_epoch();
            link.attempts = None;
        }
        self.correlator.fail_all(ChatError::ConnectionClosed);
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(unexpectedly, "disconnected");
        self.events.emit(ClientEvent::Disconnected { unexpectedly });
    }

    /// A task of `epoch` saw the socket die.
    fn report_failure(self: &Arc<Self>, epoch: u64, error: ChatError) {
        let mut link = self.link();
        if link.epoch != epoch {
            tracing::debug!(epoch, current = link.epoch, "ignoring failure from stale connection");
            return;
        }
        if link.reconnect.is_some() {
            tracing::debug!("reconnect already running");
            return;
        }
        tracing::warn!(epoch, %error, "connection lost");
        link.stop_epoch();

        let budget_left = link
            .attempts
            .is_some_and(|n| n < self.reconnect_config.max_attempts);
        match (budget_left, link.url.clone()) {
            (true, Some(url)) => {
                link.reconnect = Some(tokio::spawn(reconnect(Arc::downgrade(self), url)));
                drop(link);
                self.correlator.fail_all(error);
            }
            _ => {
                link.attempts = None;
                drop(link);
                self.give_up(error);
            }
        }
    }

    fn give_up(&self, error: ChatError) {
        tracing::error!(%error, "giving up on the connection");
        self.correlator.fail_all(error.clone());
        self.set_state(ConnectionState::Failed {
            reason: error.to_string(),
        });
        self.context.set_chat_state(ChatState::Closed);
        self.events.error(error);
        self.events.emit(ClientEvent::Disconnected { unexpectedly: true });
    }

    /// Claim the next reconnect attempt, or `None` when the budget is spent.
    fn next_attempt(&self) -> Option<u32> {
        let mut link = self.link();
        let n = link.attempts?;
        if n >= self.reconnect_config.max_attempts {
            return None;
        }
        link.attempts = Some(n + 1);
        Some(n)
    }

    fn send_raw(&self, frame: String) -> ChatResult<()> {
        let link = self.link();
        let outgoing = link.outgoing.as_ref().ok_or(ChatError::NotConnected)?;
        outgoing
            .unbounded_send(frame)
            .map_err(|_| ChatError::ConnectionClosed)
    }

    fn frame_received(&self, text: String) {
        if is_pong(&text) {
            self.pong.store(true, Ordering::SeqCst);
            return;
        }
        self.correlator.dispatch(&text);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in [link.listener.take(), link.heartbeat.take(), link.reconnect.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl EventSender for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.link().outgoing.is_some()
    }

    async fn send_event(&self, event: &OutboundEvent, check_token: bool) -> ChatResult<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        if check_token {
            self.refresher.ensure_fresh(self).await?;
        }
        let fields = self.context.envelope_fields()?;
        let frame = event
            .envelope(
                fields.brand_id,
                &fields.channel_id,
                fields.customer.as_ref(),
                fields.access_token.as_deref(),
            )
            .to_frame()?;
        tracing::debug!(event_type = %event.event_type, event_id = %event.event_id, "sending event");
        self.send_raw(frame)
    }
}

async fn listen(manager: Weak<ConnectionManager>, epoch: u64, mut incoming: UnboundedReceiver<ChatResult<String>>) {
    let error = loop {
        match incoming.next().await {
            Some(Ok(text)) => match manager.upgrade() {
                Some(manager) => manager.frame_received(text),
                None => return,
            },
            Some(Err(error)) => break error,
            None => break ChatError::ConnectionClosed,
        }
    };
    if let Some(manager) = manager.upgrade() {
        manager.report_failure(epoch, error);
    }
}

async fn heartbeat(manager: Weak<ConnectionManager>, epoch: u64, interval: Duration, pong_timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        {
            let Some(manager) = manager.upgrade() else { return };
            manager.pong.store(false, Ordering::SeqCst);
            if let Err(error) = manager.send_raw(HEARTBEAT_FRAME.to_string()) {
                manager.report_failure(epoch, error);
                return;
            }
            tracing::trace!(epoch, "heartbeat sent");
        }

        tokio::time::sleep(pong_timeout).await;
        let Some(manager) = manager.upgrade() else { return };
        if !manager.pong.load(Ordering::SeqCst) {
            manager.report_failure(
                epoch,
                ChatError::WebSocketConnectionFailure(format!("no pong within {pong_timeout:?}")),
            );
            return;
        }
    }
}

async fn reconnect(manager: Weak<ConnectionManager>, url: Url) {
    loop {
        let (connector, delay) = {
            let Some(manager) = manager.upgrade() else { return };
            let Some(attempt) = manager.next_attempt() else {
                manager.link().reconnect = None;
                manager.give_up(ChatError::WebSocketConnectionFailure(format!(
                    "reconnect budget of {} attempts spent",
                    manager.reconnect_config.max_attempts
                )));
                return;
            };
            let delay = manager.reconnect_config.delay(attempt);
            tracing::info!(attempt = attempt + 1, ?delay, "reconnecting");
            manager.set_state(ConnectionState::Reconnecting { attempt: attempt + 1 });
            manager.context.set_chat_state(ChatState::Connecting);
            (manager.connector.clone(), delay)
        };

        tokio::time::sleep(delay).await;

        match connector.open(&url).await {
            Ok(socket) => {
                let Some(manager) = manager.upgrade() else { return };
                manager.link().reconnect = None;
                manager.attach(url, socket);
                manager.reconnected.notify_one();
                return;
            }
            Err(error) => tracing::warn!(%error, "reconnect attempt failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let config = ReconnectConfig::default();
        let mut previous = 0;
        for attempt in 0..64 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= previous, "attempt {attempt} shrank the delay");
            assert!(delay <= config.max_delay_ms);
            previous = delay;
        }
        assert_eq!(config.delay_for_attempt(0), 500);
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(u32::MAX), config.max_delay_ms);
    }

    #[test]
    fn connection_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Reconnecting { attempt: 2 }.is_connecting());
        assert!(!ConnectionState::Failed { reason: "x".into() }.is_connecting());
    }
}
