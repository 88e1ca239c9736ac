//! Chat client facade: wires the components and runs the connect and resume flows.

use std::sync::Arc;

use palaver_shared::{
    ChatError, ChatMode, ChatResult, CustomerAuthorizedData, CustomerIdentity, ErrorCode, EventType,
    OutboundEvent,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api_client::{ApiClient, ChannelApi};
use crate::config::ClientConfig;
use crate::context::{ChatState, ConnectionContext};
use crate::events::{ClientEvent, ClientEvents};
use crate::stores::{ChatThread, ThreadRegistry};
use crate::token::AccessToken;
use crate::ws::{ConnectionManager, ConnectionState, Connector, EventCorrelator, Expectation, TungsteniteConnector};

pub struct ChatClient {
    config: ClientConfig,
    context: Arc<ConnectionContext>,
    connection: Arc<ConnectionManager>,
    registry: Arc<ThreadRegistry>,
    api: Arc<dyn ChannelApi>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatClient {
    /// Build a client with the production socket and HTTP implementations.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> ChatResult<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        config.validate().map_err(ChatError::InvalidParameter)?;
        let api = Arc::new(ApiClient::new(config.chat_url.clone()));
        Ok(Self::with_parts(config, Arc::new(TungsteniteConnector), api))
    }

    /// Build a client around any transport and HTTP collaborator.
    pub fn with_parts(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ChannelApi>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = ClientEvents::channel();
        let context = Arc::new(ConnectionContext::new(events.clone()));
        let correlator = Arc::new(EventCorrelator::new(config.event_timeout, config.broadcast_capacity));
        let connection = ConnectionManager::new(&config, connector, correlator.clone(), context.clone(), events.clone());
        let registry = ThreadRegistry::new(
            context.clone(),
            correlator,
            connection.clone(),
            api.clone(),
            events.clone(),
        );

        let listener = registry.spawn_listener();
        let supervisor = tokio::spawn(resume_after_reconnect(
            connection.clone(),
            registry.clone(),
            context.clone(),
            events,
        ));

        let client = Self {
            config,
            context,
            connection,
            registry,
            api,
            tasks: vec![listener, supervisor],
        };
        (client, rx)
    }

    /// Fetch the channel configuration and get ready to connect.
    pub async fn prepare(&self, brand_id: i64, channel_id: &str) -> ChatResult<()> {
        self.context.set_chat_state(ChatState::Preparing);
        let configuration = match self.api.channel_configuration(brand_id, channel_id).await {
            Ok(configuration) => configuration,
            Err(error) => {
                tracing::error!(%error, brand_id, channel_id, "channel configuration unavailable");
                self.context.set_chat_state(ChatState::Initial);
                return Err(error);
            }
        };
        tracing::info!(brand_id, channel_id, mode = ?configuration.chat_mode(), "channel prepared");
        self.context.set_channel(brand_id, channel_id, configuration);
        if self.context.customer().is_none() {
            self.context.set_customer(Some(CustomerIdentity::generate()));
        }
        self.context.set_chat_state(ChatState::Prepared);
        Ok(())
    }

    /// Open the socket, authorize the customer and load threads.
    pub async fn connect(&self) -> ChatResult<()> {
        let (Some(brand_id), Some(channel_id)) = (self.context.brand_id(), self.context.channel_id()) else {
            return Err(ChatError::MissingParameter("channel configuration".to_string()));
        };
        let customer_id = self.context.customer().map(|c| c.id);
        let url = self
            .config
            .socket_endpoint(brand_id, &channel_id, customer_id.as_deref())?;

        self.context.set_chat_state(ChatState::Connecting);
        if let Err(error) = self.connection.connect(url).await {
            self.context.set_chat_state(ChatState::Prepared);
            return Err(error);
        }

        let authorized = if self.context.access_token().is_some() {
            reconnect_customer(&self.connection, &self.context).await
        } else {
            authorize_customer(&self.connection, &self.context).await
        };
        if let Err(error) = authorized {
            self.connection.disconnect(false);
            self.context.set_chat_state(ChatState::Prepared);
            return Err(error);
        }
        self.context.set_chat_state(ChatState::Connected);

        self.registry.load(None).await
    }

    /// Resume a specific thread instead of the latest one.
    pub async fn load_thread(&self, thread_id: uuid::Uuid) -> ChatResult<()> {
        self.registry.load(Some(thread_id)).await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect(false);
        self.context.set_chat_state(ChatState::Closed);
    }

    /// Disconnect and forget the customer and every thread.
    pub async fn sign_out(&self) {
        self.connection.disconnect(false);
        self.registry.reset().await;
        self.context.clear_customer();
        self.context.set_chat_state(ChatState::Initial);
    }

    pub fn set_customer_name(&self, first_name: Option<String>, last_name: Option<String>) -> ChatResult<()> {
        self.context.set_customer_name(first_name, last_name)
    }

    pub fn customer(&self) -> Option<CustomerIdentity> {
        self.context.customer()
    }

    pub fn chat_state(&self) -> ChatState {
        self.context.chat_state()
    }

    pub fn chat_mode(&self) -> ChatMode {
        self.context.chat_mode()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn threads(&self) -> Vec<ChatThread> {
        self.registry.threads().await
    }

    /// Per-thread operations.
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.connection.disconnect(false);
    }
}

async fn authorize_customer(connection: &ConnectionManager, context: &ConnectionContext) -> ChatResult<()> {
    let customer = context.customer().ok_or(ChatError::CustomerAssociationFailure)?;
    let request = OutboundEvent::new(EventType::AuthorizeCustomer, json!({ "consumerIdentity": customer }));
    let event = connection
        .correlator()
        .sink(
            connection,
            request,
            Expectation::new(EventType::CustomerAuthorized)
                .handling(&[ErrorCode::ConsumerAuthorizationFailed])
                .without_token_check(),
        )
        .await?;
    store_authorization(context, event.decode()?);
    tracing::info!("customer authorized");
    Ok(())
}

async fn reconnect_customer(connection: &ConnectionManager, context: &ConnectionContext) -> ChatResult<()> {
    let event = connection
        .correlator()
        .sink(
            connection,
            OutboundEvent::new(EventType::ReconnectCustomer, json!({})),
            Expectation::new(EventType::CustomerAuthorized).handling(&[ErrorCode::ConsumerReconnectionFailed]),
        )
        .await?;
    store_authorization(context, event.decode()?);
    tracing::info!("customer reconnected");
    Ok(())
}

fn store_authorization(context: &ConnectionContext, data: CustomerAuthorizedData) {
    let mut identity = data.consumer_identity;
    if let Some(local) = context.customer() {
        identity.first_name = identity.first_name.or(local.first_name);
        identity.last_name = identity.last_name.or(local.last_name);
    }
    context.set_customer(Some(identity));
    if let Some(token) = data.access_token {
        context.set_access_token(Some(AccessToken::from(token)));
    }
}

/// Re-authorize and reload threads after every successful reconnect.
async fn resume_after_reconnect(
    connection: Arc<ConnectionManager>,
    registry: Arc<ThreadRegistry>,
    context: Arc<ConnectionContext>,
    events: ClientEvents,
) {
    loop {
        connection.reconnected().await;
        tracing::info!("resuming chat after reconnect");
        let resumed = async {
            if context.access_token().is_some() {
                reconnect_customer(&connection, &context).await?;
            } else {
                authorize_customer(&connection, &context).await?;
            }
            context.set_chat_state(ChatState::Connected);
            registry.load(None).await
        }
        .await;
        if let Err(error) = resumed {
            tracing::error!(%error, "resume after reconnect failed");
            events.error(error);
        }
    }
}
