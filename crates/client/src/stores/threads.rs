//! Thread registry: the single owner of threads and messages.
//!
//! Server pushes are applied by one listener task in delivery order. Operations take
//! the state lock only around local reads and writes, never across a network await.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use palaver_shared::{
    CaseInboxAssigneeChangedData, CaseStatus, CaseStatusChangedData, ChannelConfiguration, ChatError,
    ChatMode, ChatResult, ErrorCode, EventType, InboundEvent, MessageCreatedData, MessageDirection,
    MessageReadChangedData, MoreMessagesLoadedData, OperationError, OutboundEvent,
    SetPositionInQueueData, ThreadListFetchedData, ThreadMetadataLoadedData, ThreadRecoveredData,
    TypingData,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api_client::{validate_attachment, AttachmentUpload, ChannelApi};
use crate::context::{ChatState, ConnectionContext};
use crate::events::{ClientEvent, ClientEvents};
use crate::stores::messages::{
    ChatThread, Message, MessageContent, MessageStatus, ThreadState, BEGIN_CONVERSATION_TEXT,
};
use crate::ws::connection::EventSender;
use crate::ws::correlator::{EventCorrelator, Expectation};

/// A message the customer wants to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub postback: Option<String>,
    pub attachments: Vec<AttachmentUpload>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_postback(mut self, postback: impl Into<String>) -> Self {
        self.postback = Some(postback.into());
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.postback.as_deref().map_or(true, |p| p.trim().is_empty())
            && self.attachments.is_empty()
    }
}

/// Queue position that arrived before its thread knew its contact id.
#[derive(Debug, Clone)]
struct QueuedPosition {
    contact_id: String,
    position: u32,
}

#[derive(Debug, Default)]
struct RegistryState {
    threads: Vec<ChatThread>,
    queued_position: Option<QueuedPosition>,
}

impl RegistryState {
    fn index(&self, id: Uuid) -> Option<usize> {
        self.threads.iter().position(|t| t.id == id)
    }

    fn thread(&self, id: Uuid) -> ChatResult<&ChatThread> {
        self.threads
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| ChatError::InvalidThread(id.to_string()))
    }

    fn thread_mut(&mut self, id: Uuid) -> ChatResult<&mut ChatThread> {
        self.threads
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ChatError::InvalidThread(id.to_string()))
    }

    /// Thread a case belongs to, by thread id first and contact id second.
    fn case_thread_mut(&mut self, thread_id: Option<Uuid>, contact_id: &str) -> Option<&mut ChatThread> {
        let index = thread_id
            .and_then(|id| self.index(id))
            .or_else(|| {
                self.threads
                    .iter()
                    .position(|t| t.contact_id.as_deref() == Some(contact_id))
            })?;
        self.threads.get_mut(index)
    }
}

fn thread_ref(id: Uuid) -> Value {
    json!({ "idOnExternalPlatform": id })
}

pub struct ThreadRegistry {
    state: Mutex<RegistryState>,
    context: Arc<ConnectionContext>,
    correlator: Arc<EventCorrelator>,
    sender: Arc<dyn EventSender>,
    api: Arc<dyn ChannelApi>,
    events: ClientEvents,
}

impl ThreadRegistry {
    pub fn new(
        context: Arc<ConnectionContext>,
        correlator: Arc<EventCorrelator>,
        sender: Arc<dyn EventSender>,
        api: Arc<dyn ChannelApi>,
        events: ClientEvents,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            context,
            correlator,
            sender,
            api,
            events,
        })
    }

    /// Start applying inbound events in arrival order. The subscription is taken
    /// before this returns and never skips an event.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut inbound = self.correlator.subscribe_ordered();
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(registry) = registry.upgrade() else { return };
                registry.apply(event).await;
            }
        })
    }

    pub async fn threads(&self) -> Vec<ChatThread> {
        self.state.lock().await.threads.clone()
    }

    pub async fn thread(&self, id: Uuid) -> Option<ChatThread> {
        self.state.lock().await.thread(id).ok().cloned()
    }

    fn configuration(&self) -> ChatResult<ChannelConfiguration> {
        self.context
            .configuration()
            .ok_or_else(|| ChatError::MissingParameter("channel configuration".to_string()))
    }

    fn publish_thread(&self, thread: &ChatThread) {
        self.events.emit(ClientEvent::ThreadUpdated(thread.clone()));
    }

    fn publish_all(&self, state: &RegistryState) {
        self.events.emit(ClientEvent::ThreadsUpdated(state.threads.clone()));
    }

    // --- Operations ---

    /// Create a thread locally. It becomes known to the backend with its first message.
    pub async fn create(&self, custom_fields: BTreeMap<String, String>) -> ChatResult<Uuid> {
        let config = self.configuration()?;
        let mode = config.chat_mode();
        let id = Uuid::new_v4();
        {
            let mut state = self.state.lock().await;
            if mode != ChatMode::MultiThread && !state.threads.is_empty() {
                return Err(ChatError::UnsupportedChannelConfig);
            }

            let missing: Vec<String> = config
                .required_prechat_fields()
                .filter(|ident| custom_fields.get(*ident).map_or(true, |v| v.trim().is_empty()))
                .map(str::to_string)
                .collect();
            if !missing.is_empty() {
                return Err(ChatError::MissingPreChatCustomFields(missing));
            }

            let mut thread = ChatThread::pending(id, custom_fields);
            if let Some(welcome) = config.welcome_message.as_deref().filter(|w| !w.trim().is_empty()) {
                thread.merge([Message::welcome(id, welcome)]);
            }
            tracing::info!(thread_id = %id, ?mode, "thread created");
            state.threads.push(thread);
            self.publish_all(&state);
        }

        if mode == ChatMode::LiveChat {
            self.send_begin_conversation(id).await?;
        }
        Ok(id)
    }

    async fn send_begin_conversation(&self, thread_id: Uuid) -> ChatResult<()> {
        let custom_fields = {
            let state = self.state.lock().await;
            state.thread(thread_id)?.custom_fields.clone()
        };
        let payload = json!({
            "thread": thread_ref(thread_id),
            "idOnExternalPlatform": Uuid::new_v4(),
            "messageContent": { "type": "TEXT", "payload": { "text": BEGIN_CONVERSATION_TEXT } },
            "consumerContact": { "customFields": custom_fields_payload(&custom_fields) },
        });
        self.sender
            .send_event(&OutboundEvent::new(EventType::SendMessage, payload), true)
            .await
    }

    /// Load threads for the current chat mode and settle the chat state to `Ready`.
    pub async fn load(&self, thread_id: Option<Uuid>) -> ChatResult<()> {
        match self.context.chat_mode() {
            ChatMode::MultiThread => self.load_thread_list().await?,
            mode => self.recover(thread_id, mode).await?,
        }
        self.context.set_chat_state(ChatState::Ready);
        Ok(())
    }

    async fn load_thread_list(&self) -> ChatResult<()> {
        let event = self
            .correlator
            .sink(
                self.sender.as_ref(),
                OutboundEvent::new(EventType::FetchThreadList, json!({})),
                Expectation::new(EventType::ThreadListFetched),
            )
            .await?;
        let data: ThreadListFetchedData = event.decode()?;
        {
            let mut state = self.state.lock().await;
            for dto in &data.threads {
                match state.index(dto.id) {
                    Some(index) => state.threads[index].apply_dto(dto),
                    None => state.threads.push(ChatThread::from_dto(dto)),
                }
            }
            tracing::debug!(count = data.threads.len(), "thread list fetched");
            self.publish_all(&state);
        }
        self.load_all_metadata().await;
        Ok(())
    }

    /// Fetch metadata for every known thread at once; one failure never cancels the rest.
    pub async fn load_all_metadata(&self) {
        let ids: Vec<Uuid> = {
            let state = self.state.lock().await;
            state
                .threads
                .iter()
                .filter(|t| t.state != ThreadState::Pending)
                .map(|t| t.id)
                .collect()
        };
        let results = join_all(ids.iter().map(|id| self.load_metadata(*id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(error) = result {
                tracing::warn!(thread_id = %id, %error, "thread metadata failed");
                self.events.error(error);
            }
        }
    }

    async fn recover(&self, thread_id: Option<Uuid>, mode: ChatMode) -> ChatResult<()> {
        let (request, response, code) = if mode == ChatMode::LiveChat {
            (EventType::RecoverLivechat, EventType::LivechatRecovered, ErrorCode::RecoveringLivechatFailed)
        } else {
            (EventType::RecoverThread, EventType::ThreadRecovered, ErrorCode::RecoveringThreadFailed)
        };
        let payload = match thread_id {
            Some(id) => json!({ "thread": thread_ref(id) }),
            None => json!({}),
        };

        let result = self
            .correlator
            .sink(
                self.sender.as_ref(),
                OutboundEvent::new(request, payload),
                Expectation::new(response).handling(&[code]),
            )
            .await;

        match result {
            Ok(event) => {
                let data: ThreadRecoveredData = event.decode()?;
                self.apply_recovered(data).await;
                Ok(())
            }
            Err(error) if error.code().is_some_and(|c| c.is_recovery_failure()) => {
                self.recovery_fallback(mode, error).await
            }
            Err(error) => Err(error),
        }
    }

    async fn apply_recovered(&self, data: ThreadRecoveredData) {
        let mut state = self.state.lock().await;
        let mut thread = match state.index(data.thread.id) {
            Some(index) => state.threads.swap_remove(index),
            None => ChatThread::from_dto(&data.thread),
        };
        if !state.threads.is_empty() {
            tracing::debug!(dropped = state.threads.len(), "recovered thread supersedes local threads");
        }
        state.threads.clear();

        thread.apply_dto(&data.thread);
        thread.merge(data.messages.into_iter().map(Message::from));
        thread.scroll_token = data.messages_scroll_token;
        if let Some(agent) = data.inbox_assignee {
            thread.assign(Some(agent));
        }
        if data.previous_inbox_assignee.is_some() {
            thread.last_assigned_agent = data.previous_inbox_assignee;
        }
        if let Some(contact) = data.consumer_contact {
            if contact.status == Some(CaseStatus::Closed) {
                thread.transition(ThreadState::Closed);
            }
            thread.contact_id = Some(contact.id);
        }
        replay_queued_position(&mut state.queued_position, &mut thread);

        tracing::info!(thread_id = %thread.id, messages = thread.messages.len(), "thread recovered");
        state.threads.push(thread);
        self.publish_all(&state);
    }

    async fn recovery_fallback(&self, mode: ChatMode, error: ChatError) -> ChatResult<()> {
        let config = self.configuration()?;
        if mode == ChatMode::LiveChat && config.features.recover_livechat_fallback_disabled {
            return Err(error);
        }

        {
            let mut state = self.state.lock().await;
            if state.threads.iter().any(|t| t.state == ThreadState::Pending) {
                tracing::debug!("nothing to recover, keeping the pending thread");
                return Ok(());
            }
            state.threads.clear();
            state.queued_position = None;
            self.publish_all(&state);
        }

        if config.requires_prechat_survey() {
            tracing::debug!("nothing to recover, waiting for pre-chat answers");
            return Ok(());
        }
        tracing::debug!("nothing to recover, starting a new thread");
        self.create(BTreeMap::new()).await.map(|_| ())
    }

    /// Send a message; the optimistic copy flips to `Sent` or `Failed`.
    pub async fn send(&self, thread_id: Uuid, message: OutboundMessage) -> ChatResult<Uuid> {
        if message.is_empty() {
            return Err(ChatError::InvalidParameter("message has no content".to_string()));
        }
        {
            let state = self.state.lock().await;
            if state.thread(thread_id)?.is_closed() {
                return Err(ChatError::IllegalThreadState);
            }
        }
        if !self.sender.is_connected() {
            return Err(ChatError::NotConnected);
        }

        let config = self.configuration()?;
        let attachments = self.upload_attachments(&config, &message.attachments).await?;

        let message_id = Uuid::new_v4();
        let content = MessageContent::Text {
            text: message.text.clone(),
            postback: message.postback.clone(),
        };
        let local = Message::outgoing(
            message_id,
            thread_id,
            content,
            attachments.clone(),
            self.context.customer(),
        );

        let payload = {
            let mut state = self.state.lock().await;
            let thread = state.thread_mut(thread_id)?;
            let first = !thread.has_customer_messages();
            let mut payload = json!({
                "thread": {
                    "idOnExternalPlatform": thread_id,
                    "threadName": thread.name.clone().unwrap_or_default(),
                },
                "idOnExternalPlatform": message_id,
                "messageContent": {
                    "type": "TEXT",
                    "payload": { "text": message.text, "postback": message.postback },
                },
                "attachments": attachments,
            });
            if first {
                payload["consumerContact"] = json!({ "customFields": custom_fields_payload(&thread.custom_fields) });
            }
            if let Some(contact_id) = &thread.contact_id {
                payload["contact"] = json!({ "id": contact_id });
            }
            thread.merge([local]);
            self.publish_thread(thread);
            payload
        };

        let result = self
            .sender
            .send_event(&OutboundEvent::new(EventType::SendMessage, payload), true)
            .await;

        let mut state = self.state.lock().await;
        if let Ok(thread) = state.thread_mut(thread_id) {
            if let Some(sent) = thread.message_mut(message_id) {
                match &result {
                    Ok(()) => sent.advance_status(MessageStatus::Sent),
                    Err(error) => {
                        tracing::warn!(%thread_id, %message_id, %error, "message send failed");
                        sent.fail();
                    }
                }
            }
            self.publish_thread(thread);
        }
        result.map(|()| message_id)
    }

    async fn upload_attachments(
        &self,
        config: &ChannelConfiguration,
        uploads: &[AttachmentUpload],
    ) -> ChatResult<Vec<palaver_shared::Attachment>> {
        if uploads.is_empty() {
            return Ok(Vec::new());
        }
        for upload in uploads {
            validate_attachment(&config.settings.file_restrictions, upload)?;
        }
        let brand_id = self
            .context
            .brand_id()
            .ok_or_else(|| ChatError::MissingParameter("brandId".to_string()))?;
        let channel_id = self
            .context
            .channel_id()
            .ok_or_else(|| ChatError::MissingParameter("channelId".to_string()))?;

        let mut attachments = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let url = self.api.upload_attachment(brand_id, &channel_id, upload).await?;
            attachments.push(palaver_shared::Attachment {
                url,
                friendly_name: upload.file_name.clone(),
                mime_type: upload.mime_type.clone(),
            });
        }
        Ok(attachments)
    }

    /// Fetch the next page of older messages.
    pub async fn load_more(&self, thread_id: Uuid) -> ChatResult<()> {
        let (scroll_token, oldest) = {
            let state = self.state.lock().await;
            let thread = state.thread(thread_id)?;
            let oldest = thread.oldest_message().ok_or(ChatError::InvalidOldestDate)?.created_at;
            if !thread.has_more_history() {
                return Err(ChatError::NoMoreMessages);
            }
            (thread.scroll_token.clone(), oldest)
        };

        let event = self
            .correlator
            .sink(
                self.sender.as_ref(),
                OutboundEvent::new(
                    EventType::LoadMoreMessages,
                    json!({
                        "thread": thread_ref(thread_id),
                        "scrollToken": scroll_token,
                        "oldestMessageDatetime": oldest,
                    }),
                ),
                Expectation::new(EventType::MoreMessagesLoaded).for_thread(thread_id),
            )
            .await?;
        let mut data: MoreMessagesLoadedData = event.decode()?;
        data.messages.retain(|m| {
            let ours = m.thread_id == thread_id;
            if !ours {
                tracing::debug!(%thread_id, other = %m.thread_id, "dropping message of another thread from page");
            }
            ours
        });

        let mut state = self.state.lock().await;
        let thread = state.thread_mut(thread_id)?;
        if data.messages.is_empty() {
            thread.scroll_token.clear();
        } else {
            thread.merge(data.messages.into_iter().map(Message::from));
            thread.scroll_token = data.scroll_token;
        }
        self.publish_thread(thread);
        Ok(())
    }

    /// Fetch the owner and last message of a thread.
    pub async fn load_metadata(&self, thread_id: Uuid) -> ChatResult<()> {
        self.state.lock().await.thread(thread_id)?;

        let event = self
            .correlator
            .sink(
                self.sender.as_ref(),
                OutboundEvent::new(EventType::LoadThreadMetadata, json!({ "thread": thread_ref(thread_id) })),
                Expectation::new(EventType::ThreadMetadataLoaded).for_thread(thread_id),
            )
            .await?;
        let data: ThreadMetadataLoadedData = event.decode()?;

        let mut state = self.state.lock().await;
        let thread = state.thread_mut(thread_id)?;
        if data.owner_assignee.is_some() {
            thread.assign(data.owner_assignee);
        }
        match data.last_message {
            Some(last) if last.thread_id == thread_id => {
                thread.merge([Message::from(last)]);
            }
            Some(last) => {
                tracing::debug!(%thread_id, other = %last.thread_id, "ignoring last message of another thread");
            }
            None => {}
        }
        thread.transition(ThreadState::Loaded);
        self.publish_thread(thread);
        Ok(())
    }

    fn require_multithread(&self) -> ChatResult<()> {
        if self.context.chat_mode() == ChatMode::MultiThread {
            Ok(())
        } else {
            Err(ChatError::UnsupportedChannelConfig)
        }
    }

    pub async fn archive(&self, thread_id: Uuid) -> ChatResult<()> {
        self.require_multithread()?;
        if self.state.lock().await.thread(thread_id)?.state == ThreadState::Pending {
            return Err(ChatError::IllegalThreadState);
        }

        self.correlator
            .sink(
                self.sender.as_ref(),
                OutboundEvent::new(EventType::ArchiveThread, json!({ "thread": thread_ref(thread_id) })),
                Expectation::new(EventType::ThreadArchived),
            )
            .await?;

        let mut state = self.state.lock().await;
        let thread = state.thread_mut(thread_id)?;
        thread.transition(ThreadState::Closed);
        thread.position_in_queue = None;
        self.publish_thread(thread);
        Ok(())
    }

    pub async fn rename(&self, thread_id: Uuid, name: &str) -> ChatResult<()> {
        self.require_multithread()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidParameter("thread name is empty".to_string()));
        }

        let pending = self.state.lock().await.thread(thread_id)?.state == ThreadState::Pending;
        if !pending {
            self.correlator
                .sink(
                    self.sender.as_ref(),
                    OutboundEvent::new(
                        EventType::UpdateThread,
                        json!({ "thread": { "idOnExternalPlatform": thread_id, "threadName": name } }),
                    ),
                    Expectation::new(EventType::ThreadUpdated),
                )
                .await?;
        }

        let mut state = self.state.lock().await;
        let thread = state.thread_mut(thread_id)?;
        thread.name = Some(name.to_string());
        self.publish_thread(thread);
        Ok(())
    }

    /// Tell the backend the customer has seen the thread.
    pub async fn mark_read(&self, thread_id: Uuid) -> ChatResult<()> {
        if self.state.lock().await.thread(thread_id)?.messages.is_empty() {
            return Ok(());
        }
        self.sender
            .send_event(
                &OutboundEvent::new(EventType::MessageSeenByCustomer, json!({ "thread": thread_ref(thread_id) })),
                true,
            )
            .await?;

        let now = chrono::Utc::now();
        let mut state = self.state.lock().await;
        let thread = state.thread_mut(thread_id)?;
        for message in thread
            .messages
            .iter_mut()
            .filter(|m| m.direction == MessageDirection::ToClient && !m.is_read())
        {
            message.user_statistics.seen_at.get_or_insert(now);
            message.user_statistics.read_at = Some(now);
        }
        self.publish_thread(thread);
        Ok(())
    }

    /// Ask the backend to close the live chat contact of a thread.
    pub async fn end_contact(&self, thread_id: Uuid) -> ChatResult<()> {
        let contact_id = self
            .state
            .lock()
            .await
            .thread(thread_id)?
            .contact_id
            .clone()
            .ok_or(ChatError::IllegalThreadState)?;
        self.sender
            .send_event(
                &OutboundEvent::new(
                    EventType::EndContact,
                    json!({ "thread": thread_ref(thread_id), "contact": { "id": contact_id } }),
                ),
                true,
            )
            .await
    }

    pub async fn report_typing(&self, thread_id: Uuid, started: bool) -> ChatResult<()> {
        self.state.lock().await.thread(thread_id)?;
        let event_type = if started {
            EventType::SenderTypingStarted
        } else {
            EventType::SenderTypingEnded
        };
        self.sender
            .send_event(&OutboundEvent::new(event_type, json!({ "thread": thread_ref(thread_id) })), true)
            .await
    }

    /// Forget every thread.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.threads.clear();
        state.queued_position = None;
        self.publish_all(&state);
    }

    // --- Event application ---

    pub async fn apply(&self, event: InboundEvent) {
        let event_type = event.event_type;
        let result = match event_type {
            EventType::MessageCreated => match event.decode() {
                Ok(data) => {
                    self.message_created(data).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            EventType::SetPositionInQueue => match event.decode() {
                Ok(data) => {
                    self.position_in_queue(data).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            EventType::CaseInboxAssigneeChanged => match event.decode() {
                Ok(data) => {
                    self.assignee_changed(data).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            EventType::CaseStatusChanged => match event.decode() {
                Ok(data) => {
                    self.case_status_changed(data).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            EventType::MessageReadChanged => match event.decode::<MessageReadChangedData>() {
                Ok(data) => {
                    let message = Message::from(data.message);
                    let mut state = self.state.lock().await;
                    if let Ok(thread) = state.thread_mut(message.thread_id) {
                        thread.merge([message]);
                        self.publish_thread(thread);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            EventType::SenderTypingStarted | EventType::SenderTypingEnded => {
                event.decode::<TypingData>().map(|data| {
                    self.events.emit(ClientEvent::AgentTyping {
                        thread_id: data.thread.id,
                        agent: data.user,
                        typing: event_type == EventType::SenderTypingStarted,
                    });
                })
            }
            EventType::Error => event
                .decode::<OperationError>()
                .map(|error| self.events.error(error.into())),
            _ => Ok(()),
        };

        if let Err(error) = result {
            tracing::warn!(%event_type, %error, "ignoring malformed event");
        }
    }

    async fn message_created(&self, data: MessageCreatedData) {
        let mode = self.context.chat_mode();
        let welcome = self.context.configuration().and_then(|c| c.welcome_message);

        let mut state = self.state.lock().await;
        let index = match state.index(data.thread.id) {
            Some(index) => index,
            None if mode == ChatMode::MultiThread => {
                tracing::debug!(thread_id = %data.thread.id, "adopting thread from message");
                state.threads.push(ChatThread::from_dto(&data.thread));
                state.threads.len() - 1
            }
            None => {
                tracing::debug!(thread_id = %data.thread.id, "message for unknown thread");
                return;
            }
        };

        let RegistryState {
            threads,
            queued_position,
        } = &mut *state;
        let thread = &mut threads[index];
        if let Some(case) = &data.case {
            thread.contact_id = Some(case.id.clone());
        }

        let message = Message::from(data.message);
        let echoed_welcome = thread.state == ThreadState::Pending
            && message.direction == MessageDirection::ToClient
            && welcome.is_some()
            && message.content.as_text() == welcome.as_deref();
        if message.is_begin_conversation() || echoed_welcome {
            tracing::trace!(message_id = %message.id, "skipping synthetic message");
        } else {
            thread.merge([message]);
        }

        if thread.state == ThreadState::Pending {
            thread.transition(ThreadState::Ready);
        }
        if data.case.is_some() {
            replay_queued_position(queued_position, thread);
        }
        self.publish_thread(thread);
    }

    async fn position_in_queue(&self, data: SetPositionInQueueData) {
        let mut state = self.state.lock().await;
        match state
            .threads
            .iter_mut()
            .find(|t| t.contact_id.as_deref() == Some(data.consumer_contact.as_str()))
        {
            Some(thread) => {
                thread.position_in_queue = Some(data.position_in_queue);
                self.publish_thread(thread);
            }
            None => {
                tracing::debug!(contact_id = %data.consumer_contact, "buffering queue position");
                state.queued_position = Some(QueuedPosition {
                    contact_id: data.consumer_contact,
                    position: data.position_in_queue,
                });
            }
        }
    }

    async fn assignee_changed(&self, data: CaseInboxAssigneeChangedData) {
        let mut state = self.state.lock().await;
        let Some(thread) = state.case_thread_mut(data.case.thread_id, &data.case.id) else {
            tracing::debug!(contact_id = %data.case.id, "assignee change for unknown case");
            return;
        };
        thread.contact_id.get_or_insert_with(|| data.case.id.clone());
        thread.assign(data.inbox_assignee);
        if data.previous_inbox_assignee.is_some() {
            thread.last_assigned_agent = data.previous_inbox_assignee;
        }
        thread.position_in_queue = None;
        self.publish_thread(thread);
    }

    async fn case_status_changed(&self, data: CaseStatusChangedData) {
        let mut state = self.state.lock().await;
        let Some(thread) = state.case_thread_mut(data.case.thread_id, &data.case.id) else {
            tracing::debug!(contact_id = %data.case.id, "status change for unknown case");
            return;
        };
        thread.contact_id.get_or_insert_with(|| data.case.id.clone());
        match data.case.status {
            Some(CaseStatus::Closed) => {
                thread.transition(ThreadState::Closed);
                thread.position_in_queue = None;
            }
            _ if thread.state == ThreadState::Pending => {
                thread.transition(ThreadState::Ready);
            }
            _ => {}
        }
        self.publish_thread(thread);
    }
}

fn replay_queued_position(queued: &mut Option<QueuedPosition>, thread: &mut ChatThread) {
    let Some(position) = queued.take() else { return };
    if thread.contact_id.as_deref() == Some(position.contact_id.as_str()) {
        thread.position_in_queue = Some(position.position);
    } else {
        tracing::debug!(contact_id = %position.contact_id, "discarding queue position for another contact");
    }
}

fn custom_fields_payload(fields: &BTreeMap<String, String>) -> Vec<Value> {
    fields
        .iter()
        .map(|(ident, value)| json!({ "ident": ident, "value": value }))
        .collect()
}
