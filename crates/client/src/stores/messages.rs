//! Threads and messages as the client sees them.
//!
//! Messages only enter a thread through [`ChatThread::merge`], which is a set union
//! keyed by message id and keeps the list sorted by `created_at`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use palaver_shared::{
    Agent, Attachment, ContentDto, CustomerIdentity, MessageDirection, MessageDto, ThreadDto,
    UserStatistics,
};
use serde_json::Value;
use uuid::Uuid;

/// Text of the hidden message that opens a live chat case.
pub const BEGIN_CONVERSATION_TEXT: &str = "Begin conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created locally, not yet known to the backend.
    Pending,
    Ready,
    /// Metadata fetched.
    Loaded,
    /// Terminal.
    Closed,
}

impl ThreadState {
    pub fn can_transition_to(self, next: ThreadState) -> bool {
        self != ThreadState::Closed || next == ThreadState::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Seen,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending | MessageStatus::Failed => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Seen => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text {
        text: String,
        postback: Option<String>,
    },
    RichLink {
        title: String,
        url: String,
        image_url: Option<String>,
    },
    QuickReplies {
        text: String,
        actions: Vec<String>,
    },
    ListPicker {
        title: String,
        text: String,
        actions: Vec<String>,
    },
    Plugin(Value),
    Unknown {
        kind: String,
        fallback_text: Option<String>,
    },
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn action_titles(payload: &Value, field: &str) -> Vec<String> {
    payload
        .get("actions")
        .and_then(Value::as_array)
        .map(|actions| {
            actions
                .iter()
                .filter_map(|action| action.get(field).and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text {
            text: text.into(),
            postback: None,
        }
    }

    pub fn from_dto(dto: &ContentDto) -> Self {
        let payload = &dto.payload;
        let owned = |s: Option<&str>| s.unwrap_or_default().to_string();
        match dto.kind.to_ascii_uppercase().as_str() {
            "TEXT" => MessageContent::Text {
                text: owned(str_at(payload, "/text")),
                postback: str_at(payload, "/postback").map(str::to_string),
            },
            "RICH_LINK" => MessageContent::RichLink {
                title: owned(str_at(payload, "/title")),
                url: owned(str_at(payload, "/url")),
                image_url: str_at(payload, "/media/url").map(str::to_string),
            },
            "QUICK_REPLIES" => MessageContent::QuickReplies {
                text: owned(str_at(payload, "/text/content").or_else(|| str_at(payload, "/text"))),
                actions: action_titles(payload, "text"),
            },
            "LIST_PICKER" => MessageContent::ListPicker {
                title: owned(str_at(payload, "/title/content").or_else(|| str_at(payload, "/title"))),
                text: owned(str_at(payload, "/text/content").or_else(|| str_at(payload, "/text"))),
                actions: action_titles(payload, "title"),
            },
            "PLUGIN" => MessageContent::Plugin(payload.clone()),
            _ => MessageContent::Unknown {
                kind: dto.kind.clone(),
                fallback_text: dto.fallback_text.clone(),
            },
        }
    }

    /// Plain text if this content has one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text, .. } | MessageContent::QuickReplies { text, .. } => Some(text),
            MessageContent::Unknown { fallback_text, .. } => fallback_text.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageAuthor {
    Agent(Agent),
    Customer(CustomerIdentity),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
    pub direction: MessageDirection,
    pub status: MessageStatus,
    pub author: Option<MessageAuthor>,
    pub user_statistics: UserStatistics,
}

impl Message {
    /// Optimistic copy of a message the customer is sending.
    pub fn outgoing(
        id: Uuid,
        thread_id: Uuid,
        content: MessageContent,
        attachments: Vec<Attachment>,
        customer: Option<CustomerIdentity>,
    ) -> Self {
        Self {
            id,
            thread_id,
            content,
            created_at: Utc::now(),
            attachments,
            direction: MessageDirection::ToAgent,
            status: MessageStatus::Sending,
            author: customer.map(MessageAuthor::Customer),
            user_statistics: UserStatistics::default(),
        }
    }

    /// Locally injected welcome message.
    pub fn welcome(thread_id: Uuid, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            content: MessageContent::text(text),
            created_at: Utc::now(),
            attachments: Vec::new(),
            direction: MessageDirection::ToClient,
            status: MessageStatus::Delivered,
            author: None,
            user_statistics: UserStatistics::default(),
        }
    }

    pub fn is_begin_conversation(&self) -> bool {
        self.direction == MessageDirection::ToAgent
            && self.content.as_text() == Some(BEGIN_CONVERSATION_TEXT)
    }

    /// Move the status forward; lower ranked statuses never replace higher ones.
    pub fn advance_status(&mut self, status: MessageStatus) {
        if status.rank() >= self.status.rank() {
            self.status = status;
        }
    }

    /// Roll back an optimistic send.
    pub fn fail(&mut self) {
        if self.status == MessageStatus::Sending {
            self.status = MessageStatus::Failed;
        }
    }

    pub fn is_read(&self) -> bool {
        self.user_statistics.read_at.is_some()
    }
}

impl From<MessageDto> for Message {
    fn from(dto: MessageDto) -> Self {
        let status = if dto.user_statistics.seen_at.is_some() || dto.user_statistics.read_at.is_some() {
            MessageStatus::Seen
        } else {
            MessageStatus::Delivered
        };
        let author = dto
            .author_user
            .map(MessageAuthor::Agent)
            .or_else(|| dto.author_end_user_identity.map(MessageAuthor::Customer));
        Self {
            id: dto.id,
            thread_id: dto.thread_id,
            content: MessageContent::from_dto(&dto.message_content),
            created_at: dto.created_at,
            attachments: dto.attachments,
            direction: dto.direction,
            status,
            author,
            user_statistics: dto.user_statistics,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatThread {
    pub id: Uuid,
    pub state: ThreadState,
    /// Sorted by `created_at`, equal stamps keep arrival order.
    pub messages: Vec<Message>,
    /// Empty once there is no older history.
    pub scroll_token: String,
    pub assigned_agent: Option<Agent>,
    pub last_assigned_agent: Option<Agent>,
    pub position_in_queue: Option<u32>,
    pub contact_id: Option<String>,
    pub name: Option<String>,
    /// Pre-chat answers, sent with the first message.
    pub custom_fields: BTreeMap<String, String>,
}

impl ChatThread {
    pub fn pending(id: Uuid, custom_fields: BTreeMap<String, String>) -> Self {
        Self {
            id,
            state: ThreadState::Pending,
            messages: Vec::new(),
            scroll_token: String::new(),
            assigned_agent: None,
            last_assigned_agent: None,
            position_in_queue: None,
            contact_id: None,
            name: None,
            custom_fields,
        }
    }

    pub fn from_dto(dto: &ThreadDto) -> Self {
        let mut thread = Self::pending(dto.id, BTreeMap::new());
        thread.apply_dto(dto);
        thread
    }

    /// Refresh name and state from a backend thread record.
    pub fn apply_dto(&mut self, dto: &ThreadDto) {
        if dto.thread_name.is_some() {
            self.name = dto.thread_name.clone();
        }
        if !dto.can_add_more_messages {
            self.transition(ThreadState::Closed);
        } else if self.state == ThreadState::Pending {
            self.transition(ThreadState::Ready);
        }
    }

    /// Returns `false` when the transition is not allowed and was dropped.
    pub fn transition(&mut self, next: ThreadState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(thread_id = %self.id, from = ?self.state, to = ?next, "suppressed state transition");
            return false;
        }
        self.state = next;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state == ThreadState::Closed
    }

    pub fn has_more_history(&self) -> bool {
        !self.scroll_token.is_empty()
    }

    pub fn oldest_message(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Whether the customer already sent anything in this thread.
    pub fn has_customer_messages(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.direction == MessageDirection::ToAgent)
    }

    /// Union `incoming` into the thread. Returns how many messages were new.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Message>) -> usize {
        let mut added = 0;
        for message in incoming {
            if let Some(existing) = self.message_mut(message.id) {
                existing.advance_status(message.status);
                existing.user_statistics = message.user_statistics.merged(&existing.user_statistics);
                continue;
            }
            let at = self
                .messages
                .partition_point(|m| m.created_at <= message.created_at);
            self.messages.insert(at, message);
            added += 1;
        }
        added
    }

    pub fn assign(&mut self, agent: Option<Agent>) {
        if self.assigned_agent.is_some() && self.assigned_agent != agent {
            self.last_assigned_agent = self.assigned_agent.take();
        }
        self.assigned_agent = agent;
    }
}
