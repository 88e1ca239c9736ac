//! Payload models for socket events and the HTTP collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default token lifetime when the backend omits `expiresIn`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 180;

fn default_true() -> bool {
    true
}

fn default_token_lifetime() -> i64 {
    DEFAULT_TOKEN_LIFETIME_SECS
}

// --- Identity ---

/// End-user identity sent with every action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerIdentity {
    #[serde(rename = "idOnExternalPlatform")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl CustomerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first_name: None,
            last_name: None,
        }
    }

    /// A fresh identity with a random id.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_bot_user: bool,
}

impl Agent {
    pub fn full_name(&self) -> String {
        match &self.nickname {
            Some(nickname) if !nickname.is_empty() => nickname.clone(),
            _ => format!("{} {}", self.first_name, self.last_name).trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenDto {
    pub token: String,
    #[serde(default = "default_token_lifetime")]
    pub expires_in: i64,
}

// --- Threads and messages ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDto {
    #[serde(rename = "idOnExternalPlatform")]
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default = "default_true")]
    pub can_add_more_messages: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    New,
    Open,
    Pending,
    Escalated,
    Resolved,
    Closed,
    Trashed,
    #[serde(other)]
    Unknown,
}

/// Backend case (contact) attached to a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDto {
    pub id: String,
    #[serde(default, rename = "threadIdOnExternalPlatform")]
    pub thread_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<CaseStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    /// Sent by the end user.
    #[serde(rename = "inbound")]
    ToAgent,
    /// Sent by an agent or bot.
    #[serde(rename = "outbound")]
    ToClient,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatistics {
    #[serde(default)]
    pub seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl UserStatistics {
    /// Combine two observations, keeping every stamp either side knows.
    pub fn merged(&self, other: &UserStatistics) -> UserStatistics {
        UserStatistics {
            seen_at: self.seen_at.or(other.seen_at),
            read_at: self.read_at.or(other.read_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub friendly_name: String,
    pub mime_type: String,
}

/// Raw `messageContent`; the client maps it onto typed content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDto {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    #[serde(rename = "idOnExternalPlatform")]
    pub id: Uuid,
    #[serde(rename = "threadIdOnExternalPlatform")]
    pub thread_id: Uuid,
    pub message_content: ContentDto,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub direction: MessageDirection,
    #[serde(default)]
    pub user_statistics: UserStatistics,
    #[serde(default)]
    pub author_user: Option<Agent>,
    #[serde(default)]
    pub author_end_user_identity: Option<CustomerIdentity>,
}

// --- Event payloads ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerAuthorizedData {
    pub consumer_identity: CustomerIdentity,
    #[serde(default)]
    pub access_token: Option<AccessTokenDto>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshedData {
    pub access_token: AccessTokenDto,
}

/// Payload of `ThreadRecovered` and `LivechatRecovered`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecoveredData {
    pub thread: ThreadDto,
    #[serde(default)]
    pub messages: Vec<MessageDto>,
    #[serde(default)]
    pub messages_scroll_token: String,
    #[serde(default)]
    pub consumer_contact: Option<ContactDto>,
    #[serde(default)]
    pub inbox_assignee: Option<Agent>,
    #[serde(default)]
    pub previous_inbox_assignee: Option<Agent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadListFetchedData {
    #[serde(default)]
    pub threads: Vec<ThreadDto>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoreMessagesLoadedData {
    #[serde(default)]
    pub messages: Vec<MessageDto>,
    #[serde(default)]
    pub scroll_token: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMetadataLoadedData {
    #[serde(default)]
    pub owner_assignee: Option<Agent>,
    #[serde(default)]
    pub last_message: Option<MessageDto>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreatedData {
    pub thread: ThreadDto,
    #[serde(default)]
    pub case: Option<ContactDto>,
    pub message: MessageDto,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadChangedData {
    pub message: MessageDto,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseInboxAssigneeChangedData {
    pub case: ContactDto,
    #[serde(default)]
    pub inbox_assignee: Option<Agent>,
    #[serde(default)]
    pub previous_inbox_assignee: Option<Agent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseStatusChangedData {
    pub case: ContactDto,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPositionInQueueData {
    /// Contact id the position belongs to.
    pub consumer_contact: String,
    pub position_in_queue: u32,
    #[serde(default)]
    pub is_agent_available: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    pub thread: ThreadDto,
    #[serde(default)]
    pub user: Option<Agent>,
}

// --- Channel configuration ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatMode {
    SingleThread,
    MultiThread,
    LiveChat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedFileType {
    pub mime_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRestrictions {
    /// Maximum attachment size in megabytes.
    pub allowed_file_size: u32,
    #[serde(default)]
    pub allowed_file_types: Vec<AllowedFileType>,
    #[serde(default = "default_true")]
    pub is_attachments_enabled: bool,
}

impl Default for FileRestrictions {
    fn default() -> Self {
        Self {
            allowed_file_size: 40,
            allowed_file_types: Vec::new(),
            is_attachments_enabled: true,
        }
    }
}

impl FileRestrictions {
    pub fn max_bytes(&self) -> u64 {
        u64::from(self.allowed_file_size) * 1024 * 1024
    }

    /// Match a MIME type against the allow list. `image/*` style wildcards are
    /// honoured and an empty list allows everything.
    pub fn allows(&self, mime_type: &str) -> bool {
        if self.allowed_file_types.is_empty() {
            return true;
        }
        self.allowed_file_types.iter().any(|allowed| {
            match allowed.mime_type.strip_suffix("/*") {
                Some(prefix) => mime_type
                    .split('/')
                    .next()
                    .is_some_and(|kind| kind.eq_ignore_ascii_case(prefix)),
                None => allowed.mime_type.eq_ignore_ascii_case(mime_type),
            }
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSettings {
    #[serde(default)]
    pub has_multiple_threads_per_end_user: bool,
    #[serde(default)]
    pub is_proactive_chat_enabled: bool,
    #[serde(default)]
    pub is_live_chat: bool,
    #[serde(default)]
    pub file_restrictions: FileRestrictions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreChatField {
    pub ident: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub is_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreChatSurvey {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub custom_fields: Vec<PreChatField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelFeatures {
    /// Propagate live chat recovery failures instead of starting over.
    #[serde(default)]
    pub recover_livechat_fallback_disabled: bool,
}

/// Channel configuration returned by `GET /1.0/brand/{brandId}/channel/{channelId}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfiguration {
    #[serde(default)]
    pub settings: ChannelSettings,
    #[serde(default)]
    pub is_authorization_enabled: bool,
    #[serde(default)]
    pub prechat_survey: Option<PreChatSurvey>,
    #[serde(default)]
    pub welcome_message: Option<String>,
    #[serde(default)]
    pub features: ChannelFeatures,
}

impl ChannelConfiguration {
    pub fn chat_mode(&self) -> ChatMode {
        if self.settings.is_live_chat {
            ChatMode::LiveChat
        } else if self.settings.has_multiple_threads_per_end_user {
            ChatMode::MultiThread
        } else {
            ChatMode::SingleThread
        }
    }

    pub fn requires_prechat_survey(&self) -> bool {
        self.prechat_survey
            .as_ref()
            .is_some_and(|survey| !survey.custom_fields.is_empty())
    }

    pub fn required_prechat_fields(&self) -> impl Iterator<Item = &str> {
        self.prechat_survey
            .iter()
            .flat_map(|survey| survey.custom_fields.iter())
            .filter(|field| field.is_required)
            .map(|field| field.ident.as_str())
    }
}

// --- Attachment upload ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUploadRequest {
    /// Base64 encoded file content.
    pub content: String,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttachmentUploadResponse {
    #[serde(rename_all = "camelCase")]
    Uploaded { file_url: String },
    #[serde(rename_all = "camelCase")]
    Rejected {
        #[serde(default)]
        error_code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}
