//! Socket protocol: event tags, the outbound action envelope and inbound frame decoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult, ErrorCode};
use crate::models::CustomerIdentity;

/// `action` value of every chat event frame.
pub const CHAT_WINDOW_ACTION: &str = "chatWindowEvent";

/// Application-level heartbeat frame.
pub const HEARTBEAT_FRAME: &str = r#"{"action":"heartbeat"}"#;

/// Protocol version negotiated through the socket URL.
pub const PROTOCOL_VERSION: &str = "4.74";

/// Check whether a raw text frame is the heartbeat acknowledgement.
///
/// The backend answers with the bare word, some gateways JSON-quote it.
pub fn is_pong(frame: &str) -> bool {
    matches!(frame.trim(), "pong" | "\"pong\"")
}

/// Discriminator of every event that travels over the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Requests
    AuthorizeCustomer,
    ReconnectCustomer,
    RefreshToken,
    SendMessage,
    RecoverThread,
    RecoverLivechat,
    FetchThreadList,
    LoadMoreMessages,
    LoadThreadMetadata,
    ArchiveThread,
    UpdateThread,
    MessageSeenByCustomer,
    EndContact,
    // Travel in both directions
    SenderTypingStarted,
    SenderTypingEnded,
    // Responses and pushes
    CustomerAuthorized,
    TokenRefreshed,
    ThreadRecovered,
    LivechatRecovered,
    ThreadListFetched,
    MoreMessagesLoaded,
    ThreadMetadataLoaded,
    ThreadArchived,
    ThreadUpdated,
    MessageCreated,
    MessageReadChanged,
    CaseInboxAssigneeChanged,
    CaseStatusChanged,
    SetPositionInQueue,
    /// Operation error that no pending request claimed.
    Error,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A request or notification the client sends.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            data,
        }
    }

    /// Wrap the event in the action envelope the gateway expects.
    pub fn envelope<'a>(
        &'a self,
        brand_id: i64,
        channel_id: &'a str,
        customer_identity: Option<&'a CustomerIdentity>,
        access_token: Option<&'a str>,
    ) -> OutboundEnvelope<'a> {
        OutboundEnvelope {
            action: CHAT_WINDOW_ACTION,
            event_id: self.event_id,
            brand_id,
            channel_id,
            customer_identity,
            event_type: self.event_type,
            access_token: access_token.map(|token| TokenRef { token }),
            payload: &self.data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenRef<'a> {
    pub token: &'a str,
}

/// Serialized form of an [`OutboundEvent`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope<'a> {
    pub action: &'static str,
    pub event_id: Uuid,
    pub brand_id: i64,
    pub channel_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_identity: Option<&'a CustomerIdentity>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<TokenRef<'a>>,
    pub payload: &'a Value,
}

impl OutboundEnvelope<'_> {
    pub fn to_frame(&self) -> ChatResult<String> {
        serde_json::to_string(self).map_err(ChatError::from)
    }
}

/// `error` object of an operation failure frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub error_code: ErrorCode,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub error_message: String,
}

impl From<OperationError> for ChatError {
    fn from(e: OperationError) -> Self {
        ChatError::operation(e.error_code, e.transaction_id, e.error_message)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPostback {
    event_type: EventType,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInputData {
    #[serde(default)]
    event_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event_type: Option<EventType>,
    #[serde(default)]
    postback: Option<RawPostback>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    input_data: Option<RawInputData>,
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event_id: Option<String>,
    pub event_type: EventType,
    /// Event id of the request this event answers, when the backend echoes it.
    pub correlation_id: Option<String>,
    pub data: Value,
}

impl InboundEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_id: None,
            event_type,
            correlation_id: None,
            data,
        }
    }

    /// Broadcast form of an operation error nobody was waiting for.
    pub fn from_failure(failure: &OperationFailure) -> Self {
        Self {
            event_id: None,
            event_type: EventType::Error,
            correlation_id: failure.correlation_id.clone(),
            data: serde_json::to_value(&failure.error).unwrap_or(Value::Null),
        }
    }

    /// Decode the typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> ChatResult<T> {
        T::deserialize(&self.data).map_err(|e| {
            ChatError::InvalidData(format!("{} payload: {}", self.event_type, e))
        })
    }

    /// Whether this event answers the request with the given id.
    ///
    /// Events that carry no correlation id answer any request of the matching type.
    pub fn answers(&self, request_id: &Uuid) -> bool {
        match &self.correlation_id {
            Some(id) => correlation_matches(id, request_id),
            None => true,
        }
    }

    /// Thread named by the payload, if any.
    pub fn thread_id(&self) -> Option<Uuid> {
        [
            "/thread/idOnExternalPlatform",
            "/lastMessage/threadIdOnExternalPlatform",
            "/messages/0/threadIdOnExternalPlatform",
            "/message/threadIdOnExternalPlatform",
        ]
        .iter()
        .find_map(|pointer| self.data.pointer(pointer)?.as_str()?.parse().ok())
    }
}

/// An operation error frame with its correlation metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationFailure {
    pub error: OperationError,
    pub correlation_id: Option<String>,
}

impl OperationFailure {
    /// Whether the failure is explicitly tied to the request with the given id.
    pub fn relates_to(&self, request_id: &Uuid) -> bool {
        self.correlation_id
            .as_deref()
            .into_iter()
            .chain(self.error.transaction_id.as_deref())
            .any(|id| correlation_matches(id, request_id))
    }
}

fn correlation_matches(id: &str, request_id: &Uuid) -> bool {
    Uuid::parse_str(id).map(|parsed| parsed == *request_id).unwrap_or(false)
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event(InboundEvent),
    Failure(OperationFailure),
}

/// Decode a text frame.
///
/// Returns `Ok(None)` for well-formed frames this client does not understand
/// (no discriminator or an unknown event type).
pub fn decode_frame(text: &str) -> Result<Option<InboundFrame>, serde_json::Error> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let correlation_id = raw.input_data.and_then(|input| input.event_id);

    if let Some(error) = raw.error {
        return Ok(Some(InboundFrame::Failure(OperationFailure {
            error,
            correlation_id,
        })));
    }

    let (event_type, data) = match (raw.postback, raw.event_type) {
        (Some(postback), _) => (postback.event_type, postback.data),
        (None, Some(event_type)) => (event_type, raw.data.unwrap_or(Value::Null)),
        (None, None) => return Ok(None),
    };

    if event_type == EventType::Unknown {
        return Ok(None);
    }

    Ok(Some(InboundFrame::Event(InboundEvent {
        event_id: raw.event_id,
        event_type,
        correlation_id,
        data,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_id_is_read_from_known_payload_shapes() {
        let id = Uuid::new_v4();
        let metadata = InboundEvent::new(
            EventType::ThreadMetadataLoaded,
            json!({ "lastMessage": { "threadIdOnExternalPlatform": id } }),
        );
        let page = InboundEvent::new(
            EventType::MoreMessagesLoaded,
            json!({ "messages": [{ "threadIdOnExternalPlatform": id }] }),
        );
        let empty = InboundEvent::new(EventType::MoreMessagesLoaded, json!({ "messages": [] }));

        assert_eq!(metadata.thread_id(), Some(id));
        assert_eq!(page.thread_id(), Some(id));
        assert_eq!(empty.thread_id(), None);
    }

    #[test]
    fn envelope_carries_identity_and_payload() {
        let identity = CustomerIdentity::new("cust-1");
        let event = OutboundEvent::new(EventType::SendMessage, json!({ "text": "hi" }));
        let frame = event
            .envelope(1386, "chat_abc", Some(&identity), Some("tok"))
            .to_frame()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["action"], "chatWindowEvent");
        assert_eq!(value["eventId"], event.event_id.to_string());
        assert_eq!(value["brandId"], 1386);
        assert_eq!(value["channelId"], "chat_abc");
        assert_eq!(value["customerIdentity"]["idOnExternalPlatform"], "cust-1");
        assert_eq!(value["eventType"], "SendMessage");
        assert_eq!(value["accessToken"]["token"], "tok");
        assert_eq!(value["payload"]["text"], "hi");
    }

    #[test]
    fn decodes_postback_and_top_level_events() {
        let request = Uuid::new_v4();
        let frame = json!({
            "eventId": "e1",
            "postback": { "eventType": "ThreadRecovered", "data": { "a": 1 } },
            "inputData": { "eventId": request.to_string() }
        })
        .to_string();
        let Some(InboundFrame::Event(event)) = decode_frame(&frame).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.event_type, EventType::ThreadRecovered);
        assert_eq!(event.data["a"], 1);
        assert!(event.answers(&request));
        assert!(!event.answers(&Uuid::new_v4()));

        let frame = json!({ "eventType": "MessageCreated", "data": { "b": 2 } }).to_string();
        let Some(InboundFrame::Event(event)) = decode_frame(&frame).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.event_type, EventType::MessageCreated);
        assert!(event.answers(&Uuid::new_v4()));
    }

    #[test]
    fn decodes_operation_errors() {
        let request = Uuid::new_v4();
        let frame = json!({
            "error": {
                "errorCode": "RecoveringThreadFailed",
                "transactionId": request.to_string(),
                "errorMessage": "no thread"
            }
        })
        .to_string();
        let Some(InboundFrame::Failure(failure)) = decode_frame(&frame).unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(failure.error.error_code, ErrorCode::RecoveringThreadFailed);
        assert!(failure.relates_to(&request));
        assert!(!failure.relates_to(&Uuid::new_v4()));
    }

    #[test]
    fn unknown_and_malformed_frames() {
        let frame = json!({ "eventType": "SomethingElse" }).to_string();
        assert_eq!(decode_frame(&frame).unwrap(), None);
        assert_eq!(decode_frame("{}").unwrap(), None);
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn pong_detection() {
        assert!(is_pong("pong"));
        assert!(is_pong("\"pong\"\n"));
        assert!(!is_pong(r#"{"pong":true}"#));
    }
}
