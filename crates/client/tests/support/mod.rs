#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::StreamExt;
use palaver_client::shared::{ChannelConfiguration, ChannelSettings, ChatError, ChatResult};
use palaver_client::{AttachmentUpload, ChannelApi, ClientConfig, Connector, ReconnectConfig, Socket};
use serde_json::{json, Value};
use tokio::sync::Notify;
use url::Url;
use uuid::Uuid;

pub type Responder = dyn Fn(&Value) -> Vec<Value> + Send + Sync;

struct Live {
    incoming: UnboundedSender<ChatResult<String>>,
    close_outgoing: Arc<Notify>,
}

/// In-memory gateway: every frame the client sends is recorded and handed to a
/// responder whose replies are pushed back on the same socket.
pub struct MockConnector {
    responder: Arc<Responder>,
    opens: AtomicUsize,
    refuse: AtomicBool,
    answer_heartbeats: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<Value>>>,
    live: Mutex<Option<Live>>,
}

impl MockConnector {
    pub fn new(responder: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Arc::new(responder),
            opens: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            answer_heartbeats: Arc::new(AtomicBool::new(true)),
            received: Arc::new(Mutex::new(Vec::new())),
            live: Mutex::new(None),
        })
    }

    pub fn silent() -> Arc<Self> {
        Self::new(|_| Vec::new())
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn answer_heartbeats(&self, answer: bool) {
        self.answer_heartbeats.store(answer, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Push a frame to the client on the live socket.
    pub fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        if let Some(live) = self.live.lock().unwrap().as_ref() {
            let _ = live.incoming.unbounded_send(Ok(text.to_string()));
        }
    }

    /// Kill the live socket from the server side.
    pub fn kill(&self) {
        if let Some(live) = self.live.lock().unwrap().take() {
            let _ = live.incoming.unbounded_send(Err(ChatError::ConnectionClosed));
        }
    }

    /// Stop reading client frames; later sends fail.
    pub fn close_outgoing(&self) {
        if let Some(live) = self.live.lock().unwrap().as_ref() {
            live.close_outgoing.notify_one();
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_types(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|frame| event_type(frame).to_string())
            .collect()
    }

    pub fn count(&self, event_type_name: &str) -> usize {
        self.received_types()
            .iter()
            .filter(|t| t.as_str() == event_type_name)
            .count()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _url: &Url) -> ChatResult<Socket> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChatError::WebSocketConnectionFailure("connection refused".into()));
        }

        let (outgoing, mut outgoing_rx) = unbounded::<String>();
        let (incoming_tx, incoming) = unbounded::<ChatResult<String>>();
        let close_outgoing = Arc::new(Notify::new());
        *self.live.lock().unwrap() = Some(Live {
            incoming: incoming_tx.clone(),
            close_outgoing: close_outgoing.clone(),
        });

        let responder = self.responder.clone();
        let received = self.received.clone();
        let answer_heartbeats = self.answer_heartbeats.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = outgoing_rx.next() => frame,
                    _ = close_outgoing.notified() => return,
                };
                let Some(frame) = frame else { return };
                let Ok(value) = serde_json::from_str::<Value>(&frame) else { continue };
                if value["action"] == "heartbeat" {
                    if answer_heartbeats.load(Ordering::SeqCst) {
                        let _ = incoming_tx.unbounded_send(Ok("pong".to_string()));
                    }
                    continue;
                }
                received.lock().unwrap().push(value.clone());
                for reply in responder(&value) {
                    let _ = incoming_tx.unbounded_send(Ok(reply.to_string()));
                }
            }
        });

        Ok(Socket { outgoing, incoming })
    }
}

/// HTTP collaborator serving a fixed channel configuration.
pub struct MockApi {
    pub configuration: ChannelConfiguration,
    pub uploads: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn new(configuration: ChannelConfiguration) -> Arc<Self> {
        Arc::new(Self {
            configuration,
            uploads: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChannelApi for MockApi {
    async fn channel_configuration(&self, _brand_id: i64, _channel_id: &str) -> ChatResult<ChannelConfiguration> {
        Ok(self.configuration.clone())
    }

    async fn upload_attachment(&self, _brand_id: i64, _channel_id: &str, upload: &AttachmentUpload) -> ChatResult<String> {
        self.uploads.lock().unwrap().push(upload.file_name.clone());
        Ok(format!("https://cdn.test/{}", upload.file_name))
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .socket_url("wss://gateway.test/ws")
        .event_timeout(Duration::from_secs(2))
        .reconnect(ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
        })
}

pub fn single_thread() -> ChannelConfiguration {
    ChannelConfiguration::default()
}

pub fn multi_thread() -> ChannelConfiguration {
    ChannelConfiguration {
        settings: ChannelSettings {
            has_multiple_threads_per_end_user: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn live_chat() -> ChannelConfiguration {
    ChannelConfiguration {
        settings: ChannelSettings {
            is_live_chat: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

// --- Frame builders ---

pub fn event_type(frame: &Value) -> &str {
    frame["eventType"].as_str().unwrap_or_default()
}

/// Response correlated to `request`.
pub fn reply(request: &Value, event_type: &str, data: Value) -> Value {
    json!({
        "eventId": Uuid::new_v4().to_string(),
        "postback": { "eventType": event_type, "data": data },
        "inputData": { "eventId": request["eventId"] }
    })
}

/// Server push with no correlation.
pub fn push(event_type: &str, data: Value) -> Value {
    json!({
        "eventId": Uuid::new_v4().to_string(),
        "eventType": event_type,
        "data": data
    })
}

pub fn failure(request: &Value, code: &str) -> Value {
    json!({
        "error": {
            "errorCode": code,
            "transactionId": request["eventId"],
            "errorMessage": "mock failure"
        }
    })
}

pub fn authorized(request: &Value) -> Value {
    reply(
        request,
        "CustomerAuthorized",
        json!({
            "consumerIdentity": { "idOnExternalPlatform": "cust-1" },
            "accessToken": { "token": "token-1", "expiresIn": 3600 }
        }),
    )
}

pub fn thread_json(id: Uuid) -> Value {
    json!({ "idOnExternalPlatform": id, "canAddMoreMessages": true })
}

pub fn message_json(thread_id: Uuid, text: &str, direction: &str, created_at: DateTime<Utc>) -> Value {
    message_json_with_id(Uuid::new_v4(), thread_id, text, direction, created_at)
}

pub fn message_json_with_id(id: Uuid, thread_id: Uuid, text: &str, direction: &str, created_at: DateTime<Utc>) -> Value {
    json!({
        "idOnExternalPlatform": id,
        "threadIdOnExternalPlatform": thread_id,
        "messageContent": { "type": "TEXT", "payload": { "text": text } },
        "createdAt": created_at,
        "attachments": [],
        "direction": direction,
        "userStatistics": { "seenAt": null, "readAt": null }
    })
}

pub fn recovered(request: &Value, thread_id: Uuid, messages: Vec<Value>, scroll_token: &str) -> Value {
    reply(
        request,
        "ThreadRecovered",
        json!({
            "thread": thread_json(thread_id),
            "messages": messages,
            "messagesScrollToken": scroll_token,
            "consumerContact": { "id": "case-1", "status": "open" }
        }),
    )
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
