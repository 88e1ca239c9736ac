//! HTTP collaborator: channel configuration and attachment upload.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use palaver_shared::{
    AttachmentError, AttachmentUploadRequest, AttachmentUploadResponse, ChannelConfiguration,
    ChatError, ChatResult, FileRestrictions,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A file the customer wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl AttachmentUpload {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Read a file from disk.
    pub async fn from_path(path: impl AsRef<Path>, mime_type: impl Into<String>) -> ChatResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|_| AttachmentError::FileNotFound(path.to_path_buf()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self::new(file_name, mime_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Check an upload against the channel's file restrictions.
pub fn validate_attachment(restrictions: &FileRestrictions, upload: &AttachmentUpload) -> Result<(), AttachmentError> {
    if !restrictions.is_attachments_enabled {
        return Err(AttachmentError::Disabled);
    }
    if upload.size() > restrictions.max_bytes() {
        return Err(AttachmentError::FileTooLarge {
            size: upload.size(),
            limit: restrictions.max_bytes(),
        });
    }
    if !restrictions.allows(&upload.mime_type) {
        return Err(AttachmentError::FileTypeNotAllowed(upload.mime_type.clone()));
    }
    Ok(())
}

/// The HTTP calls the chat core depends on.
#[async_trait]
pub trait ChannelApi: Send + Sync {
    async fn channel_configuration(&self, brand_id: i64, channel_id: &str) -> ChatResult<ChannelConfiguration>;

    /// Upload a file and return its public URL.
    async fn upload_attachment(&self, brand_id: i64, channel_id: &str, upload: &AttachmentUpload) -> ChatResult<String>;
}

/// `reqwest` implementation of [`ChannelApi`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn channel_path(brand_id: i64, channel_id: &str) -> String {
        format!("1.0/brand/{}/channel/{}", brand_id, urlencoding::encode(channel_id))
    }

    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> ChatResult<TRes> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ChatError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ChatError::Server { status, body: text });
        }

        serde_json::from_str(&text).map_err(|e| ChatError::InvalidData(e.to_string()))
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(&self, path: &str, body: &TReq) -> ChatResult<TRes> {
        let url = self.url(path);
        tracing::debug!(%url, "POST");
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp.text().await.map_err(|e| ChatError::Network(e.to_string()))?;

        if !is_success {
            return Err(ChatError::Server { status, body: text });
        }

        if text.is_empty() {
            serde_json::from_str("null").map_err(|e| ChatError::InvalidData(e.to_string()))
        } else {
            serde_json::from_str(&text).map_err(|e| ChatError::InvalidData(e.to_string()))
        }
    }
}

#[async_trait]
impl ChannelApi for ApiClient {
    async fn channel_configuration(&self, brand_id: i64, channel_id: &str) -> ChatResult<ChannelConfiguration> {
        self.get_json(&Self::channel_path(brand_id, channel_id)).await
    }

    async fn upload_attachment(&self, brand_id: i64, channel_id: &str, upload: &AttachmentUpload) -> ChatResult<String> {
        let request = AttachmentUploadRequest {
            content: base64::engine::general_purpose::STANDARD.encode(&upload.data),
            file_name: upload.file_name.clone(),
            mime_type: upload.mime_type.clone(),
        };
        let path = format!("{}/attachment", Self::channel_path(brand_id, channel_id));
        match self.post_json::<_, AttachmentUploadResponse>(&path, &request).await {
            Ok(AttachmentUploadResponse::Uploaded { file_url }) => Ok(file_url),
            Ok(AttachmentUploadResponse::Rejected { error_code, message }) => {
                let reason = message.or(error_code).unwrap_or_else(|| "rejected".to_string());
                Err(AttachmentError::UploadFailed(reason).into())
            }
            Err(ChatError::Server { status, body }) => {
                Err(AttachmentError::UploadFailed(format!("HTTP {status}: {body}")).into())
            }
            Err(other) => Err(other),
        }
    }
}
