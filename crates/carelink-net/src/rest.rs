//! REST fallback client.
//!
//! Carries every chat operation the socket channel cannot or should not:
//! bulk/paginated reads, admin listing and statistics, conversation-creating
//! sends, and all file-bearing sends (the event channel is message-oriented
//! and never carries binary payloads).

use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use carelink_shared::constants::API_BASE_PATH;
use carelink_shared::protocol::SendMessagePayload;
use carelink_shared::{
    AttachmentUpload, ChatError, ChatFilters, ChatId, ChatStats, ChatStatus, Conversation,
    FacilityId, Message, Priority, Result,
};

/// Typed client for the chat REST API.
#[derive(Debug, Clone)]
pub struct ChatApi {
    http: reqwest::Client,
    base_url: Url,
    auth_token: String,
}

/// Server result of a message send: the (possibly newly created) durable
/// conversation id plus the canonical message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub chat_id: ChatId,
    pub message: Message,
}

/// One page of conversation history, newest page first.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ChatListResponse {
    chats: Vec<Conversation>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    chat: Conversation,
}

impl ChatApi {
    pub fn new(base_url: Url, auth_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            auth_token: auth_token.into(),
        }
    }

    /// List conversations for the admin dashboard, optionally filtered.
    pub async fn admin_chats(&self, filters: &ChatFilters) -> Result<Vec<Conversation>> {
        let request = self
            .http
            .get(self.endpoint("/admin/chats"))
            .query(&filters.to_query());
        let response: ChatListResponse = self.execute(request).await?;
        Ok(response.chats)
    }

    /// Dashboard counters.
    pub async fn admin_chat_stats(&self) -> Result<ChatStats> {
        self.execute(self.http.get(self.endpoint("/admin/chats/stats")))
            .await
    }

    /// Fetch (or have the server create) the conversation for one facility.
    pub async fn admin_chat(&self, facility: &FacilityId) -> Result<Conversation> {
        let request = self
            .http
            .get(self.endpoint(&format!("/admin/chats/{facility}")));
        let response: ChatResponse = self.execute(request).await?;
        Ok(response.chat)
    }

    /// Update conversation status and priority (admin only).
    pub async fn update_status(
        &self,
        chat_id: &ChatId,
        status: ChatStatus,
        priority: Priority,
    ) -> Result<Conversation> {
        let request = self
            .http
            .put(self.endpoint(&format!("/admin/chats/{chat_id}/status")))
            .json(&serde_json::json!({ "status": status, "priority": priority }));
        let response: ChatResponse = self.execute(request).await?;
        Ok(response.chat)
    }

    /// Fetch (or have the server create) the calling facility's conversation.
    pub async fn facility_chat(&self) -> Result<Conversation> {
        let response: ChatResponse = self
            .execute(self.http.get(self.endpoint("/facility/chat")))
            .await?;
        Ok(response.chat)
    }

    /// Send a text message. Also the conversation-creating path: when the
    /// payload carries a facility id and no chat id, the server creates the
    /// conversation and returns its durable id.
    pub async fn send_message(&self, payload: &SendMessagePayload) -> Result<SendOutcome> {
        let request = self.http.post(self.endpoint("/message")).json(payload);
        self.execute(request).await
    }

    /// Send a message carrying a file, as multipart form data.
    pub async fn send_file_message(
        &self,
        chat_id: Option<&ChatId>,
        facility_id: Option<&FacilityId>,
        body: &str,
        upload: &AttachmentUpload,
    ) -> Result<SendOutcome> {
        let message_type = if upload.is_image() { "image" } else { "file" };
        let part = multipart::Part::bytes(upload.bytes.to_vec())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime_type)
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let mut form = multipart::Form::new()
            .text("message", body.to_string())
            .text("messageType", message_type)
            .part("file", part);
        if let Some(id) = chat_id {
            form = form.text("chatId", id.to_string());
        }
        if let Some(facility) = facility_id {
            form = form.text("facilityId", facility.to_string());
        }

        debug!(file = %upload.file_name, size = upload.bytes.len(), "Uploading file message");
        let request = self.http.post(self.endpoint("/message")).multipart(form);
        self.execute(request).await
    }

    /// Read receipt for a whole conversation.
    pub async fn mark_read(&self, chat_id: &ChatId) -> Result<()> {
        let request = self
            .http
            .put(self.endpoint(&format!("/chats/{chat_id}/read")));
        self.execute_unit(request).await
    }

    /// Paginated history (page 0 is the most recent).
    pub async fn messages(&self, chat_id: &ChatId, page: u32, limit: u32) -> Result<MessagesPage> {
        let request = self
            .http
            .get(self.endpoint(&format!("/chats/{chat_id}/messages")))
            .query(&[("page", page.to_string()), ("limit", limit.to_string())]);
        self.execute(request).await
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            API_BASE_PATH,
            path
        )
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(normalize_error)?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(ChatError::Request {
                status: Some(status.as_u16()),
                message: error_message(status.as_u16(), &body),
            });
        }
        response.json().await.map_err(normalize_error)
    }

    async fn execute_unit(&self, request: reqwest::RequestBuilder) -> Result<()> {
        let response = request
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(normalize_error)?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(ChatError::Request {
                status: Some(status.as_u16()),
                message: error_message(status.as_u16(), &body),
            });
        }
        Ok(())
    }
}

/// Map reqwest failures onto the error taxonomy: timeouts become
/// [`ChatError::Timeout`], everything else a status-less request error
/// (network failure, no response).
fn normalize_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        return ChatError::Timeout;
    }
    ChatError::Request {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

/// Pull a human-readable message out of an error response body.
fn error_message(status: u16, body: &Value) -> String {
    body.get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("HTTP {status}"))
}
