//! Named socket events exchanged with the messaging backend.
//!
//! Frames on the wire are JSON envelopes: `{"event": <name>, "data": <payload>}`,
//! with exactly one payload type per event name. [`ClientEvent`] covers the
//! client→server direction, [`ServerEvent`] the server→client direction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChatId, ChatStatus, FacilityId, Message, Priority, Role};

// Client → server event names.
pub const EVENT_SEND_MESSAGE: &str = "send-message";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_MARK_READ: &str = "mark-read";
pub const EVENT_UPDATE_CHAT_STATUS: &str = "update-chat-status";
pub const EVENT_JOIN_CHAT: &str = "join-chat";
pub const EVENT_LEAVE_CHAT: &str = "leave-chat";

// Server → client event names.
pub const EVENT_NEW_MESSAGE: &str = "new-message";
pub const EVENT_MESSAGE_SENT: &str = "message-sent";
pub const EVENT_ADMIN_TYPING: &str = "admin-typing";
pub const EVENT_FACILITY_TYPING: &str = "facility-typing";
pub const EVENT_MARKED_READ: &str = "marked-read";
pub const EVENT_MESSAGES_READ: &str = "messages-read";
pub const EVENT_CHAT_STATUS_UPDATED: &str = "chat-status-updated";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    /// Durable conversation id; `None` only on the facility side before the
    /// conversation exists (the server resolves by facility instead).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facility_id: Option<FacilityId>,
    pub message: String,
    pub message_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: ChatId,
    pub is_typing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facility_id: Option<FacilityId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChatStatusPayload {
    pub chat_id: ChatId,
    pub status: ChatStatus,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub chat_id: ChatId,
    pub message: Message,
    #[serde(default)]
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentPayload {
    pub success: bool,
    pub chat_id: ChatId,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminTypingPayload {
    pub chat_id: ChatId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityTypingPayload {
    pub chat_id: ChatId,
    pub is_typing: bool,
    pub facility_id: FacilityId,
    #[serde(default)]
    pub facility_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    #[serde(default)]
    pub success: Option<bool>,
    pub chat_id: ChatId,
    pub read_by: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStatusUpdatedPayload {
    pub chat_id: ChatId,
    pub status: ChatStatus,
    pub priority: Priority,
    #[serde(default)]
    pub assigned_to: Option<String>,
}

/// Events emitted by this client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    SendMessage(SendMessagePayload),
    Typing(TypingPayload),
    MarkRead(MarkReadPayload),
    UpdateChatStatus(UpdateChatStatusPayload),
    JoinChat(ChatId),
    LeaveChat(ChatId),
}

impl ClientEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage(_) => EVENT_SEND_MESSAGE,
            ClientEvent::Typing(_) => EVENT_TYPING,
            ClientEvent::MarkRead(_) => EVENT_MARK_READ,
            ClientEvent::UpdateChatStatus(_) => EVENT_UPDATE_CHAT_STATUS,
            ClientEvent::JoinChat(_) => EVENT_JOIN_CHAT,
            ClientEvent::LeaveChat(_) => EVENT_LEAVE_CHAT,
        }
    }

    /// Encode as a wire frame.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        let data = match self {
            ClientEvent::SendMessage(p) => serde_json::to_value(p)?,
            ClientEvent::Typing(p) => serde_json::to_value(p)?,
            ClientEvent::MarkRead(p) => serde_json::to_value(p)?,
            ClientEvent::UpdateChatStatus(p) => serde_json::to_value(p)?,
            ClientEvent::JoinChat(id) | ClientEvent::LeaveChat(id) => {
                serde_json::to_value(RoomPayload {
                    chat_id: id.clone(),
                })?
            }
        };
        serde_json::to_string(&Envelope {
            event: self.event_name().to_string(),
            data,
        })
    }
}

/// Events received from the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    NewMessage(NewMessagePayload),
    MessageSent(MessageSentPayload),
    AdminTyping(AdminTypingPayload),
    FacilityTyping(FacilityTypingPayload),
    MarkedRead(ReadPayload),
    MessagesRead(ReadPayload),
    ChatStatusUpdated(ChatStatusUpdatedPayload),
}

impl ServerEvent {
    /// Decode a wire frame. Unknown event names decode to `Ok(None)` so new
    /// server events never break older clients.
    pub fn from_frame(text: &str) -> serde_json::Result<Option<Self>> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let event = match envelope.event.as_str() {
            EVENT_NEW_MESSAGE => {
                ServerEvent::NewMessage(serde_json::from_value(envelope.data)?)
            }
            EVENT_MESSAGE_SENT => {
                ServerEvent::MessageSent(serde_json::from_value(envelope.data)?)
            }
            EVENT_ADMIN_TYPING => {
                ServerEvent::AdminTyping(serde_json::from_value(envelope.data)?)
            }
            EVENT_FACILITY_TYPING => {
                ServerEvent::FacilityTyping(serde_json::from_value(envelope.data)?)
            }
            EVENT_MARKED_READ => ServerEvent::MarkedRead(serde_json::from_value(envelope.data)?),
            EVENT_MESSAGES_READ => {
                ServerEvent::MessagesRead(serde_json::from_value(envelope.data)?)
            }
            EVENT_CHAT_STATUS_UPDATED => {
                ServerEvent::ChatStatusUpdated(serde_json::from_value(envelope.data)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    event: String,
    data: Value,
}
