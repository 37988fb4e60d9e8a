use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::SYNTHETIC_ID_PREFIX;

/// Facility account identifier, issued by the directory backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct FacilityId(pub String);

impl FacilityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FacilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a chat participant (admin operator or facility account).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation identifier.
///
/// Durable ids come from the server. Before the first message of a
/// conversation round-trips, the client works with a synthetic id derived
/// from the facility id; the reserved `temp_` prefix guarantees the two
/// namespaces never collide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    /// Wrap a server-issued id.
    pub fn durable(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Synthesize the local placeholder id for a facility with no
    /// conversation yet.
    pub fn synthetic(facility: &FacilityId) -> Self {
        Self(format!("{SYNTHETIC_ID_PREFIX}{facility}"))
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SYNTHETIC_ID_PREFIX)
    }

    /// The facility a synthetic id was derived from, if synthetic.
    pub fn synthetic_facility(&self) -> Option<FacilityId> {
        self.0
            .strip_prefix(SYNTHETIC_ID_PREFIX)
            .map(|s| FacilityId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the conversation a participant is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Facility,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Open,
    Closed,
    Resolved,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Delivery state of a message on this client.
///
/// `Pending` messages are optimistic local inserts awaiting the server
/// acknowledgment; `Sent` messages are immutable; `Failed` messages keep
/// their place in the list and can be retried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Pending,
    Sent,
    Failed,
}

impl Delivery {
    fn sent() -> Self {
        Delivery::Sent
    }
}

/// Attachment metadata carried by image and file messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub file_name: String,
    pub byte_size: u64,
    pub mime_type: String,
    /// Server-resolved URL; `None` until the upload completes.
    pub url: Option<String>,
    /// Local data-URL preview for images, shown while the upload is in
    /// flight. Never serialized to the server; dropped on reconciliation.
    #[serde(skip)]
    pub local_preview: Option<String>,
}

/// The discriminated message payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image {
        #[serde(flatten)]
        attachment: AttachmentMeta,
    },
    File {
        #[serde(flatten)]
        attachment: AttachmentMeta,
    },
}

impl MessageKind {
    pub fn attachment(&self) -> Option<&AttachmentMeta> {
        match self {
            MessageKind::Text => None,
            MessageKind::Image { attachment } | MessageKind::File { attachment } => {
                Some(attachment)
            }
        }
    }

    pub fn attachment_mut(&mut self) -> Option<&mut AttachmentMeta> {
        match self {
            MessageKind::Text => None,
            MessageKind::Image { attachment } | MessageKind::File { attachment } => {
                Some(attachment)
            }
        }
    }
}

/// One message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Client-side identity, stable across the pending → sent transition so
    /// reconciliation can replace the placeholder at its original index.
    /// Server payloads do not carry one; a fresh id is minted on receive.
    #[serde(default = "Uuid::new_v4")]
    pub local_id: Uuid,

    /// Server-issued identity, present once acknowledged or received.
    #[serde(default, rename = "id")]
    pub server_id: Option<String>,

    pub sender: UserId,
    pub sender_role: Role,
    pub body: String,

    #[serde(flatten)]
    pub kind: MessageKind,

    /// Server payloads omit this; anything received over the wire is sent.
    #[serde(default = "Delivery::sent")]
    pub delivery: Delivery,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build an optimistic local text message.
    pub fn text(sender: UserId, sender_role: Role, body: impl Into<String>) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            server_id: None,
            sender,
            sender_role,
            body: body.into(),
            kind: MessageKind::Text,
            delivery: Delivery::Pending,
            timestamp: Utc::now(),
        }
    }

    /// Build an optimistic local message carrying an attachment.
    pub fn with_attachment(
        sender: UserId,
        sender_role: Role,
        body: impl Into<String>,
        attachment: AttachmentMeta,
    ) -> Self {
        let kind = if attachment.mime_type.starts_with("image/") {
            MessageKind::Image { attachment }
        } else {
            MessageKind::File { attachment }
        };
        Self {
            local_id: Uuid::new_v4(),
            server_id: None,
            sender,
            sender_role,
            body: body.into(),
            kind,
            delivery: Delivery::Pending,
            timestamp: Utc::now(),
        }
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        &self.sender == user
    }

    pub fn has_attachment(&self) -> bool {
        self.kind.attachment().is_some()
    }
}

/// The facility participating in a conversation, as shown in list views.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FacilityRef {
    pub id: FacilityId,
    pub name: String,
}

/// Unread message counts, kept per role because both sides share the thread.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCounts {
    pub admin: u32,
    pub facility: u32,
}

impl UnreadCounts {
    pub fn for_role(&self, role: Role) -> u32 {
        match role {
            Role::Admin => self.admin,
            Role::Facility => self.facility,
        }
    }

    pub fn bump(&mut self, role: Role) {
        match role {
            Role::Admin => self.admin += 1,
            Role::Facility => self.facility += 1,
        }
    }

    pub fn clear(&mut self, role: Role) {
        match role {
            Role::Admin => self.admin = 0,
            Role::Facility => self.facility = 0,
        }
    }
}

/// The thread between one facility and the support side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ChatId,
    pub facility: FacilityRef,
    pub status: ChatStatus,
    pub priority: Priority,
    #[serde(default)]
    pub unread: UnreadCounts,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Local placeholder for a facility with no server-side conversation,
    /// so the UI can render without waiting on a round trip.
    pub fn placeholder(facility: FacilityRef) -> Self {
        Self {
            id: ChatId::synthetic(&facility.id),
            facility,
            status: ChatStatus::Open,
            priority: Priority::Medium,
            unread: UnreadCounts::default(),
            last_activity: Utc::now(),
            messages: Vec::new(),
        }
    }
}

/// Query filters for the admin conversation list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatFilters {
    pub status: Option<ChatStatus>,
    pub priority: Option<Priority>,
}

impl ChatFilters {
    /// Render as query-string pairs; unset filters are omitted.
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(status) = self.status {
            pairs.push(("status", to_query_value(&status)));
        }
        if let Some(priority) = self.priority {
            pairs.push(("priority", to_query_value(&priority)));
        }
        pairs
    }
}

fn to_query_value<T: Serialize>(value: &T) -> String {
    // Enum serde representations are plain lowercase strings.
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}

/// Dashboard counters for the admin side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatStats {
    pub total: u32,
    pub open: u32,
    pub closed: u32,
    pub resolved: u32,
    pub unread_total: u32,
}
