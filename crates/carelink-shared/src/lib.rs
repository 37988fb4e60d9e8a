//! # carelink-shared
//!
//! Domain types and wire protocol for the Carelink support-chat core.
//!
//! Everything the other crates agree on lives here: conversation and message
//! models, the named socket event payloads, the error taxonomy, attachment
//! validation, and the timing/size constants shared with the backend.

pub mod attachment;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use attachment::AttachmentUpload;
pub use error::{ChatError, Result, ValidationError};
pub use types::{
    AttachmentMeta, ChatFilters, ChatId, ChatStats, ChatStatus, Conversation, Delivery,
    FacilityId, FacilityRef, Message, MessageKind, Priority, Role, UnreadCounts, UserId,
};
