use thiserror::Error;
use uuid::Uuid;

use carelink_shared::{ChatError, ChatId};

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The referenced conversation is not loaded.
    #[error("Unknown conversation: {0}")]
    UnknownChat(ChatId),

    /// The referenced message is not in the conversation's list.
    #[error("Unknown message {local_id} in conversation {chat_id}")]
    UnknownMessage { chat_id: ChatId, local_id: Uuid },

    /// A panicking writer left the store lock poisoned.
    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        ChatError::Store(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
