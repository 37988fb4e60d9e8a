//! # carelink-store
//!
//! In-memory reconciled conversation state for one authenticated session.
//!
//! The store is the single source of truth consumed by the UI. Every
//! mutation produces a new immutable [`Snapshot`] published over a `watch`
//! channel, so renderers never observe a partially applied update.

mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{ConversationStore, Snapshot};
