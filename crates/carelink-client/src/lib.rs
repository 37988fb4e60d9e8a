//! # carelink-client
//!
//! Session facade for the Carelink support chat.
//!
//! One [`ChatSession`] is constructed when the user authenticates and
//! disposed on logout. It owns the socket task, the REST client, the
//! conversation store, and the typing coordinator, and exposes the
//! subscription surface the UI renders from: conversation snapshots, the
//! typing state, the connection flag, and one observable error slot.

pub mod config;
pub mod logging;
pub mod pipeline;
pub mod routing;
pub mod session;
pub mod typing;

mod bridge;

pub use config::SessionConfig;
pub use routing::ChatRoute;
pub use session::ChatSession;
pub use typing::TypingState;
