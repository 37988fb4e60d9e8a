use url::Url;

use carelink_shared::{FacilityRef, Role, UserId};

/// Everything a [`crate::ChatSession`] needs at construction time.
///
/// The auth token comes from the login flow; token acquisition and renewal
/// are outside this crate.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the portal backend (the chat API lives under
    /// `/api/chat`).
    pub api_url: Url,
    /// WebSocket endpoint of the messaging service.
    pub socket_url: Url,
    /// Bearer token for both HTTP and socket authentication.
    pub auth_token: String,
    /// The authenticated user.
    pub user_id: UserId,
    /// Which side of the conversation this session is.
    pub role: Role,
    /// The facility account, set on the facility side.
    pub facility: Option<FacilityRef>,
}
