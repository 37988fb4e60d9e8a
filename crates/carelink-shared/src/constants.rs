/// Base path of the chat REST API.
pub const API_BASE_PATH: &str = "/api/chat";

/// Maximum attachment size in bytes (10 MiB, matches server-side cap).
pub const MAX_ATTACHMENT_SIZE: usize = 10 * 1024 * 1024;

/// MIME types the server accepts for attachments.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/plain",
    "text/csv",
];

/// Prefix reserved for locally synthesized conversation ids.
/// The server never issues ids with this prefix.
pub const SYNTHETIC_ID_PREFIX: &str = "temp_";

/// Prefix of the URL route token for a facility with no conversation yet.
pub const ROUTE_NEW_PREFIX: &str = "new_";

/// Quiet window after the last keystroke before a typing-stop is emitted.
pub const TYPING_IDLE_MS: u64 = 1_000;

/// Receiver-side safety window: a typing indicator with no refresh for this
/// long is cleared even if the stop event was lost.
pub const TYPING_CLEAR_MS: u64 = 3_000;

/// Wall-clock limit for a single message dispatch before it is failed.
pub const SEND_TIMEOUT_SECS: u64 = 20;
