// Network layer: WebSocket transport task and REST fallback client.

pub mod backoff;
pub mod rest;
pub mod socket;

pub use rest::{ChatApi, MessagesPage, SendOutcome};
pub use socket::{spawn_socket, SocketCommand, SocketConfig, SocketHandle, SocketNotification};
