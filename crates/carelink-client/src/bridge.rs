//! Socket → store bridge.
//!
//! One task per session drains the socket notification channel and applies
//! each event to the store and the typing coordinator. Store failures here
//! are logged and skipped rather than propagated: a broadcast for a
//! conversation we have not loaded is normal, not fatal.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use carelink_net::{SocketHandle, SocketNotification};
use carelink_shared::protocol::ServerEvent;
use carelink_store::ConversationStore;

use crate::typing::TypingCoordinator;

pub(crate) async fn notification_loop(
    mut notif_rx: mpsc::Receiver<SocketNotification>,
    store: Arc<ConversationStore>,
    typing: Arc<TypingCoordinator>,
    socket: SocketHandle,
    errors: Arc<watch::Sender<Option<String>>>,
) {
    while let Some(notification) = notif_rx.recv().await {
        match notification {
            SocketNotification::Connected => {
                // Rooms do not survive a reconnect on the server side.
                let active = store.snapshot().active.clone();
                if let Some(chat) = active.filter(|c| !c.is_synthetic()) {
                    debug!(chat = %chat, "Rejoining active room after reconnect");
                    let _ = socket.join(chat).await;
                }
            }
            SocketNotification::Disconnected { reason } => {
                debug!(reason = %reason, "Socket offline; REST fallback active");
            }
            SocketNotification::Event(event) => {
                apply_event(event, &store, &typing, &errors);
            }
        }
    }
    debug!("Notification channel closed");
}

fn apply_event(
    event: ServerEvent,
    store: &Arc<ConversationStore>,
    typing: &Arc<TypingCoordinator>,
    errors: &watch::Sender<Option<String>>,
) {
    match event {
        ServerEvent::NewMessage(p) => {
            // A delivered message supersedes any typing indicator.
            typing.remote_typing(p.chat_id.clone(), false, None);
            if let Err(e) = store.append_incoming(&p.chat_id, p.message, p.unread_count) {
                warn!(chat = %p.chat_id, error = %e, "Failed to apply incoming message");
            }
        }
        ServerEvent::MessageSent(p) => {
            if p.success {
                if let Err(e) = store.reconcile_next_pending(&p.chat_id, p.message) {
                    warn!(chat = %p.chat_id, error = %e, "Ack with no pending message");
                }
            } else {
                warn!(chat = %p.chat_id, "Server rejected message");
                errors.send_replace(Some("Message could not be delivered".into()));
            }
        }
        ServerEvent::AdminTyping(p) => {
            typing.remote_typing(p.chat_id, p.is_typing, None);
        }
        ServerEvent::FacilityTyping(p) => {
            typing.remote_typing(
                p.chat_id,
                p.is_typing,
                Some((p.facility_id, p.facility_name)),
            );
        }
        ServerEvent::MarkedRead(p) | ServerEvent::MessagesRead(p) => {
            if let Err(e) = store.mark_read(&p.chat_id, p.read_by) {
                warn!(chat = %p.chat_id, error = %e, "Read receipt for unknown conversation");
            }
        }
        ServerEvent::ChatStatusUpdated(p) => {
            if let Err(e) = store.update_status(&p.chat_id, p.status, p.priority) {
                warn!(chat = %p.chat_id, error = %e, "Status update for unknown conversation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_shared::protocol::{MessageSentPayload, NewMessagePayload, ReadPayload};
    use carelink_shared::{
        ChatId, ChatStatus, Conversation, Delivery, FacilityId, FacilityRef, Message, Priority,
        Role, UserId,
    };

    fn store_with_chat() -> Arc<ConversationStore> {
        let store = Arc::new(ConversationStore::new(UserId("admin-1".into()), Role::Admin));
        store
            .upsert(Conversation {
                id: ChatId::durable("C1"),
                facility: FacilityRef {
                    id: FacilityId("F1".into()),
                    name: "Facility".into(),
                },
                status: ChatStatus::Open,
                priority: Priority::Medium,
                unread: Default::default(),
                last_activity: chrono::Utc::now(),
                messages: Vec::new(),
            })
            .unwrap();
        store
    }

    fn stub_typing() -> Arc<TypingCoordinator> {
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let (_, connected_rx) = watch::channel(false);
        TypingCoordinator::new(SocketHandle::from_parts(cmd_tx, connected_rx))
    }

    #[tokio::test]
    async fn new_message_lands_in_the_store() {
        let store = store_with_chat();
        let typing = stub_typing();
        let (errors, _) = watch::channel(None);
        let chat = ChatId::durable("C1");
        store.select_active(&chat).unwrap();

        let mut message = Message::text(UserId("fac-1".into()), Role::Facility, "hello");
        message.server_id = Some("M1".into());
        message.delivery = Delivery::Sent;

        apply_event(
            ServerEvent::NewMessage(NewMessagePayload {
                chat_id: chat.clone(),
                message,
                unread_count: None,
            }),
            &store,
            &typing,
            &errors,
        );

        assert_eq!(store.snapshot().conversation(&chat).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn successful_ack_reconciles_the_pending_send() {
        let store = store_with_chat();
        let typing = stub_typing();
        let (errors, _) = watch::channel(None);
        let chat = ChatId::durable("C1");

        let pending = Message::text(UserId("admin-1".into()), Role::Admin, "hi");
        let local_id = pending.local_id;
        store.insert_pending(&chat, pending).unwrap();

        let mut acked = Message::text(UserId("admin-1".into()), Role::Admin, "hi");
        acked.server_id = Some("M7".into());

        apply_event(
            ServerEvent::MessageSent(MessageSentPayload {
                success: true,
                chat_id: chat.clone(),
                message: acked,
            }),
            &store,
            &typing,
            &errors,
        );

        let snap = store.snapshot();
        let message = &snap.conversation(&chat).unwrap().messages[0];
        assert_eq!(message.local_id, local_id);
        assert_eq!(message.delivery, Delivery::Sent);
        assert_eq!(message.server_id, Some("M7".into()));
    }

    #[tokio::test]
    async fn rejected_ack_surfaces_an_error() {
        let store = store_with_chat();
        let typing = stub_typing();
        let (errors, errors_rx) = watch::channel(None);
        let chat = ChatId::durable("C1");

        apply_event(
            ServerEvent::MessageSent(MessageSentPayload {
                success: false,
                chat_id: chat,
                message: Message::text(UserId("admin-1".into()), Role::Admin, "x"),
            }),
            &store,
            &typing,
            &errors,
        );

        assert!(errors_rx.borrow().is_some());
    }

    #[tokio::test]
    async fn read_receipt_clears_the_reader_side() {
        let store = store_with_chat();
        let typing = stub_typing();
        let (errors, _) = watch::channel(None);
        let chat = ChatId::durable("C1");

        store
            .append_incoming(
                &chat,
                {
                    let mut m = Message::text(UserId("fac-1".into()), Role::Facility, "ping");
                    m.server_id = Some("M1".into());
                    m
                },
                Some(2),
            )
            .unwrap();
        assert_eq!(store.snapshot().conversation(&chat).unwrap().unread.admin, 2);

        apply_event(
            ServerEvent::MarkedRead(ReadPayload {
                success: Some(true),
                chat_id: chat.clone(),
                read_by: Role::Admin,
            }),
            &store,
            &typing,
            &errors,
        );

        assert_eq!(store.snapshot().conversation(&chat).unwrap().unread.admin, 0);
    }
}
