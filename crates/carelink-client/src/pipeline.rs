//! Optimistic message sending.
//!
//! Every send inserts a pending message into the store first, then picks a
//! transport: the socket when it is connected and can carry the payload, the
//! REST endpoint otherwise. File-bearing sends and conversation-creating
//! sends (synthetic chat id) always go over REST — the event channel never
//! carries binary data, and conversation creation needs the durable id from
//! the HTTP response to promote the placeholder.
//!
//! Failure shapes differ by kind: a failed text send is rolled back (the
//! composer keeps the draft), a failed file send stays in the list as
//! `Failed` with its bytes retained so it can be retried without re-reading
//! the file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use carelink_net::{ChatApi, SendOutcome, SocketHandle};
use carelink_shared::constants::SEND_TIMEOUT_SECS;
use carelink_shared::protocol::{ClientEvent, SendMessagePayload};
use carelink_shared::{
    AttachmentUpload, ChatError, ChatId, Delivery, FacilityId, Message, Result, ValidationError,
};
use carelink_store::ConversationStore;

use crate::typing::TypingCoordinator;

/// Which transport a send takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchRoute {
    Socket,
    Rest,
}

/// The dispatch rule, kept pure so it can be tested as a table.
pub(crate) fn dispatch_route(is_synthetic: bool, has_file: bool, connected: bool) -> DispatchRoute {
    if is_synthetic || has_file || !connected {
        DispatchRoute::Rest
    } else {
        DispatchRoute::Socket
    }
}

/// Owns in-flight sends for one session.
pub struct SendPipeline {
    api: ChatApi,
    socket: SocketHandle,
    store: Arc<ConversationStore>,
    typing: Arc<TypingCoordinator>,
    /// Retained upload bytes, keyed by the pending message's local id, so a
    /// failed file send can be retried.
    uploads: Mutex<HashMap<Uuid, AttachmentUpload>>,
    errors: Arc<watch::Sender<Option<String>>>,
}

impl SendPipeline {
    pub fn new(
        api: ChatApi,
        socket: SocketHandle,
        store: Arc<ConversationStore>,
        typing: Arc<TypingCoordinator>,
        errors: Arc<watch::Sender<Option<String>>>,
    ) -> Self {
        Self {
            api,
            socket,
            store,
            typing,
            uploads: Mutex::new(HashMap::new()),
            errors,
        }
    }

    /// Send a text message into `chat_id`.
    ///
    /// Returns the conversation id the message ended up in — the durable id
    /// when the send created the conversation, `chat_id` itself otherwise.
    pub async fn send_text(&self, chat_id: &ChatId, body: &str) -> Result<ChatId> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }

        let message = Message::text(self.store.local_user().clone(), self.store.role(), body);
        let local_id = message.local_id;
        self.store.insert_pending(chat_id, message)?;

        let payload = self.payload_for(chat_id, body, "text");
        match dispatch_route(chat_id.is_synthetic(), false, self.socket.is_connected()) {
            DispatchRoute::Socket => {
                debug!(chat = %chat_id, "Sending text over socket");
                if let Err(e) = self.socket.emit(ClientEvent::SendMessage(payload)).await {
                    self.store.remove_message(chat_id, local_id)?;
                    self.report(&e);
                    return Err(e);
                }
                self.spawn_ack_watchdog(chat_id.clone(), local_id);
                Ok(chat_id.clone())
            }
            DispatchRoute::Rest => {
                debug!(chat = %chat_id, "Sending text over REST");
                match self.rest_send(&payload).await {
                    Ok(outcome) => self.settle(chat_id, local_id, outcome).await,
                    Err(e) => {
                        // Text rolls back; the composer still holds the draft.
                        self.store.remove_message(chat_id, local_id)?;
                        self.report(&e);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Send a message carrying a file. Always REST.
    pub async fn send_file(
        &self,
        chat_id: &ChatId,
        body: &str,
        upload: AttachmentUpload,
    ) -> Result<ChatId> {
        upload.validate()?;

        let message = Message::with_attachment(
            self.store.local_user().clone(),
            self.store.role(),
            body,
            upload.meta(),
        );
        let local_id = message.local_id;
        self.store.insert_pending(chat_id, message)?;
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.insert(local_id, upload.clone());
        }

        self.typing.begin_upload(&upload.file_name);
        let result = self.rest_send_file(chat_id, body, &upload).await;
        self.typing.end_upload(&upload.file_name);

        match result {
            Ok(outcome) => {
                if let Ok(mut uploads) = self.uploads.lock() {
                    uploads.remove(&local_id);
                }
                self.settle(chat_id, local_id, outcome).await
            }
            Err(e) => {
                // Files stay in the list as failed; the retained bytes make
                // retry possible without reselecting the file.
                self.store.fail_message(chat_id, local_id)?;
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Retry a failed message. Goes over REST regardless of connectivity so
    /// the outcome is deterministic.
    pub async fn retry(&self, chat_id: &ChatId, local_id: Uuid) -> Result<ChatId> {
        let message = self
            .store
            .message(chat_id, local_id)
            .ok_or_else(|| ChatError::Store(format!("No message {local_id} in {chat_id}")))?;
        self.store.retry_pending(chat_id, local_id)?;

        let result = if message.has_attachment() {
            let upload = self
                .uploads
                .lock()
                .ok()
                .and_then(|u| u.get(&local_id).cloned())
                .ok_or_else(|| {
                    ChatError::Store("Attachment bytes no longer available".into())
                });
            match upload {
                Ok(upload) => self.rest_send_file(chat_id, &message.body, &upload).await,
                Err(e) => Err(e),
            }
        } else {
            self.rest_send(&self.payload_for(chat_id, &message.body, "text"))
                .await
        };

        match result {
            Ok(outcome) => {
                if let Ok(mut uploads) = self.uploads.lock() {
                    uploads.remove(&local_id);
                }
                self.settle(chat_id, local_id, outcome).await
            }
            Err(e) => {
                self.store.fail_message(chat_id, local_id)?;
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Apply a successful REST outcome: promote the placeholder conversation
    /// when the send created it, join its room, and reconcile the pending
    /// message in place.
    async fn settle(&self, chat_id: &ChatId, local_id: Uuid, outcome: SendOutcome) -> Result<ChatId> {
        let durable = outcome.chat_id.clone();
        if chat_id.is_synthetic() {
            self.store.promote(chat_id, durable.clone())?;
            // Best effort: while disconnected the reconnect path re-joins.
            let _ = self.socket.join(durable.clone()).await;
        }
        self.store
            .reconcile_sent(&durable, local_id, outcome.message)?;
        Ok(durable)
    }

    async fn rest_send(&self, payload: &SendMessagePayload) -> Result<SendOutcome> {
        tokio::time::timeout(
            Duration::from_secs(SEND_TIMEOUT_SECS),
            self.api.send_message(payload),
        )
        .await
        .map_err(|_| ChatError::Timeout)?
    }

    async fn rest_send_file(
        &self,
        chat_id: &ChatId,
        body: &str,
        upload: &AttachmentUpload,
    ) -> Result<SendOutcome> {
        let (durable, facility) = Self::send_target(chat_id);
        tokio::time::timeout(
            Duration::from_secs(SEND_TIMEOUT_SECS),
            self.api
                .send_file_message(durable.as_ref(), facility.as_ref(), body, upload),
        )
        .await
        .map_err(|_| ChatError::Timeout)?
    }

    /// Socket sends have no per-send response; if the ack has not arrived
    /// within the send window, roll the optimistic insert back and surface
    /// the failure.
    fn spawn_ack_watchdog(&self, chat_id: ChatId, local_id: Uuid) {
        let store = Arc::clone(&self.store);
        let errors = Arc::clone(&self.errors);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(SEND_TIMEOUT_SECS)).await;
            let still_pending = store
                .message(&chat_id, local_id)
                .is_some_and(|m| m.delivery == Delivery::Pending);
            if still_pending {
                warn!(chat = %chat_id, %local_id, "Send not acknowledged in time");
                let _ = store.remove_message(&chat_id, local_id);
                errors.send_replace(Some("Message could not be delivered".into()));
            }
        });
    }

    fn payload_for(&self, chat_id: &ChatId, body: &str, message_type: &str) -> SendMessagePayload {
        let (durable, facility) = Self::send_target(chat_id);
        SendMessagePayload {
            chat_id: durable,
            facility_id: facility,
            message: body.to_string(),
            message_type: message_type.to_string(),
        }
    }

    /// A synthetic id addresses the server by facility; a durable id by
    /// itself.
    fn send_target(chat_id: &ChatId) -> (Option<ChatId>, Option<FacilityId>) {
        match chat_id.synthetic_facility() {
            Some(facility) => (None, Some(facility)),
            None => (Some(chat_id.clone()), None),
        }
    }

    fn report(&self, error: &ChatError) {
        warn!(error = %error, "Send failed");
        // send_replace so the slot holds the error even before anyone
        // watches it.
        self.errors.send_replace(Some(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use carelink_net::SocketCommand;
    use carelink_shared::{ChatStatus, Conversation, FacilityRef, Priority, Role, UserId};
    use tokio::sync::mpsc;
    use url::Url;

    fn conversation(id: &str) -> Conversation {
        Conversation {
            id: ChatId::durable(id),
            facility: FacilityRef {
                id: FacilityId("F1".into()),
                name: "Facility".into(),
            },
            status: ChatStatus::Open,
            priority: Priority::Medium,
            unread: Default::default(),
            last_activity: chrono::Utc::now(),
            messages: Vec::new(),
        }
    }

    fn pipeline(connected: bool) -> (SendPipeline, mpsc::Receiver<SocketCommand>, Arc<ConversationStore>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        // The watch keeps its last value after the sender drops.
        let (_, connected_rx) = watch::channel(connected);
        let socket = SocketHandle::from_parts(cmd_tx, connected_rx);
        let store = Arc::new(ConversationStore::new(UserId("admin-1".into()), Role::Admin));
        store.upsert(conversation("C1")).unwrap();
        let typing = TypingCoordinator::new(socket.clone());
        let (errors, _) = watch::channel(None);
        // Port 9 (discard) refuses connections in the test environment.
        let api = ChatApi::new(Url::parse("http://127.0.0.1:9/").unwrap(), "t");
        let p = SendPipeline::new(api, socket, store.clone(), typing, Arc::new(errors));
        (p, cmd_rx, store)
    }

    #[test]
    fn dispatch_rule_table() {
        use DispatchRoute::*;
        // (synthetic, file, connected) → route
        assert_eq!(dispatch_route(false, false, true), Socket);
        assert_eq!(dispatch_route(false, false, false), Rest);
        assert_eq!(dispatch_route(true, false, true), Rest);
        assert_eq!(dispatch_route(false, true, true), Rest);
        assert_eq!(dispatch_route(true, true, false), Rest);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_any_insert() {
        let (pipeline, _rx, store) = pipeline(true);
        let chat = ChatId::durable("C1");

        let err = pipeline.send_text(&chat, "   ").await;
        assert!(matches!(
            err,
            Err(ChatError::Validation(ValidationError::EmptyMessage))
        ));
        assert!(store.snapshot().conversation(&chat).unwrap().messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connected_text_send_goes_over_the_socket() {
        let (pipeline, mut rx, store) = pipeline(true);
        let chat = ChatId::durable("C1");

        pipeline.send_text(&chat, "hello").await.unwrap();

        match rx.try_recv().unwrap() {
            SocketCommand::Emit(ClientEvent::SendMessage(p)) => {
                assert_eq!(p.chat_id, Some(chat.clone()));
                assert_eq!(p.message, "hello");
                assert_eq!(p.message_type, "text");
            }
            other => panic!("Unexpected command: {other:?}"),
        }

        let snap = store.snapshot();
        let messages = &snap.conversation(&chat).unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].delivery, Delivery::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_socket_send_rolls_back() {
        let (pipeline, _rx, store) = pipeline(true);
        let chat = ChatId::durable("C1");

        pipeline.send_text(&chat, "lost").await.unwrap();
        assert_eq!(store.snapshot().conversation(&chat).unwrap().messages.len(), 1);

        tokio::time::sleep(Duration::from_secs(SEND_TIMEOUT_SECS + 1)).await;
        tokio::task::yield_now().await;

        assert!(store.snapshot().conversation(&chat).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn failed_rest_text_send_rolls_back() {
        let (pipeline, mut rx, store) = pipeline(false);
        let chat = ChatId::durable("C1");

        let err = pipeline.send_text(&chat, "offline").await;
        assert!(err.is_err());
        assert!(store.snapshot().conversation(&chat).unwrap().messages.is_empty());
        // Disconnected sends never touch the socket.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_failure_is_held_for_late_error_subscribers() {
        let (pipeline, _rx, _store) = pipeline(false);
        let chat = ChatId::durable("C1");

        let _ = pipeline.send_text(&chat, "offline").await;

        // Nobody was watching the slot when the failure landed; a watcher
        // attached afterwards still sees it.
        let errors = pipeline.errors.subscribe();
        assert!(errors.borrow().is_some());
    }

    #[tokio::test]
    async fn first_send_outcome_promotes_joins_and_reconciles() {
        let (pipeline, mut rx, store) = pipeline(true);
        let synthetic = store
            .select_facility(FacilityRef {
                id: FacilityId("F123".into()),
                name: "Lagos General".into(),
            })
            .unwrap();
        assert_eq!(synthetic.as_str(), "temp_F123");

        let pending = Message::text(
            UserId("admin-1".into()),
            Role::Admin,
            "Hello, how can we help?",
        );
        let local_id = pending.local_id;
        store.insert_pending(&synthetic, pending).unwrap();

        let mut acked = Message::text(
            UserId("admin-1".into()),
            Role::Admin,
            "Hello, how can we help?",
        );
        acked.server_id = Some("M1".into());
        let landed = pipeline
            .settle(
                &synthetic,
                local_id,
                SendOutcome {
                    chat_id: ChatId::durable("C987"),
                    message: acked,
                },
            )
            .await
            .unwrap();
        assert_eq!(landed, ChatId::durable("C987"));

        // The placeholder became the durable entry (the fixture's unrelated
        // conversation is untouched); the message finalized in place.
        let snap = store.snapshot();
        assert!(snap.conversation(&synthetic).is_none());
        assert_eq!(
            snap.conversations
                .iter()
                .filter(|c| c.facility.id == FacilityId("F123".into()))
                .count(),
            1
        );
        let conv = snap.conversation(&ChatId::durable("C987")).unwrap();
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].local_id, local_id);
        assert_eq!(conv.messages[0].delivery, Delivery::Sent);
        assert_eq!(snap.active, Some(ChatId::durable("C987")));

        // The durable room was joined.
        match rx.try_recv().unwrap() {
            SocketCommand::Emit(ClientEvent::JoinChat(id)) => {
                assert_eq!(id, ChatId::durable("C987"));
            }
            other => panic!("Unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_before_any_insert() {
        let (pipeline, _rx, store) = pipeline(true);
        let chat = ChatId::durable("C1");
        let upload = AttachmentUpload::new(
            "big.pdf",
            "application/pdf",
            Bytes::from(vec![0u8; carelink_shared::constants::MAX_ATTACHMENT_SIZE + 1]),
        );

        let err = pipeline.send_file(&chat, "", upload).await;
        assert!(matches!(
            err,
            Err(ChatError::Validation(ValidationError::FileTooLarge { .. }))
        ));
        assert!(store.snapshot().conversation(&chat).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn failed_file_send_stays_failed_for_retry() {
        let (pipeline, _rx, store) = pipeline(true);
        let chat = ChatId::durable("C1");
        let upload = AttachmentUpload::new("scan.pdf", "application/pdf", Bytes::from_static(b"pdf"));

        let err = pipeline.send_file(&chat, "see attached", upload).await;
        assert!(err.is_err());

        let snap = store.snapshot();
        let messages = &snap.conversation(&chat).unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].delivery, Delivery::Failed);
        assert!(messages[0].has_attachment());

        // The bytes are retained, so a retry attempt reaches the network
        // (and fails against the unroutable test endpoint) instead of
        // erroring on missing data.
        let local_id = messages[0].local_id;
        let err = pipeline.retry(&chat, local_id).await;
        assert!(matches!(err, Err(ChatError::Request { .. }) | Err(ChatError::Timeout)));
        let snap = store.snapshot();
        assert_eq!(
            snap.conversation(&chat).unwrap().messages[0].delivery,
            Delivery::Failed
        );
    }

    #[tokio::test]
    async fn synthetic_send_addresses_the_facility() {
        let (pipeline, _rx, store) = pipeline(true);
        let synthetic = store
            .select_facility(FacilityRef {
                id: FacilityId("F9".into()),
                name: "New Facility".into(),
            })
            .unwrap();
        assert!(synthetic.is_synthetic());

        let payload = pipeline.payload_for(&synthetic, "first contact", "text");
        assert_eq!(payload.chat_id, None);
        assert_eq!(payload.facility_id, Some(FacilityId("F9".into())));
    }
}
