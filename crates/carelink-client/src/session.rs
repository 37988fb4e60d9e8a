//! The session facade.
//!
//! A [`ChatSession`] is built once the user authenticates and dropped on
//! logout. It owns the socket task, the REST client, the conversation store,
//! the typing coordinator, and the send pipeline, and exposes the handful of
//! watch channels the UI renders from. Must be constructed inside a tokio
//! runtime; construction spawns the socket and bridge tasks.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use carelink_net::{spawn_socket, ChatApi, SocketConfig, SocketHandle};
use carelink_shared::protocol::{ClientEvent, UpdateChatStatusPayload};
use carelink_shared::{
    AttachmentUpload, ChatFilters, ChatId, ChatStats, ChatStatus, Conversation, FacilityId,
    FacilityRef, Priority, Result, Role,
};
use carelink_store::{ConversationStore, Snapshot};
use uuid::Uuid;

use crate::bridge;
use crate::config::SessionConfig;
use crate::pipeline::SendPipeline;
use crate::routing::ChatRoute;
use crate::typing::{TypingCoordinator, TypingState};

pub struct ChatSession {
    api: ChatApi,
    socket: SocketHandle,
    store: Arc<ConversationStore>,
    typing: Arc<TypingCoordinator>,
    pipeline: SendPipeline,
    errors: Arc<watch::Sender<Option<String>>>,
    bridge: JoinHandle<()>,
    facility: Option<FacilityRef>,
}

impl ChatSession {
    pub fn new(config: SessionConfig) -> Self {
        let api = ChatApi::new(config.api_url, config.auth_token.clone());
        let (socket, notif_rx) = spawn_socket(SocketConfig {
            url: config.socket_url,
            auth_token: config.auth_token,
        });
        let store = Arc::new(ConversationStore::new(config.user_id, config.role));
        let typing = TypingCoordinator::new(socket.clone());
        let (errors, _) = watch::channel(None);
        let errors = Arc::new(errors);

        let pipeline = SendPipeline::new(
            api.clone(),
            socket.clone(),
            Arc::clone(&store),
            Arc::clone(&typing),
            Arc::clone(&errors),
        );
        let bridge = tokio::spawn(bridge::notification_loop(
            notif_rx,
            Arc::clone(&store),
            Arc::clone(&typing),
            socket.clone(),
            Arc::clone(&errors),
        ));

        info!(role = ?config.role, "Chat session started");
        Self {
            api,
            socket,
            store,
            typing,
            pipeline,
            errors,
            bridge,
            facility: config.facility,
        }
    }

    // ---- Observation surface -------------------------------------------

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.store.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.socket.connected_watch()
    }

    pub fn typing_state(&self) -> TypingState {
        self.typing.state()
    }

    pub fn typing_watch(&self) -> watch::Receiver<TypingState> {
        self.typing.subscribe()
    }

    /// The single observable error slot; newer failures overwrite older.
    pub fn error_watch(&self) -> watch::Receiver<Option<String>> {
        self.errors.subscribe()
    }

    pub fn clear_error(&self) {
        self.errors.send_replace(None);
    }

    // ---- Loading -------------------------------------------------------

    /// Reload the conversation set for this session's role.
    pub async fn refresh(&self) -> Result<()> {
        match self.store.role() {
            Role::Admin => {
                let chats = self.api.admin_chats(&ChatFilters::default()).await?;
                self.store.load_all(chats)?;
            }
            Role::Facility => {
                let chat = self.api.facility_chat().await?;
                self.store.upsert(chat)?;
            }
        }
        Ok(())
    }

    /// Admin list view with status/priority/search filters applied.
    pub async fn refresh_filtered(&self, filters: &ChatFilters) -> Result<()> {
        let chats = self.api.admin_chats(filters).await?;
        self.store.load_all(chats)?;
        Ok(())
    }

    /// Dashboard counters (admin side).
    pub async fn load_stats(&self) -> Result<ChatStats> {
        self.api.admin_chat_stats().await
    }

    /// Fetch one facility's conversation into the store (admin side).
    pub async fn load_conversation(&self, facility: &FacilityId) -> Result<ChatId> {
        let conversation = self.api.admin_chat(facility).await?;
        let id = conversation.id.clone();
        self.store.upsert(conversation)?;
        Ok(id)
    }

    /// Pull one older history page in front of the loaded messages.
    /// Returns whether more pages remain.
    pub async fn load_older_messages(&self, chat_id: &ChatId, page: u32, limit: u32) -> Result<bool> {
        if chat_id.is_synthetic() {
            // Nothing exists server-side yet.
            return Ok(false);
        }
        let page = self.api.messages(chat_id, page, limit).await?;
        self.store.prepend_history(chat_id, page.messages)?;
        Ok(page.has_more)
    }

    // ---- Navigation ----------------------------------------------------

    /// Resolve a URL token to a conversation and make it active.
    ///
    /// Returns the canonical id so the caller can rewrite the URL: a
    /// `new_<facility>` token resolves to the durable id when the
    /// conversation already exists.
    pub async fn open_route(&self, token: &str) -> Result<ChatId> {
        match ChatRoute::parse(token) {
            ChatRoute::Durable(id) => {
                if self.store.snapshot().conversation(&id).is_none() {
                    self.refresh().await?;
                }
                self.select_chat(&id).await?;
                Ok(id)
            }
            ChatRoute::NewFacility(facility_id) => {
                let existing = self
                    .store
                    .snapshot()
                    .conversation_for_facility(&facility_id)
                    .map(|c| c.id.clone());
                if let Some(id) = existing {
                    self.select_chat(&id).await?;
                    return Ok(id);
                }

                match self.api.admin_chat(&facility_id).await {
                    Ok(conversation) => {
                        let id = conversation.id.clone();
                        self.store.upsert(conversation)?;
                        self.select_chat(&id).await?;
                        Ok(id)
                    }
                    Err(e) => {
                        // Offline or brand-new facility: compose against a
                        // placeholder; the first send creates the real one.
                        debug!(facility = %facility_id, error = %e, "Falling back to placeholder");
                        self.select_facility(FacilityRef {
                            name: facility_id.to_string(),
                            id: facility_id,
                        })
                        .await
                    }
                }
            }
        }
    }

    /// Make a loaded conversation active: leave the old room, join the new
    /// one, clear the local unread counter, and push a read receipt.
    pub async fn select_chat(&self, id: &ChatId) -> Result<()> {
        let previous = self.store.snapshot().active.clone();
        if previous.as_ref() == Some(id) {
            return Ok(());
        }
        self.store.select_active(id)?;
        self.typing.conversation_switched();

        if let Some(previous) = previous.filter(|c| !c.is_synthetic()) {
            let _ = self.socket.leave(previous).await;
        }
        if !id.is_synthetic() {
            let _ = self.socket.join(id.clone()).await;
            self.store.mark_read(id, self.store.role())?;
            self.spawn_read_receipt(id.clone());
        }
        Ok(())
    }

    /// Open (or synthesize) the conversation for a facility and make it
    /// active. Returns the id that became active.
    pub async fn select_facility(&self, facility: FacilityRef) -> Result<ChatId> {
        let id = self.store.select_facility(facility)?;
        self.typing.conversation_switched();
        if !id.is_synthetic() {
            let _ = self.socket.join(id.clone()).await;
        }
        Ok(id)
    }

    pub fn clear_active(&self) -> Result<()> {
        self.typing.conversation_switched();
        Ok(self.store.clear_active()?)
    }

    // ---- Messaging -----------------------------------------------------

    /// Send a text message. Returns the conversation id the message landed
    /// in, which differs from `chat_id` when the send created the
    /// conversation.
    pub async fn send_message(&self, chat_id: &ChatId, body: &str) -> Result<ChatId> {
        self.pipeline.send_text(chat_id, body).await
    }

    /// Send a message carrying a file.
    pub async fn send_file(
        &self,
        chat_id: &ChatId,
        body: &str,
        upload: AttachmentUpload,
    ) -> Result<ChatId> {
        self.pipeline.send_file(chat_id, body, upload).await
    }

    /// Retry a failed send.
    pub async fn retry_message(&self, chat_id: &ChatId, local_id: Uuid) -> Result<ChatId> {
        self.pipeline.retry(chat_id, local_id).await
    }

    /// Record a composer keystroke for the typing indicator.
    pub fn notify_typing(&self, chat_id: &ChatId) {
        let facility = self.facility.as_ref().map(|f| f.id.clone());
        self.typing.keystroke(chat_id.clone(), facility);
    }

    /// Clear the unread counter and push a read receipt.
    pub async fn mark_as_read(&self, chat_id: &ChatId) -> Result<()> {
        if chat_id.is_synthetic() {
            return Ok(());
        }
        self.store.mark_read(chat_id, self.store.role())?;
        if self.socket.is_connected() {
            self.socket.mark_read(chat_id.clone()).await
        } else {
            self.api.mark_read(chat_id).await
        }
    }

    /// Change a conversation's status and priority (admin side). Applied to
    /// the store optimistically; the broadcast confirms it for everyone.
    pub async fn update_chat_status(
        &self,
        chat_id: &ChatId,
        status: ChatStatus,
        priority: Priority,
    ) -> Result<()> {
        self.store.update_status(chat_id, status, priority)?;
        if self.socket.is_connected() {
            self.socket
                .emit(ClientEvent::UpdateChatStatus(UpdateChatStatusPayload {
                    chat_id: chat_id.clone(),
                    status,
                    priority,
                }))
                .await
        } else {
            let updated: Conversation = self.api.update_status(chat_id, status, priority).await?;
            self.store.upsert(updated)?;
            Ok(())
        }
    }

    // ---- Teardown ------------------------------------------------------

    /// Stop the socket and every background task. The session is inert
    /// afterwards; build a new one on the next login.
    pub async fn shutdown(&self) {
        self.socket.shutdown().await;
        self.typing.shutdown();
        self.bridge.abort();
        info!("Chat session stopped");
    }

    fn spawn_read_receipt(&self, chat_id: ChatId) {
        // Best effort on switch; the explicit mark_as_read path reports
        // failures.
        let socket = self.socket.clone();
        let api = self.api.clone();
        tokio::spawn(async move {
            if socket.is_connected() {
                let _ = socket.mark_read(chat_id).await;
            } else {
                let _ = api.mark_read(&chat_id).await;
            }
        });
    }
}
