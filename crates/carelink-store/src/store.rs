//! Conversation state tracking.
//!
//! Maintains the set of conversations (the single one, on the facility
//! side), the active selection, ordered message lists, and unread counters.
//! Mutations are serialized behind one lock and published as immutable
//! snapshots; only the send pipeline and the socket bridge write here.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use carelink_shared::{
    ChatId, ChatStatus, Conversation, Delivery, FacilityId, FacilityRef, Message, Priority, Role,
    UserId,
};

use crate::error::{Result, StoreError};

/// Immutable view of the session's conversation state.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Conversations ordered by last activity, newest first.
    pub conversations: Vec<Conversation>,
    /// The conversation currently open in the UI.
    pub active: Option<ChatId>,
}

impl Snapshot {
    pub fn conversation(&self, id: &ChatId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn conversation_for_facility(&self, facility: &FacilityId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.facility.id == facility)
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.conversation(id))
    }

    /// Total unread messages for one side, across all conversations.
    pub fn unread_total(&self, role: Role) -> u32 {
        self.conversations
            .iter()
            .map(|c| c.unread.for_role(role))
            .sum()
    }

    fn conversation_mut(&mut self, id: &ChatId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    }
}

/// The store itself. One instance per authenticated session.
pub struct ConversationStore {
    local_user: UserId,
    role: Role,
    state: Mutex<Snapshot>,
    tx: watch::Sender<Arc<Snapshot>>,
}

impl ConversationStore {
    pub fn new(local_user: UserId, role: Role) -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            local_user,
            role,
            state: Mutex::new(Snapshot::default()),
            tx,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    /// Replace the conversation set from a list fetch.
    ///
    /// The active conversation's live message list survives the refresh:
    /// list endpoints return conversations without (or with stale) message
    /// bodies, and overwriting would discard optimistic local state.
    pub fn load_all(&self, chats: Vec<Conversation>) -> Result<()> {
        self.mutate(|snap| {
            let preserved: Option<(ChatId, Vec<Message>)> = snap
                .active_conversation()
                .map(|c| (c.id.clone(), c.messages.clone()));

            snap.conversations = chats;
            if let Some((active_id, messages)) = preserved {
                if let Some(conv) = snap.conversation_mut(&active_id) {
                    if conv.messages.len() < messages.len() {
                        conv.messages = messages;
                    }
                }
            }
            snap.sort();
            Ok(())
        })
    }

    /// Insert or replace one conversation, keyed by facility.
    ///
    /// At most one conversation exists per facility, so a fetched durable
    /// conversation replaces any synthetic placeholder for the same
    /// facility; the placeholder's optimistic messages are carried over.
    pub fn upsert(&self, conversation: Conversation) -> Result<()> {
        self.mutate(|snap| {
            let facility = conversation.facility.id.clone();
            let mut incoming = conversation;

            if let Some(pos) = snap
                .conversations
                .iter()
                .position(|c| c.facility.id == facility)
            {
                let existing = snap.conversations.remove(pos);
                if incoming.messages.is_empty() {
                    incoming.messages = existing.messages;
                }
                if snap.active.as_ref() == Some(&existing.id) {
                    snap.active = Some(incoming.id.clone());
                }
            }
            snap.conversations.push(incoming);
            snap.sort();
            Ok(())
        })
    }

    /// Make an already-loaded conversation the active one.
    pub fn select_active(&self, id: &ChatId) -> Result<()> {
        self.mutate(|snap| {
            if snap.conversation(id).is_none() {
                return Err(StoreError::UnknownChat(id.clone()));
            }
            snap.active = Some(id.clone());
            Ok(())
        })
    }

    /// Select a facility, synthesizing a placeholder conversation when none
    /// exists yet. Returns the id that became active.
    pub fn select_facility(&self, facility: FacilityRef) -> Result<ChatId> {
        self.mutate(|snap| {
            if let Some(existing) = snap.conversation_for_facility(&facility.id) {
                let id = existing.id.clone();
                snap.active = Some(id.clone());
                return Ok(id);
            }
            let placeholder = Conversation::placeholder(facility);
            let id = placeholder.id.clone();
            debug!(chat = %id, "Synthesized placeholder conversation");
            snap.conversations.push(placeholder);
            snap.sort();
            snap.active = Some(id.clone());
            Ok(id)
        })
    }

    pub fn clear_active(&self) -> Result<()> {
        self.mutate(|snap| {
            snap.active = None;
            Ok(())
        })
    }

    /// Apply a broadcast message.
    ///
    /// Returns `false` when the message is an echo of our own send (the
    /// server fans broadcasts out to all room members, sender included) —
    /// the optimistic insert already covers it, so appending again would
    /// duplicate the entry.
    ///
    /// For the active conversation the message is appended; for any other
    /// conversation the local side's unread counter is bumped. Last-activity
    /// moves either way so list ordering stays fresh.
    pub fn append_incoming(
        &self,
        chat_id: &ChatId,
        message: Message,
        unread_hint: Option<u32>,
    ) -> Result<bool> {
        if message.is_from(&self.local_user) {
            debug!(chat = %chat_id, "Suppressing echo of own message");
            return Ok(false);
        }
        self.mutate(|snap| {
            let is_active = snap.active.as_ref() == Some(chat_id);
            let role = self.role;
            let Some(conv) = snap.conversation_mut(chat_id) else {
                // Not loaded (e.g. brand-new facility chat on the admin
                // side); the next list refresh picks it up.
                debug!(chat = %chat_id, "Dropping message for unloaded conversation");
                return Ok(false);
            };

            conv.last_activity = message.timestamp.max(conv.last_activity);
            if is_active {
                conv.messages.push(message);
            } else {
                match unread_hint {
                    Some(count) => match role {
                        Role::Admin => conv.unread.admin = count,
                        Role::Facility => conv.unread.facility = count,
                    },
                    None => conv.unread.bump(role),
                }
            }
            snap.sort();
            Ok(true)
        })
    }

    /// Optimistic local insert. Returns the index the message landed at.
    pub fn insert_pending(&self, chat_id: &ChatId, message: Message) -> Result<usize> {
        self.mutate(|snap| {
            let conv = snap
                .conversation_mut(chat_id)
                .ok_or_else(|| StoreError::UnknownChat(chat_id.clone()))?;
            conv.messages.push(message);
            conv.last_activity = Utc::now();
            let index = conv.messages.len() - 1;
            snap.sort();
            Ok(index)
        })
    }

    /// Replace a pending placeholder with the server's canonical message,
    /// in place at its existing index. The local id is preserved so later
    /// operations (retry, receipts) still resolve.
    pub fn reconcile_sent(
        &self,
        chat_id: &ChatId,
        local_id: Uuid,
        server_message: Message,
    ) -> Result<()> {
        self.mutate(|snap| {
            let conv = snap
                .conversation_mut(chat_id)
                .ok_or_else(|| StoreError::UnknownChat(chat_id.clone()))?;
            let slot = conv
                .messages
                .iter_mut()
                .find(|m| m.local_id == local_id)
                .ok_or_else(|| StoreError::UnknownMessage {
                    chat_id: chat_id.clone(),
                    local_id,
                })?;

            let mut merged = server_message;
            merged.local_id = local_id;
            merged.delivery = Delivery::Sent;
            // The server URL replaces the local blob preview.
            if let Some(attachment) = merged.kind.attachment_mut() {
                attachment.local_preview = None;
            }
            *slot = merged;
            Ok(())
        })
    }

    /// Reconcile a socket acknowledgment against the oldest pending own
    /// message in the conversation.
    ///
    /// The `message-sent` ack does not echo the client's local id, so the
    /// match is positional: sends are acknowledged in dispatch order on a
    /// single connection. Returns the local id that was reconciled.
    pub fn reconcile_next_pending(&self, chat_id: &ChatId, server_message: Message) -> Result<Uuid> {
        let local_id = {
            let snapshot = self.snapshot();
            let conv = snapshot
                .conversation(chat_id)
                .ok_or_else(|| StoreError::UnknownChat(chat_id.clone()))?;
            conv.messages
                .iter()
                .find(|m| m.delivery == Delivery::Pending && m.is_from(&self.local_user))
                .map(|m| m.local_id)
                .ok_or_else(|| StoreError::UnknownMessage {
                    chat_id: chat_id.clone(),
                    local_id: Uuid::nil(),
                })?
        };
        self.reconcile_sent(chat_id, local_id, server_message)?;
        Ok(local_id)
    }

    /// Mark a pending message as failed, keeping it visible for retry.
    pub fn fail_message(&self, chat_id: &ChatId, local_id: Uuid) -> Result<()> {
        self.set_delivery(chat_id, local_id, Delivery::Failed)
    }

    /// Put a failed message back into pending for a retry attempt.
    pub fn retry_pending(&self, chat_id: &ChatId, local_id: Uuid) -> Result<()> {
        self.set_delivery(chat_id, local_id, Delivery::Pending)
    }

    /// Roll back an optimistic insert (failed text sends).
    pub fn remove_message(&self, chat_id: &ChatId, local_id: Uuid) -> Result<()> {
        self.mutate(|snap| {
            let conv = snap
                .conversation_mut(chat_id)
                .ok_or_else(|| StoreError::UnknownChat(chat_id.clone()))?;
            let before = conv.messages.len();
            conv.messages.retain(|m| m.local_id != local_id);
            if conv.messages.len() == before {
                return Err(StoreError::UnknownMessage {
                    chat_id: chat_id.clone(),
                    local_id,
                });
            }
            Ok(())
        })
    }

    /// Look up a message by local id (used to rebuild a retry).
    pub fn message(&self, chat_id: &ChatId, local_id: Uuid) -> Option<Message> {
        self.snapshot()
            .conversation(chat_id)?
            .messages
            .iter()
            .find(|m| m.local_id == local_id)
            .cloned()
    }

    /// Promote a synthetic conversation to its server-issued id.
    ///
    /// A single atomic replace: the entry keeps its position and message
    /// list, the active selection follows, and no stale synthetic entry is
    /// left behind. If a durable entry already arrived through a list
    /// refresh, the two are merged instead of coexisting.
    pub fn promote(&self, synthetic: &ChatId, durable: ChatId) -> Result<()> {
        self.mutate(|snap| {
            let pos = snap
                .conversations
                .iter()
                .position(|c| &c.id == synthetic)
                .ok_or_else(|| StoreError::UnknownChat(synthetic.clone()))?;

            if let Some(existing) = snap
                .conversations
                .iter()
                .position(|c| c.id == durable)
                .filter(|&i| i != pos)
            {
                // Race with a refresh: fold the placeholder's messages into
                // the durable entry and drop the placeholder.
                let placeholder = snap.conversations.remove(pos);
                let target_pos = if existing > pos { existing - 1 } else { existing };
                let target = &mut snap.conversations[target_pos];
                for message in placeholder.messages {
                    let already = message.server_id.is_some()
                        && target
                            .messages
                            .iter()
                            .any(|m| m.server_id == message.server_id);
                    if !already {
                        target.messages.push(message);
                    }
                }
            } else {
                snap.conversations[pos].id = durable.clone();
            }

            if snap.active.as_ref() == Some(synthetic) {
                snap.active = Some(durable.clone());
            }
            debug!(from = %synthetic, to = %durable, "Promoted conversation");
            Ok(())
        })
    }

    /// Apply a status/priority change to the list entry (and, implicitly,
    /// the active header — they are the same entry).
    pub fn update_status(
        &self,
        chat_id: &ChatId,
        status: ChatStatus,
        priority: Priority,
    ) -> Result<()> {
        self.mutate(|snap| {
            let conv = snap
                .conversation_mut(chat_id)
                .ok_or_else(|| StoreError::UnknownChat(chat_id.clone()))?;
            conv.status = status;
            conv.priority = priority;
            Ok(())
        })
    }

    /// Clear the unread counter for one side of a conversation.
    pub fn mark_read(&self, chat_id: &ChatId, role: Role) -> Result<()> {
        self.mutate(|snap| {
            let conv = snap
                .conversation_mut(chat_id)
                .ok_or_else(|| StoreError::UnknownChat(chat_id.clone()))?;
            conv.unread.clear(role);
            Ok(())
        })
    }

    /// Merge an older history page in front of the current list, skipping
    /// messages already present (by server id).
    pub fn prepend_history(&self, chat_id: &ChatId, older: Vec<Message>) -> Result<()> {
        self.mutate(|snap| {
            let conv = snap
                .conversation_mut(chat_id)
                .ok_or_else(|| StoreError::UnknownChat(chat_id.clone()))?;
            let fresh: Vec<Message> = older
                .into_iter()
                .filter(|m| {
                    m.server_id.is_none()
                        || !conv.messages.iter().any(|e| e.server_id == m.server_id)
                })
                .collect();
            conv.messages.splice(0..0, fresh);
            Ok(())
        })
    }

    fn set_delivery(&self, chat_id: &ChatId, local_id: Uuid, delivery: Delivery) -> Result<()> {
        self.mutate(|snap| {
            let conv = snap
                .conversation_mut(chat_id)
                .ok_or_else(|| StoreError::UnknownChat(chat_id.clone()))?;
            let message = conv
                .messages
                .iter_mut()
                .find(|m| m.local_id == local_id)
                .ok_or_else(|| StoreError::UnknownMessage {
                    chat_id: chat_id.clone(),
                    local_id,
                })?;
            message.delivery = delivery;
            Ok(())
        })
    }

    /// Run one mutation under the lock and publish the resulting snapshot.
    /// Failed mutations publish nothing, so subscribers only ever see
    /// applied states. `send_replace` keeps the watch value current even
    /// while no subscriber exists; `snapshot()` reads through the same
    /// channel.
    fn mutate<R>(&self, f: impl FnOnce(&mut Snapshot) -> Result<R>) -> Result<R> {
        let mut guard: MutexGuard<'_, Snapshot> =
            self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let mut working = guard.clone();
        let result = f(&mut working)?;
        *guard = working.clone();
        self.tx.send_replace(Arc::new(working));
        Ok(result)
    }
}
