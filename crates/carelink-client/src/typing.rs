//! Presence and typing coordination.
//!
//! Sender side: the first keystroke emits `typing: true` once; a 1-second
//! idle timer, reset on every keystroke, emits `typing: false` when it
//! fires. Receiver side: each typing broadcast arms a 3-second safety timer
//! that clears the indicator if no refresh arrives, so a lost stop event
//! cannot leave a stuck "is typing…" flag.
//!
//! All timers are owned tasks, aborted on conversation switch and teardown
//! so they never outlive the state they would mutate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use carelink_net::SocketHandle;
use carelink_shared::constants::{TYPING_CLEAR_MS, TYPING_IDLE_MS};
use carelink_shared::protocol::{ClientEvent, TypingPayload};
use carelink_shared::{ChatId, FacilityId};

/// Ephemeral typing flags published to the UI. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct TypingState {
    /// Conversations with the remote side currently typing.
    chats: HashSet<ChatId>,
    /// Facilities currently typing, with display names, for the admin list
    /// view (covers conversations that are not the active one).
    facilities: HashMap<FacilityId, String>,
}

impl TypingState {
    pub fn is_typing_in(&self, chat: &ChatId) -> bool {
        self.chats.contains(chat)
    }

    pub fn typing_facilities(&self) -> &HashMap<FacilityId, String> {
        &self.facilities
    }
}

#[derive(Default)]
struct Inner {
    /// The conversation we have an un-stopped `typing: true` out for.
    typing_chat: Option<(ChatId, Option<FacilityId>)>,
    idle_timer: Option<JoinHandle<()>>,

    /// Filenames with uploads in flight; typing is suppressed while any
    /// upload is active.
    uploads: HashSet<String>,

    state: TypingState,
    /// One forced-clear timer per conversation; clearing the chat entry
    /// also clears its facility entry.
    chat_timers: HashMap<ChatId, JoinHandle<()>>,
}

/// Owns typing timers and the published [`TypingState`].
pub struct TypingCoordinator {
    socket: SocketHandle,
    tx: watch::Sender<TypingState>,
    inner: Mutex<Inner>,
}

impl TypingCoordinator {
    pub fn new(socket: SocketHandle) -> Arc<Self> {
        let (tx, _) = watch::channel(TypingState::default());
        Arc::new(Self {
            socket,
            tx,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<TypingState> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> TypingState {
        self.tx.borrow().clone()
    }

    /// Record a keystroke in the composer for `chat_id`.
    ///
    /// Emits `typing: true` on the first keystroke of a burst and resets
    /// the idle timer; the stop is emitted by the timer, never directly.
    pub fn keystroke(self: &Arc<Self>, chat_id: ChatId, facility_id: Option<FacilityId>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if !inner.uploads.is_empty() {
            return;
        }

        let same_chat = matches!(&inner.typing_chat, Some((c, _)) if c == &chat_id);
        if !same_chat {
            if let Some((prev, prev_facility)) = inner.typing_chat.take() {
                self.spawn_emit(prev, prev_facility, false);
            }
            inner.typing_chat = Some((chat_id.clone(), facility_id.clone()));
            self.spawn_emit(chat_id, facility_id, true);
        }

        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        let this = Arc::clone(self);
        inner.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(TYPING_IDLE_MS)).await;
            this.idle_elapsed();
        }));
    }

    /// Apply a remote typing broadcast.
    pub fn remote_typing(
        self: &Arc<Self>,
        chat_id: ChatId,
        is_typing: bool,
        facility: Option<(FacilityId, Option<String>)>,
    ) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if is_typing {
            inner.state.chats.insert(chat_id.clone());
            if let Some((facility_id, name)) = &facility {
                let display = name.clone().unwrap_or_else(|| facility_id.to_string());
                inner.state.facilities.insert(facility_id.clone(), display);
            }

            // Arm (or re-arm) the forced-clear timers.
            let this = Arc::clone(self);
            let chat = chat_id.clone();
            let facility_id = facility.as_ref().map(|(id, _)| id.clone());
            if let Some(old) = inner.chat_timers.insert(
                chat_id.clone(),
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(TYPING_CLEAR_MS)).await;
                    this.clear_remote(chat, facility_id);
                }),
            ) {
                old.abort();
            }
        } else {
            inner.state.chats.remove(&chat_id);
            if let Some(timer) = inner.chat_timers.remove(&chat_id) {
                timer.abort();
            }
            if let Some((facility_id, _)) = &facility {
                inner.state.facilities.remove(facility_id);
            }
        }
        // send_replace keeps the value fresh for `state()` even before the
        // UI subscribes.
        self.tx.send_replace(inner.state.clone());
    }

    /// The active conversation changed: stop any outstanding typing signal
    /// and cancel the idle timer so it cannot fire against the old chat.
    pub fn conversation_switched(self: &Arc<Self>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        if let Some((chat, facility)) = inner.typing_chat.take() {
            self.spawn_emit(chat, facility, false);
        }
    }

    /// Gate typing while `file_name` uploads.
    pub fn begin_upload(&self, file_name: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.uploads.insert(file_name.to_string());
        }
    }

    pub fn end_upload(&self, file_name: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.uploads.remove(file_name);
        }
    }

    /// Cancel every timer and reset the published state.
    pub fn shutdown(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        for (_, timer) in inner.chat_timers.drain() {
            timer.abort();
        }
        inner.typing_chat = None;
        inner.uploads.clear();
        inner.state = TypingState::default();
        self.tx.send_replace(TypingState::default());
    }

    fn idle_elapsed(self: &Arc<Self>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.idle_timer = None;
        if let Some((chat, facility)) = inner.typing_chat.take() {
            debug!(chat = %chat, "Typing idle window elapsed");
            self.spawn_emit(chat, facility, false);
        }
    }

    fn clear_remote(self: &Arc<Self>, chat_id: ChatId, facility_id: Option<FacilityId>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        debug!(chat = %chat_id, "Forcing typing indicator clear");
        inner.state.chats.remove(&chat_id);
        inner.chat_timers.remove(&chat_id);
        if let Some(facility_id) = facility_id {
            inner.state.facilities.remove(&facility_id);
        }
        self.tx.send_replace(inner.state.clone());
    }

    fn spawn_emit(&self, chat_id: ChatId, facility_id: Option<FacilityId>, is_typing: bool) {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            // Best effort: while disconnected the signal is simply lost,
            // which the receiver's forced-clear timer already tolerates.
            let _ = socket
                .emit(ClientEvent::Typing(TypingPayload {
                    chat_id,
                    is_typing,
                    facility_id,
                }))
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_net::SocketCommand;
    use tokio::sync::mpsc;

    fn stub_socket() -> (Arc<TypingCoordinator>, mpsc::Receiver<SocketCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (_connected_tx, connected_rx) = watch::channel(true);
        let handle = SocketHandle::from_parts(cmd_tx, connected_rx);
        (TypingCoordinator::new(handle), cmd_rx)
    }

    fn chat() -> ChatId {
        ChatId::durable("C1")
    }

    async fn drain_typing(rx: &mut mpsc::Receiver<SocketCommand>) -> Vec<bool> {
        tokio::task::yield_now().await;
        let mut flags = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let SocketCommand::Emit(ClientEvent::Typing(p)) = cmd {
                flags.push(p.is_typing);
            }
        }
        flags
    }

    #[tokio::test(start_paused = true)]
    async fn burst_emits_one_start_and_one_stop() {
        let (coordinator, mut rx) = stub_socket();

        coordinator.keystroke(chat(), None);
        coordinator.keystroke(chat(), None);
        coordinator.keystroke(chat(), None);
        assert_eq!(drain_typing(&mut rx).await, vec![true]);

        // Quiet for longer than the idle window.
        tokio::time::sleep(Duration::from_millis(TYPING_IDLE_MS + 100)).await;
        assert_eq!(drain_typing(&mut rx).await, vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_keep_the_signal_alive() {
        let (coordinator, mut rx) = stub_socket();

        coordinator.keystroke(chat(), None);
        tokio::time::sleep(Duration::from_millis(600)).await;
        coordinator.keystroke(chat(), None);
        tokio::time::sleep(Duration::from_millis(600)).await;

        // 1.2s elapsed but never 1s of quiet: no stop yet.
        assert_eq!(drain_typing(&mut rx).await, vec![true]);

        tokio::time::sleep(Duration::from_millis(TYPING_IDLE_MS)).await;
        assert_eq!(drain_typing(&mut rx).await, vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_typing_clears_after_safety_window() {
        let (coordinator, _rx) = stub_socket();

        coordinator.remote_typing(chat(), true, None);
        assert!(coordinator.state().is_typing_in(&chat()));

        tokio::time::sleep(Duration::from_millis(TYPING_CLEAR_MS + 100)).await;
        tokio::task::yield_now().await;
        assert!(!coordinator.state().is_typing_in(&chat()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_rearms_the_safety_window() {
        let (coordinator, _rx) = stub_socket();
        let facility = FacilityId("F7".into());

        coordinator.remote_typing(chat(), true, Some((facility.clone(), Some("Lagos General".into()))));
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        coordinator.remote_typing(chat(), true, Some((facility.clone(), None)));
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        tokio::task::yield_now().await;

        // 4s total, but refreshed at 2s: still typing.
        assert!(coordinator.state().is_typing_in(&chat()));

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        tokio::task::yield_now().await;
        assert!(!coordinator.state().is_typing_in(&chat()));
        assert!(coordinator.state().typing_facilities().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_clears_immediately() {
        let (coordinator, _rx) = stub_socket();
        let facility = FacilityId("F7".into());

        coordinator.remote_typing(chat(), true, Some((facility.clone(), None)));
        coordinator.remote_typing(chat(), false, Some((facility, None)));
        assert!(!coordinator.state().is_typing_in(&chat()));
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_suppress_typing_emission() {
        let (coordinator, mut rx) = stub_socket();

        coordinator.begin_upload("scan.pdf");
        coordinator.keystroke(chat(), None);
        assert!(drain_typing(&mut rx).await.is_empty());

        coordinator.end_upload("scan.pdf");
        coordinator.keystroke(chat(), None);
        assert_eq!(drain_typing(&mut rx).await, vec![true]);
    }
}
