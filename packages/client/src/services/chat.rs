//! The authoritative chat-session collection and its reconciliation logic.
//!
//! This service owns the in-memory list of chats the user participates in.
//! All mutation goes through its operations, each of which emits a fresh
//! notification afterward; consumers only read snapshots or watch streams.
//! Locally-sent messages are appended optimistically, and server-pushed
//! messages are reconciled into the matching session as they arrive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tokio::sync::{Mutex, broadcast, mpsc, watch};

use parlor_shared::models::{ChatInfo, ChatMessage, ChatType, ClientChat, Id};
use parlor_shared::protocol::{client_events, server_events};

use crate::api::ChatApi;
use crate::audio::AudioPlayer;
use crate::error::ApiError;
use crate::scope::Scope;
use crate::services::messaging::MessagingService;
use crate::services::site_settings::SiteSettingsService;
use crate::services::socket::{SocketEvent, SocketService};

const RECEIVED_CHANNEL_CAPACITY: usize = 64;

/// A chat message that arrived over the push channel, tagged with its chat.
#[derive(Debug, Clone)]
pub struct ReceivedChatMessage {
    pub chat_id: Id,
    pub message: ChatMessage,
}

struct ChatInner {
    api: Arc<dyn ChatApi>,
    socket: SocketService,
    messaging: MessagingService,
    site_settings: SiteSettingsService,
    audio: Arc<dyn AudioPlayer>,
    chats: Mutex<Vec<ClientChat>>,
    chats_tx: watch::Sender<Vec<ClientChat>>,
    main_chat_tx: watch::Sender<Option<ClientChat>>,
    received_tx: broadcast::Sender<ReceivedChatMessage>,
    slideout_tx: watch::Sender<bool>,
    audio_in_progress: AtomicBool,
    audio_tx: watch::Sender<bool>,
    // Serializes main-chat loads so concurrent callers share one request.
    main_chat_load: Mutex<()>,
}

/// Chat collection service. Cheap to clone.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ChatInner>,
}

impl ChatService {
    /// Create the service and start its background tasks: push-message
    /// reconciliation and token-driven main-chat loading.
    pub fn new(
        scope: &Scope,
        api: Arc<dyn ChatApi>,
        socket: SocketService,
        messaging: MessagingService,
        site_settings: SiteSettingsService,
        audio: Arc<dyn AudioPlayer>,
        token: watch::Receiver<Option<String>>,
    ) -> Self {
        let (chats_tx, _) = watch::channel(Vec::new());
        let (main_chat_tx, _) = watch::channel(None);
        let (received_tx, _) = broadcast::channel(RECEIVED_CHANNEL_CAPACITY);
        let (slideout_tx, _) = watch::channel(false);
        let (audio_tx, _) = watch::channel(false);

        let service = Self {
            inner: Arc::new(ChatInner {
                api,
                socket: socket.clone(),
                messaging,
                site_settings,
                audio,
                chats: Mutex::new(Vec::new()),
                chats_tx,
                main_chat_tx,
                received_tx,
                slideout_tx,
                audio_in_progress: AtomicBool::new(false),
                audio_tx,
                main_chat_load: Mutex::new(()),
            }),
        };

        service.spawn_receive_listener(scope, socket);
        service.spawn_token_listener(scope, token);

        service
    }

    fn spawn_receive_listener(&self, scope: &Scope, socket: SocketService) {
        let listener = self.clone();
        let listener_scope = scope.clone();
        tokio::spawn(async move {
            let handler_service = listener.clone();
            socket
                .for_each_event(
                    listener_scope,
                    server_events::RECEIVE_CHAT_MESSAGE,
                    move |event| {
                        let service = handler_service.clone();
                        async move { service.on_receive_chat_message(event).await }
                    },
                )
                .await;
        });
    }

    /// Load the main chat whenever a token arrives; drop all local chat
    /// state when it goes away.
    fn spawn_token_listener(&self, scope: &Scope, mut token: watch::Receiver<Option<String>>) {
        let service = self.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            // Handle the token present at startup, then react to changes.
            if token.borrow_and_update().is_some() {
                let _ = service.get_main_chat().await;
            }
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    changed = token.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                let has_token = token.borrow_and_update().is_some();
                if has_token {
                    let _ = service.get_main_chat().await;
                } else {
                    service.clear_chats().await;
                }
            }
        });
    }

    /// Recompute the derived values and notify watchers. Called after every
    /// mutation, with the collection lock held.
    fn publish(&self, chats: &[ClientChat]) {
        self.inner.chats_tx.send_replace(chats.to_vec());
        let main = chats
            .iter()
            .filter(|c| c.chat_type == ChatType::Main)
            .max_by_key(|c| c.creation_date)
            .cloned();
        self.inner.main_chat_tx.send_replace(main);
    }

    /// Whether a chat with the given id is loaded.
    pub async fn has_chat(&self, chat_id: &Id) -> bool {
        self.inner
            .chats
            .lock()
            .await
            .iter()
            .any(|c| &c.id == chat_id)
    }

    /// Add a chat to the collection. A chat with the same id is replaced.
    pub async fn add_chat(&self, new_chat: ClientChat) {
        let mut chats = self.inner.chats.lock().await;
        match chats.iter_mut().find(|c| c.id == new_chat.id) {
            Some(existing) => *existing = new_chat,
            None => chats.push(new_chat),
        }
        self.publish(&chats);
    }

    /// Remove a chat by id. Removing an absent id is a no-op.
    pub async fn remove_chat(&self, chat_id: &Id) {
        let mut chats = self.inner.chats.lock().await;
        let before = chats.len();
        chats.retain(|c| &c.id != chat_id);
        if chats.len() != before {
            self.publish(&chats);
        }
    }

    async fn clear_chats(&self) {
        let mut chats = self.inner.chats.lock().await;
        if !chats.is_empty() {
            chats.clear();
            self.publish(&chats);
        }
    }

    /// Snapshot of the current chat collection.
    pub fn chats(&self) -> Vec<ClientChat> {
        self.inner.chats_tx.borrow().clone()
    }

    /// Watch of collection changes.
    pub fn chats_watch(&self) -> watch::Receiver<Vec<ClientChat>> {
        self.inner.chats_tx.subscribe()
    }

    /// The most recently created Main chat among those loaded, if any.
    pub fn main_chat(&self) -> Option<ClientChat> {
        self.inner.main_chat_tx.borrow().clone()
    }

    /// Watch of the derived main chat.
    pub fn main_chat_watch(&self) -> watch::Receiver<Option<ClientChat>> {
        self.inner.main_chat_tx.subscribe()
    }

    /// Fetch a chat by id from the server and add it to the collection.
    pub async fn load_chat_by_id(&self, chat_id: &Id) -> Result<ClientChat, ApiError> {
        let chat = self.inner.api.get_chat_by_id(chat_id).await?;
        self.add_chat(chat.clone()).await;
        Ok(chat)
    }

    /// Fetch the listing of all chats for the current user.
    pub async fn load_chat_listing(&self) -> Result<Vec<ChatInfo>, ApiError> {
        self.inner.api.get_chat_list().await
    }

    /// Fetch all chats of a type and merge them into the collection: the
    /// server's copy wins for ids both sides know, and local entries the
    /// server didn't return are preserved.
    pub async fn load_chats_of_type(&self, chat_type: ChatType) -> Result<Vec<ClientChat>, ApiError> {
        let loaded = self.inner.api.get_chats_of_type(chat_type).await?;
        let mut chats = self.inner.chats.lock().await;
        for chat in &loaded {
            match chats.iter_mut().find(|c| c.id == chat.id) {
                Some(existing) => *existing = chat.clone(),
                None => chats.push(chat.clone()),
            }
        }
        self.publish(&chats);
        Ok(loaded)
    }

    /// The main chat for this user. When none is loaded yet, it is fetched
    /// from the server; concurrent callers share one in-flight request.
    pub async fn get_main_chat(&self) -> Option<ClientChat> {
        if let Some(chat) = self.main_chat() {
            return Some(chat);
        }

        let _guard = self.inner.main_chat_load.lock().await;
        // Another caller may have completed the load while we waited.
        if let Some(chat) = self.main_chat() {
            return Some(chat);
        }

        match self.inner.api.get_main_chat().await {
            Ok(chat) => {
                self.add_chat(chat.clone()).await;
                self.inner.messaging.send_info("Main chat loaded.");
                Some(chat)
            }
            Err(e) => {
                tracing::error!("Failed to load the main chat: {}", e);
                self.inner
                    .messaging
                    .send_error("The main chat could not be loaded.");
                None
            }
        }
    }

    /// Ask the server to start a new main chat. The previous main chats stay
    /// in the collection; the main-chat derivation naturally picks the
    /// newest. Returns the new chat's id.
    pub async fn start_new_main_chat(&self) -> Option<Id> {
        match self.inner.api.start_new_main_chat().await {
            Ok(chat) => {
                let id = chat.id.clone();
                self.add_chat(chat).await;
                Some(id)
            }
            Err(e) => {
                tracing::error!("Failed to start a new main chat: {}", e);
                self.inner
                    .messaging
                    .send_error("An error occurred when attempting to start a new chat.");
                None
            }
        }
    }

    /// Send a user message for a chat. The message is appended locally
    /// before the server confirms, so the UI reflects it immediately; the
    /// assistant's reply arrives later through the push channel.
    ///
    /// Nothing is appended when the socket is disconnected or the chat is
    /// not loaded; those cases only produce a user-facing error.
    pub async fn send_chat_message(&self, chat_id: &Id, message: impl Into<String>) {
        if !self.inner.socket.is_connected() {
            self.inner
                .messaging
                .send_error("Unable to send AI messages. Sockets are disconnected.");
            return;
        }

        let message = message.into();
        {
            let mut chats = self.inner.chats.lock().await;
            let Some(chat) = chats.iter_mut().find(|c| &c.id == chat_id) else {
                drop(chats);
                self.inner
                    .messaging
                    .send_error("Unable to send AI messages. Chat is not loaded.");
                return;
            };
            chat.chat_messages.push(ChatMessage::user(message.clone()));
            self.publish(&chats);
        }

        let ack = self
            .inner
            .socket
            .send_message_with_response(
                client_events::SEND_CHAT_MESSAGE,
                vec![json!(chat_id), json!(message)],
            )
            .await;

        match ack {
            Some(value) if value.get("success").and_then(|v| v.as_bool()) == Some(false) => {
                let detail = value
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Your chat message could not be processed.");
                self.inner.messaging.send_error(detail.to_string());
            }
            Some(_) => {}
            None => {
                self.inner
                    .messaging
                    .send_error("Your chat message could not be delivered.");
            }
        }
    }

    /// Handle a pushed `receiveChatMessage(chatId, message)` event.
    async fn on_receive_chat_message(&self, event: SocketEvent) {
        let mut args = event.args.into_iter();
        let chat_id = args
            .next()
            .and_then(|v| serde_json::from_value::<Id>(v).ok());
        let message = args
            .next()
            .and_then(|v| serde_json::from_value::<ChatMessage>(v).ok());
        let (Some(chat_id), Some(message)) = (chat_id, message) else {
            tracing::warn!("Malformed receiveChatMessage event; dropping");
            return;
        };
        self.apply_received_message(chat_id, message).await;
    }

    /// Append a server-pushed message to the matching session. A message for
    /// a chat that is not loaded is dropped with a warning; one bad event
    /// must never interrupt the stream or grow the collection.
    pub(crate) async fn apply_received_message(&self, chat_id: Id, message: ChatMessage) {
        let mut chats = self.inner.chats.lock().await;
        let Some(chat) = chats.iter_mut().find(|c| c.id == chat_id) else {
            tracing::warn!(
                "Received a chat message for chat '{}', which is not loaded; dropping",
                chat_id
            );
            return;
        };
        chat.chat_messages.push(message.clone());
        self.publish(&chats);
        drop(chats);

        let _ = self
            .inner
            .received_tx
            .send(ReceivedChatMessage { chat_id, message });
    }

    /// Subscribe to every pushed chat message, regardless of chat.
    pub fn received_messages(&self) -> broadcast::Receiver<ReceivedChatMessage> {
        self.inner.received_tx.subscribe()
    }

    /// Stream of pushed messages for one chat id.
    pub fn subscribe_to_messages_from(
        &self,
        scope: &Scope,
        chat_id: Id,
    ) -> mpsc::UnboundedReceiver<ChatMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = self.received_messages();
        let scope = scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    received = source.recv() => match received {
                        Ok(received) if received.chat_id == chat_id => {
                            if tx.send(received.message).is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Chat message subscriber lagged by {}", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
        rx
    }

    /// Whether the chat slideout panel is open.
    pub fn is_chat_slideout_open(&self) -> bool {
        *self.inner.slideout_tx.borrow()
    }

    /// Open or close the chat slideout panel.
    pub fn set_chat_slideout_open(&self, open: bool) {
        self.inner.slideout_tx.send_replace(open);
    }

    /// Watch of the slideout flag.
    pub fn slideout_watch(&self) -> watch::Receiver<bool> {
        self.inner.slideout_tx.subscribe()
    }

    /// Whether an audio request is currently in flight.
    pub fn is_audio_request_in_progress(&self) -> bool {
        self.inner.audio_in_progress.load(Ordering::Acquire)
    }

    /// Watch of the audio-in-progress flag.
    pub fn audio_in_progress_watch(&self) -> watch::Receiver<bool> {
        self.inner.audio_tx.subscribe()
    }

    /// Ask the server to render `text` as audio, then play it. Only one
    /// request may be in flight: a second call is rejected immediately with
    /// a user-facing message and does not disturb the first.
    pub async fn request_audio(&self, text: impl Into<String>) {
        if !self.inner.site_settings.settings().allow_audio_chat {
            self.inner
                .messaging
                .send_error("Audio chat is not enabled on this site.");
            return;
        }

        if self
            .inner
            .audio_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.inner
                .messaging
                .send_error("An audio request is already in progress.");
            return;
        }
        self.inner.audio_tx.send_replace(true);

        self.perform_audio_request(text.into()).await;

        self.inner.audio_in_progress.store(false, Ordering::Release);
        self.inner.audio_tx.send_replace(false);
    }

    async fn perform_audio_request(&self, text: String) {
        let ack = self
            .inner
            .socket
            .send_message_with_response(client_events::SEND_AUDIO_REQUEST, vec![json!(text)])
            .await;

        let Some(file_token) = ack.as_ref().and_then(|v| v.as_str()) else {
            self.inner
                .messaging
                .send_error("The audio request could not be completed.");
            return;
        };

        if let Err(e) = self.inner.audio.play(file_token).await {
            tracing::error!("Audio playback failed: {}", e);
            self.inner
                .messaging
                .send_error("The audio response could not be played.");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_audio_in_progress_for_test(&self, value: bool) {
        self.inner.audio_in_progress.store(value, Ordering::Release);
        self.inner.audio_tx.send_replace(value);
    }
}
