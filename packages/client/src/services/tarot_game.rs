//! Tarot game collection and its socket interactions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, watch};

use parlor_shared::models::{ChatType, ClientChat, Id, TarotCardReference, TarotGame};
use parlor_shared::protocol::{client_events, server_events};

use crate::api::ChatApi;
use crate::error::ApiError;
use crate::scope::Scope;
use crate::services::chat::ChatService;
use crate::services::socket::{SocketEvent, SocketService};

/// How long a flipped card stays unobstructed before the chat slideout
/// comes back.
const CARD_REVEAL_SLIDEOUT_DELAY_SECS: u64 = 6;

struct TarotGameInner {
    api: Arc<dyn ChatApi>,
    socket: SocketService,
    chat_service: ChatService,
    games: Mutex<Vec<TarotGame>>,
    games_tx: watch::Sender<Vec<TarotGame>>,
    is_loading_games: AtomicBool,
    is_loading_chats: AtomicBool,
}

/// Owns the in-memory list of the user's tarot games, kept current from the
/// REST collaborator and the card-flip push event.
#[derive(Clone)]
pub struct TarotGameService {
    inner: Arc<TarotGameInner>,
}

impl TarotGameService {
    /// Create the service and start the card-flip listener. The caller is
    /// expected to run [`load_tarot_games`](Self::load_tarot_games) and
    /// [`load_tarot_chats`](Self::load_tarot_chats) once a token is
    /// available.
    pub fn new(
        scope: &Scope,
        api: Arc<dyn ChatApi>,
        socket: SocketService,
        chat_service: ChatService,
    ) -> Self {
        let (games_tx, _) = watch::channel(Vec::new());
        let service = Self {
            inner: Arc::new(TarotGameInner {
                api,
                socket: socket.clone(),
                chat_service,
                games: Mutex::new(Vec::new()),
                games_tx,
                is_loading_games: AtomicBool::new(false),
                is_loading_chats: AtomicBool::new(false),
            }),
        };

        let listener = service.clone();
        let listener_scope = scope.clone();
        tokio::spawn(async move {
            let handler_service = listener.clone();
            socket
                .for_each_event(
                    listener_scope,
                    server_events::RECEIVE_TAROT_CARD_FLIP,
                    move |event| {
                        let service = handler_service.clone();
                        async move { service.on_card_flip(event).await }
                    },
                )
                .await;
        });

        service
    }

    /// Snapshot of the current games.
    pub fn games(&self) -> Vec<TarotGame> {
        self.inner.games_tx.borrow().clone()
    }

    /// Watch of games-collection changes.
    pub fn games_watch(&self) -> watch::Receiver<Vec<TarotGame>> {
        self.inner.games_tx.subscribe()
    }

    pub fn is_loading_games(&self) -> bool {
        self.inner.is_loading_games.load(Ordering::Acquire)
    }

    pub fn is_loading_chats(&self) -> bool {
        self.inner.is_loading_chats.load(Ordering::Acquire)
    }

    /// Add a game to the collection. A game with the same id is replaced.
    pub async fn add_game(&self, game: TarotGame) {
        let mut games = self.inner.games.lock().await;
        match games.iter_mut().find(|g| g.id == game.id) {
            Some(existing) => *existing = game,
            None => games.push(game),
        }
        self.inner.games_tx.send_replace(games.clone());
    }

    /// Remove a game by id. Removing an absent id is a no-op.
    pub async fn remove_game(&self, game_id: &Id) {
        let mut games = self.inner.games.lock().await;
        let before = games.len();
        games.retain(|g| &g.id != game_id);
        if games.len() != before {
            self.inner.games_tx.send_replace(games.clone());
        }
    }

    /// Fetch all games from the server and overwrite the local collection.
    pub async fn load_tarot_games(&self) -> Result<Vec<TarotGame>, ApiError> {
        self.inner.is_loading_games.store(true, Ordering::Release);
        let result = self.inner.api.get_tarot_games().await;
        self.inner.is_loading_games.store(false, Ordering::Release);

        let loaded = result?;
        let mut games = self.inner.games.lock().await;
        *games = loaded.clone();
        self.inner.games_tx.send_replace(games.clone());
        Ok(loaded)
    }

    /// Load the tarot chats into the chat service.
    pub async fn load_tarot_chats(&self) -> Result<(), ApiError> {
        self.inner.is_loading_chats.store(true, Ordering::Release);
        let result = self
            .inner
            .chat_service
            .load_chats_of_type(ChatType::TarotGame)
            .await;
        self.inner.is_loading_chats.store(false, Ordering::Release);
        result.map(|_| ())
    }

    /// Ask the server to start a new tarot game. The server answers with the
    /// new game and its chat; both are added locally. Resolves to `None`
    /// when the socket is unavailable or the answer is malformed.
    pub async fn create_new_game(&self) -> Option<TarotGame> {
        let ack = self
            .inner
            .socket
            .send_message_with_response(client_events::SEND_START_TAROT_GAME, vec![])
            .await?;
        self.apply_new_game(ack).await
    }

    /// Unpack a `{tarotChat, game}` answer and add both records.
    pub(crate) async fn apply_new_game(&self, answer: Value) -> Option<TarotGame> {
        let chat = answer
            .get("tarotChat")
            .cloned()
            .and_then(|v| serde_json::from_value::<ClientChat>(v).ok());
        let game = answer
            .get("game")
            .cloned()
            .and_then(|v| serde_json::from_value::<TarotGame>(v).ok());
        let (Some(chat), Some(game)) = (chat, game) else {
            tracing::error!("Malformed sendStartTarotGame answer; ignoring");
            return None;
        };

        self.inner.chat_service.add_chat(chat).await;
        self.add_game(game.clone()).await;
        Some(game)
    }

    /// Handle a pushed `receiveTarotCardFlip(gameId, cardReference)` event.
    async fn on_card_flip(&self, event: SocketEvent) {
        let mut args = event.args.into_iter();
        let game_id = args
            .next()
            .and_then(|v| serde_json::from_value::<Id>(v).ok());
        let card = args
            .next()
            .and_then(|v| serde_json::from_value::<TarotCardReference>(v).ok());
        let (Some(game_id), Some(card)) = (game_id, card) else {
            tracing::warn!("Malformed receiveTarotCardFlip event; dropping");
            return;
        };
        self.apply_card_flip(game_id, card).await;
    }

    /// Append a flipped card to the matching game. A flip for a game that is
    /// not loaded is dropped with an error log.
    pub(crate) async fn apply_card_flip(&self, game_id: Id, card: TarotCardReference) {
        {
            let mut games = self.inner.games.lock().await;
            let Some(game) = games.iter_mut().find(|g| g.id == game_id) else {
                tracing::error!(
                    "Received a tarot card for game '{}', which is not in the game list",
                    game_id
                );
                return;
            };
            game.cards_picked.push(card);
            self.inner.games_tx.send_replace(games.clone());
        }

        // Get the slideout out of the way so the user sees the flip, then
        // bring it back once the reveal has had its moment.
        if self.inner.chat_service.is_chat_slideout_open() {
            self.inner.chat_service.set_chat_slideout_open(false);
            let chat_service = self.inner.chat_service.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(CARD_REVEAL_SLIDEOUT_DELAY_SECS)).await;
                chat_service.set_chat_slideout_open(true);
            });
        }
    }

    /// Delete a game on the server, then drop it and its chat locally.
    pub async fn delete_tarot_game(&self, game_id: &Id) -> Result<(), ApiError> {
        let game = self
            .games()
            .into_iter()
            .find(|g| &g.id == game_id);
        let Some(game) = game else {
            tracing::error!("Could not find the game to delete.");
            return Ok(());
        };

        self.inner.api.delete_game_by_id(game_id).await?;

        self.remove_game(game_id).await;
        self.inner.chat_service.remove_chat(&game.game_chat_id).await;
        Ok(())
    }
}
