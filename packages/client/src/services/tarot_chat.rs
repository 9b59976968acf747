//! Derived views joining the selected tarot game to its records.

use std::sync::Arc;

use tokio::sync::watch;

use parlor_shared::models::{ClientChat, EntityKey, TarotGame};

use crate::readonly::ReadonlySubject;
use crate::scope::Scope;
use crate::services::chat::ChatService;
use crate::services::tarot_game::TarotGameService;

/// Tracks which tarot game the user is looking at and keeps two derived
/// values current: the selected [`TarotGame`] record and the [`ClientChat`]
/// attached to it. Both recompute whenever the selection, the game
/// collection, or the chat collection changes; a selection of
/// [`EntityKey::New`] (or one that matches nothing loaded) derives to
/// nothing.
#[derive(Clone)]
pub struct TarotChatService {
    selected_tx: Arc<watch::Sender<Option<EntityKey>>>,
    current_game: ReadonlySubject<TarotGame>,
    current_game_chat: ReadonlySubject<ClientChat>,
}

impl TarotChatService {
    pub fn new(scope: &Scope, games: TarotGameService, chats: ChatService) -> Self {
        let (selected_tx, _) = watch::channel(None);
        let selected_tx = Arc::new(selected_tx);
        let (game_tx, current_game) = ReadonlySubject::channel();
        let (chat_tx, current_game_chat) = ReadonlySubject::channel();

        let scope = scope.clone();
        let mut selected_rx = selected_tx.subscribe();
        let mut games_rx = games.games_watch();
        let mut chats_rx = chats.chats_watch();
        tokio::spawn(async move {
            loop {
                let selected = selected_rx.borrow_and_update().clone();
                let games = games_rx.borrow_and_update().clone();
                let chat_list = chats_rx.borrow_and_update().clone();

                let game = selected
                    .as_ref()
                    .and_then(EntityKey::id)
                    .and_then(|id| games.iter().find(|g| &g.id == id).cloned());
                let game_chat = game.as_ref().and_then(|g| {
                    chat_list.iter().find(|c| c.id == g.game_chat_id).cloned()
                });
                game_tx.send_replace(game);
                chat_tx.send_replace(game_chat);

                tokio::select! {
                    _ = scope.cancelled() => return,
                    changed = selected_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = games_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = chats_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Self {
            selected_tx,
            current_game,
            current_game_chat,
        }
    }

    /// Select the game the user is looking at, or clear the selection.
    pub fn set_current_game(&self, key: Option<EntityKey>) {
        self.selected_tx.send_replace(key);
    }

    /// The current selection.
    pub fn current_game_key(&self) -> Option<EntityKey> {
        self.selected_tx.borrow().clone()
    }

    /// The selected game's record, when it is loaded.
    pub fn current_tarot_game(&self) -> Option<TarotGame> {
        self.current_game.value()
    }

    pub fn current_tarot_game_watch(&self) -> watch::Receiver<Option<TarotGame>> {
        self.current_game.watch()
    }

    /// The chat attached to the selected game, when it is loaded.
    pub fn current_game_chat(&self) -> Option<ClientChat> {
        self.current_game_chat.value()
    }

    pub fn current_game_chat_watch(&self) -> watch::Receiver<Option<ClientChat>> {
        self.current_game_chat.watch()
    }
}
