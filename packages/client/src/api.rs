//! REST collaborator for chat and tarot data.
//!
//! The services depend on the [`ChatApi`] trait, not on a concrete HTTP
//! client, so tests can swap in mocks. [`HttpChatApi`] is the production
//! implementation over `reqwest`, attaching the current auth token as a
//! bearer header on every call.

use async_trait::async_trait;
use tokio::sync::watch;

use parlor_shared::models::{ChatInfo, ChatType, ClientChat, Id, TarotGame};

use crate::error::ApiError;

/// Data access the chat and tarot services need from the server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Get the current main chat for the user, creating one server-side if
    /// none exists.
    async fn get_main_chat(&self) -> Result<ClientChat, ApiError>;

    /// Ask the server to start a brand new main chat.
    async fn start_new_main_chat(&self) -> Result<ClientChat, ApiError>;

    /// Get a single chat by its identifier.
    async fn get_chat_by_id(&self, chat_id: &Id) -> Result<ClientChat, ApiError>;

    /// Get the listing of all chats for the user.
    async fn get_chat_list(&self) -> Result<Vec<ChatInfo>, ApiError>;

    /// Get all chats of the specified type.
    async fn get_chats_of_type(&self, chat_type: ChatType) -> Result<Vec<ClientChat>, ApiError>;

    /// Get all tarot games for the user.
    async fn get_tarot_games(&self) -> Result<Vec<TarotGame>, ApiError>;

    /// Delete a tarot game (and its chat) by game id.
    async fn delete_game_by_id(&self, game_id: &Id) -> Result<(), ApiError>;
}

/// `reqwest`-backed implementation of [`ChatApi`].
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: watch::Receiver<Option<String>>,
}

impl HttpChatApi {
    /// Create a new API client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The API root, e.g. `https://example.com/api`
    /// * `token` - Watch of the current auth token (from the token service)
    pub fn new(base_url: impl Into<String>, token: watch::Receiver<Option<String>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn bearer(&self) -> Result<String, ApiError> {
        self.token
            .borrow()
            .clone()
            .ok_or(ApiError::NotAuthenticated)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let token = self.bearer()?;
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let token = self.bearer()?;
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_main_chat(&self) -> Result<ClientChat, ApiError> {
        self.get_json("/chat/main").await
    }

    async fn start_new_main_chat(&self) -> Result<ClientChat, ApiError> {
        self.post_json("/chat/main/new").await
    }

    async fn get_chat_by_id(&self, chat_id: &Id) -> Result<ClientChat, ApiError> {
        self.get_json(&format!("/chat/{chat_id}")).await
    }

    async fn get_chat_list(&self) -> Result<Vec<ChatInfo>, ApiError> {
        self.get_json("/chat").await
    }

    async fn get_chats_of_type(&self, chat_type: ChatType) -> Result<Vec<ClientChat>, ApiError> {
        let type_name = match chat_type {
            ChatType::Main => "Main",
            ChatType::TarotGame => "TarotGame",
        };
        self.get_json(&format!("/chat/type/{type_name}")).await
    }

    async fn get_tarot_games(&self) -> Result<Vec<TarotGame>, ApiError> {
        self.get_json("/tarot/games").await
    }

    async fn delete_game_by_id(&self, game_id: &Id) -> Result<(), ApiError> {
        let token = self.bearer()?;
        let response = self
            .client
            .delete(format!("{}/tarot/games/{game_id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
