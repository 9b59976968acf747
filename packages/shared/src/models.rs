//! Domain models shared between the client services and the server API.
//!
//! All structs serialize with camelCase field names to match the JSON the
//! site's API and socket endpoint produce.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque database identifier.
///
/// The server mints these; the client only compares and forwards them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh identifier (used by tests and tooling, not by the
    /// client itself - real ids come from the server).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reference to an entity that may not exist in the database yet.
///
/// Used wherever the UI can navigate to either an existing record or a
/// "create new" view, so that a real identifier is never overloaded with a
/// sentinel value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKey {
    /// The entity has not been persisted yet.
    New,
    /// The entity exists under this identifier.
    Existing(Id),
}

impl EntityKey {
    /// Returns the identifier when this key refers to a persisted entity.
    pub fn id(&self) -> Option<&Id> {
        match self {
            EntityKey::New => None,
            EntityKey::Existing(id) => Some(id),
        }
    }
}

/// The type of a chat, determining what kind of interaction it backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatType {
    /// The general assistant chat on the site.
    Main,
    /// A chat attached to a tarot game.
    TarotGame,
}

/// The role that authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageRole {
    System,
    User,
    Assistant,
}

/// A single message within a chat. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role that sent the message.
    pub role: ChatMessageRole,
    /// The message that was sent.
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatMessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatMessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A shortened data set for a chat, suitable for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInfo {
    /// The database ID for this chat.
    pub id: Id,
    /// The ID of the user who owns this chat.
    pub user_id: Id,
    /// The LLM model used for this chat interaction.
    pub model: String,
    /// The type of chat this is.
    pub chat_type: ChatType,
    /// The date this chat was last accessed (UTC milliseconds).
    pub last_access_date: i64,
    /// The date/time this chat was created (UTC milliseconds).
    pub creation_date: i64,
}

/// The client-side representation of a chat: listing info plus the message
/// log. System messages never leave the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientChat {
    /// The database ID for this chat.
    pub id: Id,
    /// The ID of the user who owns this chat.
    pub user_id: Id,
    /// The LLM model used for this chat interaction.
    pub model: String,
    /// The type of chat this is.
    pub chat_type: ChatType,
    /// The date this chat was last accessed (UTC milliseconds).
    pub last_access_date: i64,
    /// The date/time this chat was created (UTC milliseconds).
    pub creation_date: i64,
    /// The messages exchanged in this chat, in receipt order.
    pub chat_messages: Vec<ChatMessage>,
}

/// Reference to a card drawn in a tarot game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TarotCardReference {
    /// The ID of the card that was drawn.
    pub card_id: Id,
    /// Whether the card came up reversed.
    pub is_reversed: bool,
}

/// A tarot game and its linkage to the chat that narrates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TarotGame {
    /// The database ID for this game.
    pub id: Id,
    /// The ID of the user playing this game.
    pub user_id: Id,
    /// The ID of the chat attached to this game.
    pub game_chat_id: Id,
    /// The cards picked so far, in draw order.
    pub cards_picked: Vec<TarotCardReference>,
    /// The date/time this game was created (UTC milliseconds).
    pub creation_date: i64,
}

/// Decoded payload of the auth token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    /// The ID of the authenticated user.
    pub user_id: Id,
    /// Display name of the authenticated user.
    #[serde(default)]
    pub user_name: Option<String>,
    /// Expiry claim (Unix seconds).
    #[serde(default)]
    pub exp: Option<i64>,
    /// Issued-at claim (Unix seconds).
    #[serde(default)]
    pub iat: Option<i64>,
    /// Not-before claim (Unix seconds).
    #[serde(default)]
    pub nbf: Option<i64>,
}

/// Site-wide settings pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSettings {
    /// Whether audio chat is enabled for this site.
    pub allow_audio_chat: bool,
}

impl Default for SiteSettings {
    fn default() -> Self {
        // Audio stays off until the server says otherwise.
        Self {
            allow_audio_chat: false,
        }
    }
}

/// Severity of a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserMessageLevel {
    Success,
    Info,
    Warn,
    Error,
}

/// A non-blocking notification shown to the user in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub level: UserMessageLevel,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl UserMessage {
    pub fn new(level: UserMessageLevel, content: impl Into<String>) -> Self {
        Self {
            level,
            content: content.into(),
            title: None,
        }
    }

    pub fn with_title(
        level: UserMessageLevel,
        content: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            level,
            content: content.into(),
            title: Some(title.into()),
        }
    }
}
