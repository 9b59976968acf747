//! Auth token ownership: current token, persistence, decoded payload.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::sync::watch;

use parlor_shared::models::TokenPayload;
use parlor_shared::time::Clock;

use crate::error::TokenError;

/// Durable storage for the raw auth token.
pub trait TokenStore: Send + Sync {
    /// Returns the stored token, if any.
    fn load(&self) -> std::io::Result<Option<String>>;

    /// Persists the token.
    fn save(&self, token: &str) -> std::io::Result<()>;

    /// Removes any stored token.
    fn clear(&self) -> std::io::Result<()>;
}

/// File-backed token store. The token is stored as plain text under a fixed
/// path, mirroring the single local-storage key the web front end uses.
pub struct FileTokenStore {
    path: std::path::PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the platform config directory (`<config>/parlor/token`).
    pub fn default_location() -> Self {
        let base = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join("parlor").join("token"))
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, token: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, token)
    }

    fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory token store for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryTokenStore {
    token: std::sync::Mutex<Option<String>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: std::sync::Mutex::new(Some(token.into())),
        }
    }
}

impl TokenStore for InMemoryTokenStore {
    fn load(&self) -> std::io::Result<Option<String>> {
        Ok(self.token.lock().expect("token store poisoned").clone())
    }

    fn save(&self, token: &str) -> std::io::Result<()> {
        *self.token.lock().expect("token store poisoned") = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> std::io::Result<()> {
        *self.token.lock().expect("token store poisoned") = None;
        Ok(())
    }
}

/// Decode the payload segment of a JWT without verifying its signature.
///
/// The client only needs the claims for display and expiry checks; signature
/// verification is the server's job.
pub fn decode_token_payload(token: &str) -> Result<TokenPayload, TokenError> {
    let payload_segment = token
        .split('.')
        .nth(1)
        .ok_or_else(|| TokenError::Malformed("missing payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload_segment.trim_end_matches('='))
        .map_err(|e| TokenError::Payload(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::Payload(e.to_string()))
}

/// Holds the current auth token, persists it, and derives the decoded
/// payload. Token changes are observable as a stream; the socket service
/// keys its connection lifecycle off that stream.
#[derive(Clone)]
pub struct TokenService {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    token_tx: watch::Sender<Option<String>>,
    payload_tx: watch::Sender<Option<TokenPayload>>,
}

impl TokenService {
    /// Create the service, restoring a previously stored token when its
    /// claims are still valid. An expired, not-yet-valid, or malformed
    /// stored token is discarded silently.
    pub fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>) -> Self {
        let (token_tx, _) = watch::channel(None);
        let (payload_tx, _) = watch::channel(None);
        let service = Self {
            inner: Arc::new(TokenInner {
                store,
                clock,
                token_tx,
                payload_tx,
            }),
        };
        service.restore_saved_token();
        service
    }

    fn restore_saved_token(&self) {
        let saved = match self.inner.store.load() {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!("Failed to read the token store: {}", e);
                return;
            }
        };
        let Some(token) = saved else {
            return;
        };

        match decode_token_payload(&token) {
            Ok(payload) if self.claims_are_current(&payload) => {
                self.inner.token_tx.send_replace(Some(token));
                self.inner.payload_tx.send_replace(Some(payload));
            }
            Ok(_) => {
                tracing::debug!("Stored token is outside its validity window; discarding");
                let _ = self.inner.store.clear();
            }
            Err(e) => {
                tracing::debug!("Stored token could not be decoded ({}); discarding", e);
                let _ = self.inner.store.clear();
            }
        }
    }

    /// Checks `exp` / `nbf` / `iat` against the clock. Claims are Unix
    /// seconds; absent claims pass.
    fn claims_are_current(&self, payload: &TokenPayload) -> bool {
        let now_millis = self.inner.clock.now_utc_millis();
        if let Some(exp) = payload.exp
            && exp * 1000 <= now_millis
        {
            return false;
        }
        if let Some(nbf) = payload.nbf
            && nbf * 1000 > now_millis
        {
            return false;
        }
        if let Some(iat) = payload.iat
            && iat * 1000 > now_millis
        {
            return false;
        }
        true
    }

    /// The current token, if any.
    pub fn token(&self) -> Option<String> {
        self.inner.token_tx.borrow().clone()
    }

    /// Watch of token changes. The socket service consumes this.
    pub fn token_watch(&self) -> watch::Receiver<Option<String>> {
        self.inner.token_tx.subscribe()
    }

    /// Decoded payload of the current token, if any.
    pub fn payload(&self) -> Option<TokenPayload> {
        self.inner.payload_tx.borrow().clone()
    }

    /// Watch of decoded payload changes.
    pub fn payload_watch(&self) -> watch::Receiver<Option<TokenPayload>> {
        self.inner.payload_tx.subscribe()
    }

    /// Set a new token, persisting it. A token whose payload cannot be
    /// decoded is still accepted as a credential; its payload is absent.
    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        if let Err(e) = self.inner.store.save(&token) {
            tracing::warn!("Failed to persist the auth token: {}", e);
        }
        let payload = match decode_token_payload(&token) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::debug!("Token payload could not be decoded: {}", e);
                None
            }
        };
        self.inner.token_tx.send_replace(Some(token));
        self.inner.payload_tx.send_replace(payload);
    }

    /// Clear the token and remove it from the store.
    pub fn clear_token(&self) {
        if let Err(e) = self.inner.store.clear() {
            tracing::warn!("Failed to clear the token store: {}", e);
        }
        self.inner.token_tx.send_replace(None);
        self.inner.payload_tx.send_replace(None);
    }
}
