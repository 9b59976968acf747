//! Audio playback seam.
//!
//! Actual playback is a UI concern; the chat service only needs something it
//! can hand a server-produced audio file token to and await completion of.

use async_trait::async_trait;

use crate::error::AudioError;

/// Plays a server-rendered audio file, resolving when playback finishes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, file_token: &str) -> Result<(), AudioError>;
}

/// Playback implementation that only logs. Used by the CLI client, where
/// there is no audio device wired up.
pub struct NullAudioPlayer;

#[async_trait]
impl AudioPlayer for NullAudioPlayer {
    async fn play(&self, file_token: &str) -> Result<(), AudioError> {
        tracing::info!("Audio playback requested for file '{}' (no-op)", file_token);
        Ok(())
    }
}
