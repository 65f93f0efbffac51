//! Voice bridge between a speech collaborator and the realtime session.

use async_trait::async_trait;
use tracing::{debug, info};

use super::session::RealtimeSession;
use crate::error::{Result, SessionError, VoiceError};

/// Speech capture and synthesis.
///
/// Implementations produce transcribed text while listening and speak
/// text on request. Audio handling stays behind this trait.
#[async_trait]
pub trait SpeechInterface: Send + Sync {
    async fn start_listening(&self) -> std::result::Result<(), VoiceError>;

    async fn stop_listening(&self) -> std::result::Result<(), VoiceError>;

    /// The transcription captured by the last listening pass.
    async fn transcription(&self) -> String;

    async fn speak(&self, text: &str) -> std::result::Result<(), VoiceError>;
}

impl RealtimeSession {
    /// Begin capturing speech.
    pub async fn start_listening(&self) -> Result<()> {
        let speech = self.speech().ok_or(SessionError::NoSpeechInterface)?;
        speech.start_listening().await?;
        info!("Listening for speech");
        Ok(())
    }

    /// Stop capturing and send the final transcription as a user message.
    ///
    /// Returns `false` when nothing was transcribed or the send failed.
    pub async fn stop_listening(&self) -> Result<bool> {
        let speech = self
            .speech()
            .cloned()
            .ok_or(SessionError::NoSpeechInterface)?;
        speech.stop_listening().await?;

        let text = speech.transcription().await;
        let text = text.trim();
        if text.is_empty() {
            debug!("Empty transcription, nothing to send");
            return Ok(false);
        }
        info!(chars = text.len(), "Forwarding transcription");
        Ok(self.send_user_message(text).await)
    }
}
