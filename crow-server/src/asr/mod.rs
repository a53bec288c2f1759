//! Streaming speech recognition.
//!
//! A provider consumes raw audio chunks and pushes transcripts to its
//! listener: partials while the user speaks, a sentence-end at each phrase
//! boundary and exactly one completed event per recognition session.

pub mod paraformer;

pub use paraformer::Paraformer;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Recognition progress attached to each transcript event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrState {
    /// Partial transcript; the utterance continues.
    Processing,
    /// A provisional phrase boundary.
    SentenceEnd,
    /// The recognition session is over.
    Completed,
}

impl AsrState {
    /// Wire representation used by `asr` frames.
    #[must_use]
    pub const fn as_wire(self) -> u8 {
        match self {
            Self::Processing => 0,
            Self::SentenceEnd => 1,
            Self::Completed => 2,
        }
    }
}

/// Receives transcript events.
#[async_trait]
pub trait AsrListener: Send + Sync {
    /// Called for every transcript event.
    ///
    /// Returning `true` stops the provider's reader.
    async fn on_asr_result(&self, result: &str, state: AsrState) -> bool;
}

/// Recognition parameters; unsupported values are normalized by the
/// provider, the effective configuration is returned from `set_config`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsrConfig {
    /// Backend API key.
    pub api_key: String,
    /// Recognized language, e.g. "zh".
    pub language: String,
    /// Accent hint, e.g. "mandarin".
    pub accent: String,
    /// Input sample rate in Hz.
    pub sample_rate: u32,
    /// Input format, e.g. "pcm".
    pub format: String,
    /// Channel count.
    pub channels: u32,
    /// Punctuation prediction.
    pub enable_punc: bool,
    /// End-of-utterance silence in milliseconds; 0 disables.
    pub vad_eos: u32,
}

/// A streaming recognizer.
#[async_trait]
pub trait AsrProvider: Send + Sync {
    /// Apply a configuration, returning the effective values after
    /// normalization.
    fn set_config(&self, cfg: AsrConfig) -> AsrConfig;

    /// Attach the listener receiving transcript events.
    fn set_listener(&self, listener: Arc<dyn AsrListener>);

    /// Feed one audio chunk; connects lazily on first use.
    async fn send_audio(&self, data: Vec<u8>) -> Result<()>;

    /// Consecutive silence windows observed since the last non-empty
    /// transcript.
    fn silence_count(&self) -> u32;

    /// Drop any active connection and return to idle.
    async fn reset(&self);
}
