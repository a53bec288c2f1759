//! Streaming speech synthesis.
//!
//! Two provider variants share the contract: `cosy_voice` keeps one duplex
//! session open and forwards every text fragment, `sambert` batches
//! fragments into sentences and submits one synthesis request per sentence.
//! Either way audio arrives through the listener, and exactly one completed
//! event ends each synthesis session.

pub mod cosy_voice;
pub mod sambert;

pub use cosy_voice::CosyVoice;
pub use sambert::Sambert;

use crate::error::{Result, ServerError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::warn;

pub(crate) const WS_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference/";
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 2;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Synthesis progress attached to each audio event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsState {
    /// An audio chunk; more may follow.
    Processing,
    /// The synthesis session is over.
    Completed,
}

impl TtsState {
    /// Wire representation used by `tts` frames.
    #[must_use]
    pub const fn as_wire(self) -> u8 {
        match self {
            Self::Processing => 0,
            Self::Completed => 1,
        }
    }
}

/// Receives synthesized audio.
#[async_trait]
pub trait TtsListener: Send + Sync {
    /// Called with raw audio bytes for every chunk and once on completion
    /// (with an empty chunk).
    ///
    /// Returning `true` stops the provider's reader.
    async fn on_tts_result(&self, audio: &[u8], state: TtsState) -> bool;
}

/// Synthesis parameters; out-of-range values are normalized by the
/// provider, the effective configuration is returned from `set_config`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TtsConfig {
    /// Backend API key.
    pub api_key: String,
    /// Voice id.
    pub speaker: String,
    /// Speaking rate.
    pub speed: f32,
    /// Volume in [0, 100].
    pub volume: i32,
    /// Pitch factor.
    pub pitch: f32,
    /// Audio encoding, e.g. "mp3".
    pub format: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Synthesis language.
    pub language: String,
}

/// A streaming synthesizer.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Apply a configuration, returning the effective values after
    /// normalization.
    fn set_config(&self, cfg: TtsConfig) -> TtsConfig;

    /// Attach the listener receiving audio.
    fn set_listener(&self, listener: Arc<dyn TtsListener>);

    /// Feed a text fragment for synthesis.
    async fn to_tts(&self, text: &str) -> Result<()>;

    /// No more text will come for this reply; flush pending fragments.
    async fn to_session_finish(&self) -> Result<()>;

    /// Drop any active session and return to idle.
    async fn reset(&self);
}

/// Dial the synthesis backend with bounded retries.
pub(crate) async fn dial_backend(api_key: &str) -> Result<WsStream> {
    let mut last_err = String::new();
    for attempt in 0..=MAX_RETRIES {
        let mut request = WS_URL
            .into_client_request()
            .map_err(|e| ServerError::tts(format!("bad endpoint: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("bearer {api_key}"))
                .unwrap_or(HeaderValue::from_static("")),
        );
        headers.insert("X-DashScope-DataInspection", HeaderValue::from_static("enable"));

        match tokio::time::timeout(DIAL_TIMEOUT, connect_async(request)).await {
            Ok(Ok((stream, _response))) => return Ok(stream),
            Ok(Err(e)) => last_err = e.to_string(),
            Err(_) => last_err = "dial timeout".to_string(),
        }
        if attempt < MAX_RETRIES {
            let backoff = Duration::from_millis(500 * u64::from(attempt + 1));
            warn!(
                attempt = attempt + 1,
                error = %last_err,
                "tts connect failed, retrying in {backoff:?}"
            );
            tokio::time::sleep(backoff).await;
        }
    }
    Err(ServerError::tts(format!("failed to connect: {last_err}")))
}

/// Splits streamed text into sentences on terminating punctuation.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

const SPLIT_PUNCTUATION: [char; 12] =
    [',', '.', '!', '?', ';', ':', '，', '。', '！', '？', '；', '：'];

impl SentenceSplitter {
    /// Create an empty splitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment; returns the sentences it completed.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        for ch in text.chars() {
            self.buffer.push(ch);
            if SPLIT_PUNCTUATION.contains(&ch) {
                sentences.push(std::mem::take(&mut self.buffer));
            }
        }
        sentences
    }

    /// Take the trailing fragment, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}
