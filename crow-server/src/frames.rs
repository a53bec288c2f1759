//! Client/server wire frames.
//!
//! All frames are JSON text. Clients send `hello`, `chat` and `abort`;
//! the server answers with `hello`, `asr`, `chat`, `tts` and `error`.
//! Binary frames (raw PCM audio) bypass this module entirely.

use serde::{Deserialize, Serialize};

/// ASR parameters as they appear in hello frames, echoed back effective.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsrParams {
    /// Audio format, e.g. "pcm".
    #[serde(default)]
    pub format: String,
    /// Sample rate in Hz.
    #[serde(default)]
    pub sample_rate: u32,
    /// Channel count; mono recommended.
    #[serde(default)]
    pub channels: u32,
    /// End-of-utterance silence in milliseconds.
    #[serde(default)]
    pub vad_eos: u32,
    /// Punctuation prediction.
    #[serde(default)]
    pub enable_punc: bool,
    /// Recognized language, e.g. "zh".
    #[serde(default)]
    pub language: String,
    /// Accent hint, e.g. "mandarin".
    #[serde(default)]
    pub accent: String,
}

/// TTS parameters as they appear in hello frames, echoed back effective.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsParams {
    /// Voice id; backend default when empty.
    #[serde(default)]
    pub speaker: String,
    /// Audio encoding, e.g. "mp3".
    #[serde(default)]
    pub format: String,
    /// Speaking rate.
    #[serde(default)]
    pub speed: f32,
    /// Volume in [0, 100].
    #[serde(default)]
    pub volume: i32,
    /// Pitch factor.
    #[serde(default)]
    pub pitch: f32,
    /// Output sample rate in Hz.
    #[serde(default)]
    pub sample_rate: u32,
    /// Synthesis language, e.g. "zh".
    #[serde(default)]
    pub language: String,
}

/// A text frame sent by the client.
///
/// `type` selects the variant: `hello` opens the session, `chat` submits
/// text, `abort` interrupts the current reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientTextFrame {
    /// Frame type discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Chat text; only meaningful for `chat`.
    #[serde(default)]
    pub chat_text: String,
    /// Whether the session streams audio for recognition.
    #[serde(default)]
    pub enable_asr: bool,
    /// Whether replies are synthesized.
    #[serde(default)]
    pub enable_tts: bool,
    /// Requested ASR parameters.
    #[serde(default)]
    pub asr_params: AsrParams,
    /// Requested TTS parameters.
    #[serde(default)]
    pub tts_params: TtsParams,
}

impl ClientTextFrame {
    /// Parse a client text frame from raw bytes.
    pub fn parse(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Server `hello` reply with the session id and the effective parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloFrame {
    #[serde(rename = "type")]
    kind: String,
    /// Session id assigned by the server.
    pub session_id: String,
    /// Effective ASR parameters when ASR is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr_params: Option<AsrParams>,
    /// Effective TTS parameters when TTS is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_params: Option<TtsParams>,
}

impl HelloFrame {
    /// Create a hello reply for `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            kind: "hello".to_string(),
            session_id: session_id.into(),
            asr_params: None,
            tts_params: None,
        }
    }
}

/// Server `asr` frame mirroring a transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrFrame {
    #[serde(rename = "type")]
    kind: String,
    /// Session id.
    pub session_id: String,
    /// Transcript text.
    pub result: String,
    /// 0 processing, 1 sentence end, 2 completed.
    pub state: u8,
}

impl AsrFrame {
    /// Create an asr frame.
    #[must_use]
    pub fn new(session_id: impl Into<String>, result: impl Into<String>, state: u8) -> Self {
        Self {
            kind: "asr".to_string(),
            session_id: session_id.into(),
            result: result.into(),
            state,
        }
    }
}

/// Server `chat` frame carrying one reply delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(rename = "type")]
    kind: String,
    /// Session id.
    pub session_id: String,
    /// Reply fragment.
    pub text: String,
}

impl ChatFrame {
    /// Create a chat frame.
    #[must_use]
    pub fn new(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: "chat".to_string(),
            session_id: session_id.into(),
            text: text.into(),
        }
    }
}

/// Server `tts` frame carrying base64 audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsFrame {
    #[serde(rename = "type")]
    kind: String,
    /// Session id.
    pub session_id: String,
    /// Base64-encoded audio chunk; empty on completion.
    pub audio: String,
    /// 0 processing, 1 completed.
    pub state: u8,
}

impl TtsFrame {
    /// Create a tts frame.
    #[must_use]
    pub fn new(session_id: impl Into<String>, audio: impl Into<String>, state: u8) -> Self {
        Self {
            kind: "tts".to_string(),
            session_id: session_id.into(),
            audio: audio.into(),
            state,
        }
    }
}

/// Server `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    kind: String,
    /// Session id.
    pub session_id: String,
    /// Stable error code; 0 means OK.
    pub error_code: i32,
    /// Human-readable message.
    pub error_msg: String,
}

impl ErrorFrame {
    /// Create an error frame.
    #[must_use]
    pub fn new(session_id: impl Into<String>, code: i32, msg: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            session_id: session_id.into(),
            error_code: code,
            error_msg: msg.into(),
        }
    }
}
