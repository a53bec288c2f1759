//! DashScope Sambert sentence-batched synthesis.
//!
//! Fragments buffer until a sentence-terminating punctuation mark, then the
//! whole sentence goes out as one synthesis task. `to_session_finish`
//! flushes the trailing fragment and closes the synthesis session with one
//! completed event.

use crate::error::{Result, ServerError};
use crate::tts::{
    SentenceSplitter, TtsConfig, TtsListener, TtsProvider, TtsState, dial_backend,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sambert sentence-batched synthesizer.
pub struct Sambert {
    cfg: StdMutex<TtsConfig>,
    listener: RwLock<Option<Arc<dyn TtsListener>>>,
    splitter: Mutex<SentenceSplitter>,
    completed_sent: AtomicBool,
}

impl Default for Sambert {
    fn default() -> Self {
        Self::new()
    }
}

impl Sambert {
    /// Create an idle provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cfg: StdMutex::new(TtsConfig::default()),
            listener: RwLock::new(None),
            splitter: Mutex::new(SentenceSplitter::new()),
            completed_sent: AtomicBool::new(false),
        }
    }

    fn listener(&self) -> Option<Arc<dyn TtsListener>> {
        self.listener.read().expect("listener lock poisoned").clone()
    }

    fn config(&self) -> TtsConfig {
        self.cfg.lock().expect("config lock poisoned").clone()
    }

    async fn emit(&self, audio: Vec<u8>, state: TtsState) -> bool {
        if state == TtsState::Completed && self.completed_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.listener() {
            Some(listener) => listener.on_tts_result(&audio, state).await,
            None => false,
        }
    }

    /// Synthesize one complete sentence: one task, audio streamed to the
    /// listener as processing events.
    async fn synthesize(&self, sentence: &str) -> Result<()> {
        if sentence.trim().is_empty() {
            return Ok(());
        }
        debug!(sentence = %sentence, "synthesizing sentence");

        let cfg = self.config();
        let mut stream = dial_backend(&cfg.api_key).await?;

        let task_id = Uuid::new_v4().to_string();
        let run_task = Event::run_task(&task_id, &cfg, sentence);
        stream
            .send(WsMessage::Text(serde_json::to_string(&run_task)?.into()))
            .await
            .map_err(|e| ServerError::tts(format!("send run-task: {e}")))?;

        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "tts read failed");
                    break;
                }
            };
            match message {
                WsMessage::Binary(audio) => {
                    if self.emit(audio.to_vec(), TtsState::Processing).await {
                        break;
                    }
                }
                WsMessage::Text(text) => {
                    let event: Event = match serde_json::from_str(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(error = %e, "failed to resolve tts event");
                            continue;
                        }
                    };
                    match event.header.event.as_str() {
                        "task-started" | "result-generated" => {}
                        "task-finished" => break,
                        "task-failed" => {
                            error!(error = %event.header.error_message, "tts task failed");
                            break;
                        }
                        other => debug!(event = %other, "unexpected tts event"),
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        let _ = stream.close(None).await;
        Ok(())
    }
}

#[async_trait]
impl TtsProvider for Sambert {
    fn set_config(&self, mut cfg: TtsConfig) -> TtsConfig {
        if cfg.speaker.is_empty() {
            cfg.speaker = "sambert-zhichu-v1".to_string();
        }
        if !(0.5..=2.0).contains(&cfg.speed) {
            cfg.speed = 1.0;
        }
        if !(0..=100).contains(&cfg.volume) {
            cfg.volume = 50;
        }
        if !(0.5..=2.0).contains(&cfg.pitch) {
            cfg.pitch = 1.0;
        }
        if cfg.format.is_empty() {
            cfg.format = "mp3".to_string();
        }
        if cfg.sample_rate == 0 {
            cfg.sample_rate = 16000;
        }
        if cfg.language.is_empty() {
            cfg.language = "zh".to_string();
        }
        *self.cfg.lock().expect("config lock poisoned") = cfg.clone();
        cfg
    }

    fn set_listener(&self, listener: Arc<dyn TtsListener>) {
        *self.listener.write().expect("listener lock poisoned") = Some(listener);
    }

    async fn to_tts(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        // A new fragment after completion starts the next synthesis session.
        self.completed_sent.store(false, Ordering::SeqCst);

        let sentences = self.splitter.lock().await.feed(text);
        for sentence in sentences {
            self.synthesize(&sentence).await?;
        }
        Ok(())
    }

    async fn to_session_finish(&self) -> Result<()> {
        let trailing = self.splitter.lock().await.flush();
        if let Some(sentence) = trailing {
            self.synthesize(&sentence).await?;
        }
        self.emit(Vec::new(), TtsState::Completed).await;
        Ok(())
    }

    async fn reset(&self) {
        self.splitter.lock().await.flush();
        self.completed_sent.store(false, Ordering::SeqCst);
        info!("sambert reset");
    }
}

// ============================================================================
// Wire events
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct Header {
    #[serde(default)]
    action: String,
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    streaming: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Params {
    text_type: String,
    format: String,
    sample_rate: u32,
    volume: i32,
    rate: f32,
    pitch: f32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Input {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Payload {
    #[serde(default)]
    task_group: String,
    #[serde(default)]
    task: String,
    #[serde(default)]
    function: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    parameters: Params,
    #[serde(default)]
    input: Input,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Event {
    header: Header,
    payload: Payload,
}

impl Event {
    fn run_task(task_id: &str, cfg: &TtsConfig, text: &str) -> Self {
        Self {
            header: Header {
                action: "run-task".to_string(),
                task_id: task_id.to_string(),
                streaming: "out".to_string(),
                ..Header::default()
            },
            payload: Payload {
                task_group: "audio".to_string(),
                task: "tts".to_string(),
                function: "SpeechSynthesizer".to_string(),
                model: cfg.speaker.clone(),
                parameters: Params {
                    text_type: "PlainText".to_string(),
                    format: cfg.format.clone(),
                    sample_rate: cfg.sample_rate,
                    volume: cfg.volume,
                    rate: cfg.speed,
                    pitch: cfg.pitch,
                },
                input: Input {
                    text: text.to_string(),
                },
            },
        }
    }
}
