//! DashScope CosyVoice bidirectional streaming synthesis.
//!
//! One duplex task per reply: every text fragment becomes a
//! `continue-task` event, the flush is a `finish-task`, audio comes back as
//! binary frames.
//! <https://help.aliyun.com/zh/model-studio/cosyvoice-websocket-api>

use crate::error::{Result, ServerError};
use crate::tts::{TtsConfig, TtsListener, TtsProvider, TtsState, WsStream, dial_backend};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

struct Inner {
    writer: Option<WsWriter>,
    is_running: bool,
    task_id: String,
}

/// CosyVoice bidirectional streaming synthesizer.
pub struct CosyVoice {
    cfg: StdMutex<TtsConfig>,
    listener: RwLock<Option<Arc<dyn TtsListener>>>,
    inner: Arc<Mutex<Inner>>,
    sent_fragments: AtomicU64,
}

impl Default for CosyVoice {
    fn default() -> Self {
        Self::new()
    }
}

impl CosyVoice {
    /// Create an idle provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cfg: StdMutex::new(TtsConfig::default()),
            listener: RwLock::new(None),
            inner: Arc::new(Mutex::new(Inner {
                writer: None,
                is_running: false,
                task_id: String::new(),
            })),
            sent_fragments: AtomicU64::new(0),
        }
    }

    fn listener(&self) -> Option<Arc<dyn TtsListener>> {
        self.listener.read().expect("listener lock poisoned").clone()
    }

    fn config(&self) -> TtsConfig {
        self.cfg.lock().expect("config lock poisoned").clone()
    }

    async fn init_connection(&self, inner: &mut Inner) -> Result<()> {
        if inner.is_running {
            return Ok(());
        }
        info!("start tts");

        if let Some(mut writer) = inner.writer.take() {
            let _ = writer.close().await;
        }

        let cfg = self.config();
        let mut stream = dial_backend(&cfg.api_key).await?;

        let task_id = Uuid::new_v4().to_string();
        let run_task = Event::run_task(&task_id, &cfg);
        stream
            .send(WsMessage::Text(serde_json::to_string(&run_task)?.into()))
            .await
            .map_err(|e| ServerError::tts(format!("send run-task: {e}")))?;

        let started = stream
            .next()
            .await
            .ok_or_else(|| ServerError::tts("connection closed before task-started"))?
            .map_err(|e| ServerError::tts(format!("read task-started: {e}")))?;
        let event: Event = match started {
            WsMessage::Text(text) => serde_json::from_str(text.as_str())?,
            other => return Err(ServerError::tts(format!("unexpected message: {other:?}"))),
        };
        if event.header.event != "task-started" {
            return Err(ServerError::tts(format!(
                "unexpected task-started event, got: {}",
                event.header.event
            )));
        }

        let (writer, reader) = stream.split();
        inner.writer = Some(writer);
        inner.is_running = true;
        inner.task_id = task_id;
        debug!(task_id = %inner.task_id, "tts session started");

        self.spawn_reader(reader);
        Ok(())
    }

    fn spawn_reader(&self, mut reader: WsReader) {
        let inner = Arc::clone(&self.inner);
        let listener = self.listener();

        tokio::spawn(async move {
            info!("cosy voice reader started");
            let completed = Arc::new(AtomicBool::new(false));
            let mut listener_stopped = false;

            let emit = |audio: Vec<u8>, state: TtsState, completed: Arc<AtomicBool>| {
                let listener = listener.clone();
                async move {
                    if state == TtsState::Completed && completed.swap(true, Ordering::SeqCst) {
                        return false;
                    }
                    match listener {
                        Some(listener) => listener.on_tts_result(&audio, state).await,
                        None => false,
                    }
                }
            };

            while let Some(message) = reader.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "tts read failed");
                        break;
                    }
                };
                match message {
                    WsMessage::Binary(audio) => {
                        if emit(audio.to_vec(), TtsState::Processing, completed.clone()).await {
                            listener_stopped = true;
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
                            // Per-fragment bookkeeping only.
                            "result-generated" => {}
                            "task-finished" => {
                                emit(Vec::new(), TtsState::Completed, completed.clone()).await;
                                break;
                            }
                            "task-failed" => {
                                let reason = if event.header.error_message.is_empty() {
                                    "the task failed due to an unknown reason".to_string()
                                } else {
                                    event.header.error_message
                                };
                                error!(error = %reason, "tts task failed");
                                emit(Vec::new(), TtsState::Completed, completed.clone()).await;
                                break;
                            }
                            other => debug!(event = %other, "unexpected tts event"),
                        }
                    }
                    _ => {}
                }
            }

            // Guarantee the completed event even when the transport died.
            if !listener_stopped {
                emit(Vec::new(), TtsState::Completed, completed.clone()).await;
            }

            let mut inner = inner.lock().await;
            inner.is_running = false;
            if let Some(mut writer) = inner.writer.take() {
                let _ = writer.close().await;
            }
            info!("cosy voice reader stopped");
        });
    }

    async fn send_continue(&self, inner: &mut Inner, text: &str) -> Result<()> {
        let task_id = inner.task_id.clone();
        let Some(writer) = inner.writer.as_mut() else {
            return Ok(());
        };
        let cmd = Event::continue_task(&task_id, text);
        if let Err(e) = writer
            .send(WsMessage::Text(serde_json::to_string(&cmd)?.into()))
            .await
        {
            inner.is_running = false;
            inner.writer = None;
            return Err(ServerError::tts(format!("send text: {e}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TtsProvider for CosyVoice {
    fn set_config(&self, mut cfg: TtsConfig) -> TtsConfig {
        if cfg.speaker.is_empty() {
            cfg.speaker = "longlaotie_v2".to_string();
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
        let mut inner = self.inner.lock().await;
        self.init_connection(&mut inner).await?;

        if text.is_empty() || !inner.is_running {
            return Ok(());
        }
        self.send_continue(&mut inner, text).await?;

        let sent = self.sent_fragments.fetch_add(1, Ordering::Relaxed) + 1;
        if sent % 20 == 0 {
            debug!(sent, "text fragments forwarded");
        }
        Ok(())
    }

    async fn to_session_finish(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.is_running {
            return Ok(());
        }
        let task_id = inner.task_id.clone();
        let Some(writer) = inner.writer.as_mut() else {
            return Ok(());
        };
        let cmd = Event::finish_task(&task_id);
        writer
            .send(WsMessage::Text(serde_json::to_string(&cmd)?.into()))
            .await
            .map_err(|e| ServerError::tts(format!("send finish-task: {e}")))
    }

    async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.is_running = false;
        if let Some(mut writer) = inner.writer.take() {
            let _ = writer.close().await;
        }
        inner.task_id.clear();
        self.sent_fragments.store(0, Ordering::Relaxed);
        info!("cosy voice reset");
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
    voice: String,
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
    fn run_task(task_id: &str, cfg: &TtsConfig) -> Self {
        Self {
            header: Header {
                action: "run-task".to_string(),
                task_id: task_id.to_string(),
                streaming: "duplex".to_string(),
                ..Header::default()
            },
            payload: Payload {
                task_group: "audio".to_string(),
                task: "tts".to_string(),
                function: "SpeechSynthesizer".to_string(),
                model: "cosyvoice-v2".to_string(),
                parameters: Params {
                    text_type: "PlainText".to_string(),
                    voice: cfg.speaker.clone(),
                    format: cfg.format.clone(),
                    sample_rate: cfg.sample_rate,
                    volume: cfg.volume,
                    rate: cfg.speed,
                    pitch: cfg.pitch,
                },
                input: Input::default(),
            },
        }
    }

    fn continue_task(task_id: &str, text: &str) -> Self {
        Self {
            header: Header {
                action: "continue-task".to_string(),
                task_id: task_id.to_string(),
                streaming: "duplex".to_string(),
                ..Header::default()
            },
            payload: Payload {
                input: Input {
                    text: text.to_string(),
                },
                ..Payload::default()
            },
        }
    }

    fn finish_task(task_id: &str) -> Self {
        Self {
            header: Header {
                action: "finish-task".to_string(),
                task_id: task_id.to_string(),
                streaming: "duplex".to_string(),
                ..Header::default()
            },
            payload: Payload::default(),
        }
    }
}
