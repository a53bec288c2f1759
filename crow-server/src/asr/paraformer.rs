//! DashScope Paraformer real-time recognition over WebSocket.
//!
//! Protocol: duplex task with JSON control events (`run-task`,
//! `task-started`, `result-generated`, `task-finished`, `task-failed`) and
//! binary audio upstream.
//! <https://help.aliyun.com/zh/model-studio/websocket-for-paraformer-real-time-service>

use crate::asr::{AsrConfig, AsrListener, AsrProvider, AsrState};
use crate::error::{Result, ServerError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WS_URL: &str = "wss://dashscope.aliyuncs.com/api-ws/v1/inference/";
/// No non-empty transcript for this long counts as silence.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 2;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// Connection state guarded by one lock; the background reader and the
/// write-triggering operations cooperate through it.
struct Inner {
    writer: Option<WsWriter>,
    is_running: bool,
    task_id: String,
}

/// Paraformer streaming recognizer.
pub struct Paraformer {
    cfg: StdMutex<AsrConfig>,
    listener: RwLock<Option<Arc<dyn AsrListener>>>,
    inner: Arc<Mutex<Inner>>,
    silence_count: Arc<AtomicU32>,
    started_at: StdMutex<Option<Instant>>,
    sent_chunks: AtomicU64,
}

impl Default for Paraformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Paraformer {
    /// Create an idle provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cfg: StdMutex::new(AsrConfig::default()),
            listener: RwLock::new(None),
            inner: Arc::new(Mutex::new(Inner {
                writer: None,
                is_running: false,
                task_id: String::new(),
            })),
            silence_count: Arc::new(AtomicU32::new(0)),
            started_at: StdMutex::new(None),
            sent_chunks: AtomicU64::new(0),
        }
    }

    fn listener(&self) -> Option<Arc<dyn AsrListener>> {
        self.listener.read().expect("listener lock poisoned").clone()
    }

    fn config(&self) -> AsrConfig {
        self.cfg.lock().expect("config lock poisoned").clone()
    }

    async fn dial(&self, cfg: &AsrConfig) -> Result<WsStream> {
        let mut last_err = String::new();
        for attempt in 0..=MAX_RETRIES {
            let mut request = WS_URL
                .into_client_request()
                .map_err(|e| ServerError::asr(format!("bad endpoint: {e}")))?;
            let headers = request.headers_mut();
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("bearer {}", cfg.api_key))
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
                    "asr connect failed, retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
            }
        }
        Err(ServerError::asr(format!("failed to connect: {last_err}")))
    }

    /// Idle → Connecting → Running; no-op when already running.
    async fn init_connection(&self, inner: &mut Inner) -> Result<()> {
        if inner.is_running {
            return Ok(());
        }
        info!("start asr");
        *self.started_at.lock().expect("start time lock poisoned") = Some(Instant::now());

        if let Some(mut writer) = inner.writer.take() {
            let _ = writer.close().await;
        }

        let cfg = self.config();
        let mut stream = self.dial(&cfg).await?;

        let task_id = Uuid::new_v4().to_string();
        let run_task = Event::run_task(&task_id, &cfg);
        stream
            .send(WsMessage::Text(serde_json::to_string(&run_task)?.into()))
            .await
            .map_err(|e| ServerError::asr(format!("send run-task: {e}")))?;

        // The backend acknowledges with task-started before audio may flow.
        let started = stream
            .next()
            .await
            .ok_or_else(|| ServerError::asr("connection closed before task-started"))?
            .map_err(|e| ServerError::asr(format!("read task-started: {e}")))?;
        let event: Event = match started {
            WsMessage::Text(text) => serde_json::from_str(text.as_str())?,
            other => return Err(ServerError::asr(format!("unexpected message: {other:?}"))),
        };
        if event.header.event != "task-started" {
            return Err(ServerError::asr(format!(
                "unexpected task-started event, got: {}",
                event.header.event
            )));
        }

        let (writer, reader) = stream.split();
        inner.writer = Some(writer);
        inner.is_running = true;
        inner.task_id = task_id;
        debug!(task_id = %inner.task_id, "asr session started");

        self.spawn_reader(reader);
        Ok(())
    }

    fn spawn_reader(&self, mut reader: WsReader) {
        let inner = Arc::clone(&self.inner);
        let listener = self.listener();
        let silence_count = Arc::clone(&self.silence_count);
        let started_at = *self.started_at.lock().expect("start time lock poisoned");

        tokio::spawn(async move {
            info!("paraformer reader started");
            let completed = Arc::new(AtomicBool::new(false));
            let mut listener_stopped = false;

            let emit = |text: String, state: AsrState, completed: Arc<AtomicBool>| {
                let listener = listener.clone();
                async move {
                    if state == AsrState::Completed && completed.swap(true, Ordering::SeqCst) {
                        return false;
                    }
                    match listener {
                        Some(listener) => listener.on_asr_result(&text, state).await,
                        None => false,
                    }
                }
            };

            while let Some(message) = reader.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "asr read failed");
                        break;
                    }
                };
                let WsMessage::Text(text) = message else {
                    continue;
                };
                let event: Event = match serde_json::from_str(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "failed to resolve asr event");
                        continue;
                    }
                };

                match event.header.event.as_str() {
                    "result-generated" => {
                        let sentence = event.payload.output.sentence;
                        if sentence.text.is_empty() {
                            if started_at.is_some_and(|t| t.elapsed() > IDLE_TIMEOUT) {
                                silence_count.fetch_add(1, Ordering::SeqCst);
                            }
                        } else {
                            silence_count.store(0, Ordering::SeqCst);
                        }
                        let state = if sentence.sentence_end {
                            AsrState::SentenceEnd
                        } else {
                            AsrState::Processing
                        };
                        if emit(sentence.text, state, completed.clone()).await {
                            listener_stopped = true;
                            break;
                        }
                    }
                    "task-finished" => {
                        emit(String::new(), AsrState::Completed, completed.clone()).await;
                        break;
                    }
                    "task-failed" => {
                        let reason = if event.header.error_message.is_empty() {
                            "the task failed due to an unknown reason".to_string()
                        } else {
                            event.header.error_message
                        };
                        error!(error = %reason, "asr task failed");
                        emit(String::new(), AsrState::Completed, completed.clone()).await;
                        break;
                    }
                    other => debug!(event = %other, "unexpected asr event"),
                }
            }

            // The orchestrator must never stall waiting for a completion the
            // backend failed to deliver.
            if !listener_stopped {
                emit(String::new(), AsrState::Completed, completed.clone()).await;
            }

            let mut inner = inner.lock().await;
            inner.is_running = false;
            if let Some(mut writer) = inner.writer.take() {
                let _ = writer.close().await;
            }
            info!("paraformer reader stopped");
        });
    }
}

#[async_trait]
impl AsrProvider for Paraformer {
    fn set_config(&self, mut cfg: AsrConfig) -> AsrConfig {
        if cfg.language.is_empty() {
            cfg.language = "zh".to_string();
        }
        if cfg.accent.is_empty() {
            cfg.accent = "mandarin".to_string();
        }
        if cfg.sample_rate == 0 {
            cfg.sample_rate = 16000;
        }
        if cfg.format.is_empty() {
            cfg.format = "pcm".to_string();
        }
        if cfg.channels == 0 {
            cfg.channels = 1;
        }
        if cfg.vad_eos < 200 || cfg.vad_eos > 6000 {
            cfg.vad_eos = 800;
        }
        *self.cfg.lock().expect("config lock poisoned") = cfg.clone();
        cfg
    }

    fn set_listener(&self, listener: Arc<dyn AsrListener>) {
        *self.listener.write().expect("listener lock poisoned") = Some(listener);
    }

    async fn send_audio(&self, data: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.init_connection(&mut inner).await?;

        if data.is_empty() || !inner.is_running {
            return Ok(());
        }
        let Some(writer) = inner.writer.as_mut() else {
            return Ok(());
        };
        if let Err(e) = writer.send(WsMessage::Binary(data.into())).await {
            inner.is_running = false;
            inner.writer = None;
            return Err(ServerError::asr(format!("send audio: {e}")));
        }

        let sent = self.sent_chunks.fetch_add(1, Ordering::Relaxed) + 1;
        if sent % 20 == 0 {
            debug!(sent, "audio chunks forwarded");
        }
        Ok(())
    }

    fn silence_count(&self) -> u32 {
        self.silence_count.load(Ordering::SeqCst)
    }

    async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.is_running = false;
        if let Some(mut writer) = inner.writer.take() {
            // Best-effort finish-task so the backend can settle the session.
            let finish = Event::finish_task(&inner.task_id);
            if let Ok(raw) = serde_json::to_string(&finish) {
                let _ = writer.send(WsMessage::Text(raw.into())).await;
            }
            let _ = writer.close().await;
        }
        inner.task_id.clear();
        self.silence_count.store(0, Ordering::SeqCst);
        self.sent_chunks.store(0, Ordering::Relaxed);
        *self.started_at.lock().expect("start time lock poisoned") = None;
        info!("paraformer reset");
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
struct Sentence {
    #[serde(default)]
    sentence_end: bool,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Output {
    #[serde(default)]
    sentence: Sentence,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Params {
    format: String,
    sample_rate: u32,
    language_hints: Vec<String>,
    /// VAD window; only effective with semantic punctuation off.
    max_sentence_silence: u32,
    punctuation_prediction_enabled: bool,
    /// Keep the connection up across long silences.
    heartbeat: bool,
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
    input: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    output: Output,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Event {
    header: Header,
    payload: Payload,
}

impl Event {
    fn run_task(task_id: &str, cfg: &AsrConfig) -> Self {
        Self {
            header: Header {
                action: "run-task".to_string(),
                task_id: task_id.to_string(),
                streaming: "duplex".to_string(),
                ..Header::default()
            },
            payload: Payload {
                task_group: "audio".to_string(),
                task: "asr".to_string(),
                function: "recognition".to_string(),
                model: "paraformer-realtime-v2".to_string(),
                parameters: Params {
                    format: cfg.format.clone(),
                    sample_rate: cfg.sample_rate,
                    language_hints: vec![cfg.language.clone()],
                    max_sentence_silence: cfg.vad_eos,
                    punctuation_prediction_enabled: cfg.enable_punc,
                    heartbeat: true,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_config_applies_defaults() {
        let provider = Paraformer::new();
        let effective = provider.set_config(AsrConfig::default());
        assert_eq!(effective.language, "zh");
        assert_eq!(effective.accent, "mandarin");
        assert_eq!(effective.sample_rate, 16000);
        assert_eq!(effective.format, "pcm");
        assert_eq!(effective.channels, 1);
        assert_eq!(effective.vad_eos, 800);
    }

    #[test]
    fn test_vad_eos_clamping() {
        let provider = Paraformer::new();
        for (input, expected) in [(100, 800), (200, 200), (3000, 3000), (6000, 6000), (9000, 800)]
        {
            let effective = provider.set_config(AsrConfig {
                vad_eos: input,
                ..AsrConfig::default()
            });
            assert_eq!(effective.vad_eos, expected, "vad_eos {input}");
        }
    }

    #[test]
    fn test_supported_values_pass_through() {
        let provider = Paraformer::new();
        let effective = provider.set_config(AsrConfig {
            language: "en".to_string(),
            sample_rate: 8000,
            format: "wav".to_string(),
            enable_punc: true,
            vad_eos: 1200,
            ..AsrConfig::default()
        });
        assert_eq!(effective.language, "en");
        assert_eq!(effective.sample_rate, 8000);
        assert_eq!(effective.format, "wav");
        assert!(effective.enable_punc);
        assert_eq!(effective.vad_eos, 1200);
    }

    #[test]
    fn test_run_task_event_shape() {
        let cfg = Paraformer::new().set_config(AsrConfig::default());
        let event = Event::run_task("task-1", &cfg);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["header"]["action"], "run-task");
        assert_eq!(json["header"]["streaming"], "duplex");
        assert_eq!(json["payload"]["model"], "paraformer-realtime-v2");
        assert_eq!(json["payload"]["parameters"]["max_sentence_silence"], 800);
        assert_eq!(json["payload"]["parameters"]["heartbeat"], true);
    }

    #[test]
    fn test_result_event_parsing() {
        let raw = r#"{
            "header": {"event": "result-generated", "task_id": "t"},
            "payload": {"output": {"sentence": {"text": "你好", "sentence_end": true}}}
        }"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(event.header.event, "result-generated");
        assert!(event.payload.output.sentence.sentence_end);
        assert_eq!(event.payload.output.sentence.text, "你好");
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let provider = Paraformer::new();
        provider.reset().await;
        provider.reset().await;
        assert_eq!(provider.silence_count(), 0);
    }
}
