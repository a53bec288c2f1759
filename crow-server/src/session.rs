//! Per-connection session orchestrator.
//!
//! One session owns one client connection, the ASR/TTS providers and the
//! agent, and wires them into an interruptible pipeline: client audio flows
//! to ASR, transcripts drive the agent, reply deltas are mirrored to the
//! client and fed to TTS, and a barge-in (new utterance, new chat text or an
//! explicit abort) cuts every outbound stream of the superseded round.
//!
//! Cancellation is layered: `interrupt` suppresses the current chat round's
//! output, `stop_recv` drops further client input, and the cancellation
//! token ends every pump on close.

use crate::asr::{AsrConfig, AsrProvider, AsrState};
use crate::config::ConfigHandle;
use crate::conn::{Conn, FrameKind};
use crate::error::{ERR_INTERNAL, ERR_INVALID_DATA_TYPE, Result, ServerError};
use crate::frames::{
    AsrFrame, AsrParams, ChatFrame, ClientTextFrame, ErrorFrame, HelloFrame, TtsFrame, TtsParams,
};
use crate::tts::{TtsConfig, TtsProvider, TtsState};
use crate::util::remove_all_punctuation;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use crow::agent::{AgentListener, AgentProvider, ReplyState};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Capacity of the text and audio queues; backpressures the conn reader.
const QUEUE_CAPACITY: usize = 100;

/// Synthetic prompt injected when the user has been silent for two windows.
const SILENCE_PROMPT: &str = "长时间未检测到用户说话，请礼貌的结束对话";

/// One client session.
pub struct Session {
    weak: Weak<Session>,
    cfg: ConfigHandle,
    conn: Arc<dyn Conn>,
    session_id: String,

    asr: Option<Arc<dyn AsrProvider>>,
    tts: Option<Arc<dyn TtsProvider>>,
    agent: RwLock<Option<Arc<dyn AgentProvider>>>,

    enable_asr: AtomicBool,
    enable_tts: AtomicBool,

    chat_round: AtomicU64,
    close_after_chat: AtomicBool,
    stop_recv: AtomicBool,
    interrupt: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,

    text_tx: StdMutex<Option<mpsc::Sender<String>>>,
    audio_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("chat_round", &self.chat_round.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session over an accepted connection.
    ///
    /// The caller wires the providers' listeners to the returned session.
    #[must_use]
    pub fn new(
        cfg: ConfigHandle,
        conn: Arc<dyn Conn>,
        asr: Option<Arc<dyn AsrProvider>>,
        tts: Option<Arc<dyn TtsProvider>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            cfg,
            conn,
            session_id: Uuid::new_v4().to_string(),
            asr,
            tts,
            agent: RwLock::new(None),
            enable_asr: AtomicBool::new(false),
            enable_tts: AtomicBool::new(false),
            chat_round: AtomicU64::new(0),
            close_after_chat: AtomicBool::new(false),
            stop_recv: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            text_tx: StdMutex::new(None),
            audio_tx: StdMutex::new(None),
        })
    }

    /// The session id assigned at accept time.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn arc(&self) -> Arc<Session> {
        self.weak.upgrade().expect("session is alive")
    }

    fn agent(&self) -> Option<Arc<dyn AgentProvider>> {
        self.agent.read().expect("agent lock poisoned").clone()
    }

    /// Install the agent serving this session.
    pub fn set_agent(&self, agent: Arc<dyn AgentProvider>) {
        *self.agent.write().expect("agent lock poisoned") = Some(agent);
    }

    /// Drive the session: hello handshake, agent setup, pumps, then the
    /// main read loop until the connection dies.
    pub async fn handle<F, Fut>(self: Arc<Self>, make_agent: F)
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Arc<dyn AgentProvider>>> + Send,
    {
        if let Err(e) = self.handle_hello().await {
            error!(error = %e, "failed to handle hello message");
            self.close().await;
            return;
        }

        match make_agent().await {
            Ok(agent) => {
                agent.set_listener(self.clone());
                self.set_agent(agent);
            }
            Err(e) => {
                error!(error = %e, "failed to init agent");
                self.close().await;
                return;
            }
        }

        self.read_loop().await;
        self.close().await;
    }

    // ========================================================================
    // Hello handshake
    // ========================================================================

    /// Read the hello frame, configure the providers and echo the
    /// effective parameters.
    async fn handle_hello(self: &Arc<Self>) -> Result<()> {
        let (kind, data) = match self.conn.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                let _ = self
                    .send_error_frame(ERR_INTERNAL.code(), ERR_INTERNAL.msg())
                    .await;
                return Err(e.into());
            }
        };
        if kind != FrameKind::Text {
            let _ = self.send_error_frame(ERR_INVALID_DATA_TYPE.code(), ERR_INVALID_DATA_TYPE.msg()).await;
            return Err(ServerError::UnsupportedMessage("binary hello".to_string()));
        }
        let hello = match ClientTextFrame::parse(&data) {
            Ok(hello) => hello,
            Err(e) => {
                let _ = self.send_error_frame(ERR_INVALID_DATA_TYPE.code(), ERR_INVALID_DATA_TYPE.msg()).await;
                return Err(ServerError::Json(e));
            }
        };

        self.enable_asr.store(hello.enable_asr, Ordering::SeqCst);
        self.enable_tts.store(hello.enable_tts, Ordering::SeqCst);

        let mut reply = HelloFrame::new(&self.session_id);
        let config = self.cfg.snapshot();

        if hello.enable_asr
            && let Some(asr) = &self.asr
        {
            let requested = AsrConfig {
                api_key: config.selected_asr_key(),
                language: hello.asr_params.language.clone(),
                accent: hello.asr_params.accent.clone(),
                sample_rate: hello.asr_params.sample_rate,
                format: hello.asr_params.format.clone(),
                channels: hello.asr_params.channels,
                enable_punc: hello.asr_params.enable_punc,
                vad_eos: hello.asr_params.vad_eos,
            };
            let effective = asr.set_config(requested);
            reply.asr_params = Some(asr_params_from(&effective));

            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            *self.audio_tx.lock().expect("audio tx lock poisoned") = Some(tx);
            tokio::spawn(self.arc().audio_pump(rx));
        }

        if hello.enable_tts
            && let Some(tts) = &self.tts
        {
            let requested = TtsConfig {
                api_key: config.selected_tts_key(),
                speaker: hello.tts_params.speaker.clone(),
                speed: hello.tts_params.speed,
                volume: hello.tts_params.volume,
                pitch: hello.tts_params.pitch,
                format: hello.tts_params.format.clone(),
                sample_rate: hello.tts_params.sample_rate,
                language: hello.tts_params.language.clone(),
            };
            let effective = tts.set_config(requested);
            reply.tts_params = Some(tts_params_from(&effective));
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        *self.text_tx.lock().expect("text tx lock poisoned") = Some(tx);
        tokio::spawn(self.arc().text_pump(rx));

        self.send_frame(&reply).await
    }

    // ========================================================================
    // Pumps
    // ========================================================================

    /// Dispatch incoming frames to the queues until the connection dies.
    async fn read_loop(&self) {
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => return,
                frame = self.conn.read_frame() => frame,
            };
            match frame {
                Ok((FrameKind::Text, data)) => {
                    let tx = self.text_tx.lock().expect("text tx lock poisoned").clone();
                    if let Some(tx) = tx {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if tx.send(text).await.is_err() {
                            return;
                        }
                    }
                }
                Ok((FrameKind::Binary, data)) => {
                    // Dropped when ASR is disabled.
                    let tx = self.audio_tx.lock().expect("audio tx lock poisoned").clone();
                    if let Some(tx) = tx
                        && tx.send(data).await.is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "read loop ended");
                    return;
                }
            }
        }
    }

    async fn text_pump(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => return,
                message = rx.recv() => message,
            };
            let Some(text) = message else { return };
            if self.stop_recv.load(Ordering::SeqCst) {
                continue;
            }
            info!(text = %text, "received text data");
            if let Err(e) = self.handle_client_text(&text).await {
                error!(error = %e, "failed to process client text message");
            }
        }
    }

    async fn audio_pump(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return,
                chunk = rx.recv() => chunk,
            };
            let Some(chunk) = chunk else { return };
            if self.stop_recv.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(asr) = &self.asr
                && let Err(e) = asr.send_audio(chunk).await
            {
                error!(error = %e, "failed to send audio data");
            }
        }
    }

    // ========================================================================
    // Chat control
    // ========================================================================

    async fn handle_client_text(self: &Arc<Self>, content: &str) -> Result<()> {
        let frame = match ClientTextFrame::parse(content.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = self.send_error_frame(ERR_INVALID_DATA_TYPE.code(), ERR_INVALID_DATA_TYPE.msg()).await;
                return Err(ServerError::Json(e));
            }
        };
        match frame.kind.as_str() {
            "abort" => {
                self.abort_chat().await;
                Ok(())
            }
            "chat" => {
                // New chat text interrupts whatever is still streaming.
                self.abort_chat().await;
                self.handle_chat(&frame.chat_text).await
            }
            other => Err(ServerError::UnsupportedMessage(other.to_string())),
        }
    }

    /// Cut the current round: suppress outbound frames and reset the agent
    /// and TTS. ASR and conversation memory stay intact. The interrupt flag
    /// is cleared only when the next round starts, so late callbacks stay
    /// suppressed.
    async fn abort_chat(&self) {
        info!("abort chat");
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(agent) = self.agent() {
            agent.reset();
        }
        if let Some(tts) = &self.tts {
            tts.reset().await;
        }
    }

    /// Start a new chat round for `text`.
    async fn handle_chat(self: &Arc<Self>, text: &str) -> Result<()> {
        if text.is_empty() {
            self.abort_chat().await;
            return Err(ServerError::UnsupportedMessage(
                "empty text message, skip".to_string(),
            ));
        }

        let round = self.chat_round.fetch_add(1, Ordering::SeqCst) + 1;
        info!(round, "start new chat round");

        if self.is_exit(text) {
            // Let the reply finish, then close.
            self.close_after_chat.store(true, Ordering::SeqCst);
            self.stop_recv.store(true, Ordering::SeqCst);
            info!("user requested exit, closing after this chat round");
        }

        self.interrupt.store(false, Ordering::SeqCst);

        let session = self.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            let Some(agent) = session.agent() else {
                error!("no agent installed, dropping chat");
                return;
            };
            if let Err(e) = agent.run(&text).await {
                error!(error = %e, "agent run error");
                if session.close_after_chat.load(Ordering::SeqCst) {
                    session.close().await;
                }
                return;
            }
            if session.close_after_chat.load(Ordering::SeqCst) {
                info!("close after chat");
                session.close().await;
            }
        });
        Ok(())
    }

    fn is_exit(&self, text: &str) -> bool {
        let config = self.cfg.snapshot();
        if config.cmd_exit.is_empty() {
            return false;
        }
        let stripped = remove_all_punctuation(text);
        config.cmd_exit.iter().any(|cmd| *cmd == stripped)
    }

    /// Idempotent teardown: close the connection, cancel every pump, reset
    /// ASR, agent and TTS in that order.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.conn.close().await;
        self.cancel.cancel();

        if let Some(asr) = &self.asr {
            asr.reset().await;
        }
        if let Some(agent) = self.agent() {
            agent.reset();
        }
        if let Some(tts) = &self.tts {
            tts.reset().await;
        }
        info!(session_id = %self.session_id, "session closed");
    }

    // ========================================================================
    // Outbound frames
    // ========================================================================

    async fn send_frame<T: serde::Serialize>(&self, frame: &T) -> Result<()> {
        let data = serde_json::to_vec(frame)?;
        if let Err(e) = self.conn.write_frame(FrameKind::Text, data).await {
            if self.conn.is_closed() {
                self.close().await;
                return Ok(());
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_error_frame(&self, code: i32, msg: &str) -> Result<()> {
        self.send_frame(&ErrorFrame::new(&self.session_id, code, msg))
            .await
    }
}

// ============================================================================
// Provider callbacks
// ============================================================================

#[async_trait::async_trait]
impl crate::asr::AsrListener for Session {
    async fn on_asr_result(&self, result: &str, state: AsrState) -> bool {
        let mut result = result.to_string();
        let mut state = state;
        let mut is_system_msg = false;

        // Two consecutive silence windows end the conversation politely.
        if self.asr.as_ref().is_some_and(|a| a.silence_count() >= 2) {
            info!("two consecutive silence windows detected, ending conversation");
            self.close_after_chat.store(true, Ordering::SeqCst);
            self.stop_recv.store(true, Ordering::SeqCst);
            state = AsrState::Completed;
            result = SILENCE_PROMPT.to_string();
            is_system_msg = true;
        }

        if result.is_empty() && state == AsrState::Processing {
            return false;
        }

        // Synthetic prompts are for the agent only, not the client.
        if !is_system_msg
            && self
                .send_frame(&AsrFrame::new(&self.session_id, &result, state.as_wire()))
                .await
                .is_err()
        {
            return true;
        }

        let this = self.arc();
        match state {
            AsrState::SentenceEnd => {
                if let Err(e) = this.handle_chat(&result).await {
                    error!(error = %e, "failed to handle chat message");
                }
                false
            }
            AsrState::Completed => {
                if let Some(asr) = &self.asr {
                    // Back to idle for the next utterance.
                    asr.reset().await;
                }
                if let Err(e) = this.handle_chat(&result).await {
                    error!(error = %e, "failed to handle chat message");
                }
                true
            }
            AsrState::Processing => {
                // A fresh partial while a reply streams is a barge-in.
                if !self.interrupt.load(Ordering::SeqCst) {
                    self.abort_chat().await;
                }
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl AgentListener for Session {
    async fn on_agent_result(&self, text: &str, state: ReplyState) -> bool {
        if self.interrupt.load(Ordering::SeqCst) {
            return true;
        }
        if text.is_empty() && state != ReplyState::Completed {
            return false;
        }

        if !text.is_empty() {
            if self
                .send_frame(&ChatFrame::new(&self.session_id, text))
                .await
                .is_err()
            {
                error!("failed to send chat message");
                return true;
            }
            if self.enable_tts.load(Ordering::SeqCst)
                && let Some(tts) = &self.tts
                && let Err(e) = tts.to_tts(text).await
            {
                error!(error = %e, "failed to convert text to tts");
                return false;
            }
        }

        if state == ReplyState::Completed {
            if self.enable_tts.load(Ordering::SeqCst)
                && let Some(tts) = &self.tts
                && let Err(e) = tts.to_session_finish().await
            {
                error!(error = %e, "failed to flush tts session");
            }
            if let Some(agent) = self.agent() {
                agent.reset();
            }
            return true;
        }
        false
    }
}

#[async_trait::async_trait]
impl crate::tts::TtsListener for Session {
    async fn on_tts_result(&self, audio: &[u8], state: TtsState) -> bool {
        // Stay subscribed but drop frames of an aborted round.
        if self.interrupt.load(Ordering::SeqCst) {
            return false;
        }
        if audio.is_empty() && state != TtsState::Completed {
            return false;
        }

        let encoded = BASE64.encode(audio);
        if let Err(e) = self
            .send_frame(&TtsFrame::new(&self.session_id, encoded, state.as_wire()))
            .await
        {
            error!(error = %e, "failed to send tts message");
        }

        if state == TtsState::Completed {
            if let Some(tts) = &self.tts {
                tts.reset().await;
            }
            return true;
        }
        false
    }
}

// ============================================================================
// Param conversions
// ============================================================================

fn asr_params_from(cfg: &AsrConfig) -> AsrParams {
    AsrParams {
        format: cfg.format.clone(),
        sample_rate: cfg.sample_rate,
        channels: cfg.channels,
        vad_eos: cfg.vad_eos,
        enable_punc: cfg.enable_punc,
        language: cfg.language.clone(),
        accent: cfg.accent.clone(),
    }
}

fn tts_params_from(cfg: &TtsConfig) -> TtsParams {
    TtsParams {
        speaker: cfg.speaker.clone(),
        format: cfg.format.clone(),
        speed: cfg.speed,
        volume: cfg.volume,
        pitch: cfg.pitch,
        sample_rate: cfg.sample_rate,
        language: cfg.language.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::AsrListener;
    use crate::config::Config;
    use crate::error::ConnError;
    use crate::tts::TtsListener;
    use crow::AgentResult;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    // ------------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------------

    struct MockConn {
        inbound: TokioMutex<mpsc::Receiver<(FrameKind, Vec<u8>)>>,
        outbound: StdMutex<Vec<serde_json::Value>>,
        closed: AtomicBool,
        real_closes: AtomicUsize,
    }

    fn mock_conn() -> (Arc<MockConn>, mpsc::Sender<(FrameKind, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Arc::new(MockConn {
                inbound: TokioMutex::new(rx),
                outbound: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                real_closes: AtomicUsize::new(0),
            }),
            tx,
        )
    }

    impl MockConn {
        fn frames_of(&self, kind: &str) -> Vec<serde_json::Value> {
            self.outbound
                .lock()
                .expect("outbound lock")
                .iter()
                .filter(|f| f["type"] == kind)
                .cloned()
                .collect()
        }

        fn chat_texts(&self) -> Vec<String> {
            self.frames_of("chat")
                .iter()
                .map(|f| f["text"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Conn for MockConn {
        async fn read_frame(&self) -> crate::error::ConnResult<(FrameKind, Vec<u8>)> {
            if self.is_closed() {
                return Err(ConnError::Closed);
            }
            match self.inbound.lock().await.recv().await {
                Some(frame) => Ok(frame),
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    Err(ConnError::Closed)
                }
            }
        }

        async fn write_frame(
            &self,
            _kind: FrameKind,
            data: Vec<u8>,
        ) -> crate::error::ConnResult<()> {
            if self.is_closed() {
                return Err(ConnError::Closed);
            }
            let value = serde_json::from_slice(&data)
                .map_err(|e| ConnError::Transport(e.to_string()))?;
            self.outbound.lock().expect("outbound lock").push(value);
            Ok(())
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.real_closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Scripted reply for one agent run.
    struct Script {
        deltas: Vec<&'static str>,
        /// Keep the run open after the deltas until interrupted.
        hold: bool,
    }

    struct MockAgent {
        listener: RwLock<Option<Arc<dyn AgentListener>>>,
        scripts: TokioMutex<VecDeque<Script>>,
        run_lock: TokioMutex<()>,
        interrupt: AtomicBool,
        resets: AtomicUsize,
        prompts: StdMutex<Vec<String>>,
    }

    impl MockAgent {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                listener: RwLock::new(None),
                scripts: TokioMutex::new(scripts.into()),
                run_lock: TokioMutex::new(()),
                interrupt: AtomicBool::new(false),
                resets: AtomicUsize::new(0),
                prompts: StdMutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().expect("prompts lock").clone()
        }

        fn listener(&self) -> Option<Arc<dyn AgentListener>> {
            self.listener.read().expect("listener lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl AgentProvider for MockAgent {
        fn set_listener(&self, listener: Arc<dyn AgentListener>) {
            *self.listener.write().expect("listener lock") = Some(listener);
        }

        async fn run(&self, user_prompt: &str) -> AgentResult<()> {
            let _guard = self.run_lock.lock().await;
            self.interrupt.store(false, Ordering::SeqCst);
            self.prompts
                .lock()
                .expect("prompts lock")
                .push(user_prompt.to_string());

            let script = self
                .scripts
                .lock()
                .await
                .pop_front()
                .unwrap_or(Script { deltas: vec![], hold: false });
            let Some(listener) = self.listener() else {
                return Ok(());
            };

            for delta in script.deltas {
                if self.interrupt.load(Ordering::SeqCst) {
                    break;
                }
                if listener.on_agent_result(delta, ReplyState::Processing).await {
                    self.interrupt.store(true, Ordering::SeqCst);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            if script.hold {
                for _ in 0..200 {
                    if self.interrupt.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }

            if !self.interrupt.load(Ordering::SeqCst) {
                listener.on_agent_result("", ReplyState::Completed).await;
            }
            Ok(())
        }

        fn reset(&self) {
            self.interrupt.store(true, Ordering::SeqCst);
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockAsr {
        silence: AtomicU32,
        chunks: StdMutex<Vec<Vec<u8>>>,
        resets: AtomicUsize,
    }

    impl MockAsr {
        fn new(silence: u32) -> Arc<Self> {
            Arc::new(Self {
                silence: AtomicU32::new(silence),
                chunks: StdMutex::new(Vec::new()),
                resets: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl AsrProvider for MockAsr {
        fn set_config(&self, mut cfg: AsrConfig) -> AsrConfig {
            if cfg.language.is_empty() {
                cfg.language = "zh".to_string();
            }
            if cfg.sample_rate == 0 {
                cfg.sample_rate = 16000;
            }
            if cfg.format.is_empty() {
                cfg.format = "pcm".to_string();
            }
            cfg
        }

        fn set_listener(&self, _listener: Arc<dyn AsrListener>) {}

        async fn send_audio(&self, data: Vec<u8>) -> Result<()> {
            self.chunks.lock().expect("chunks lock").push(data);
            Ok(())
        }

        fn silence_count(&self) -> u32 {
            self.silence.load(Ordering::SeqCst)
        }

        async fn reset(&self) {
            self.silence.store(0, Ordering::SeqCst);
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockTts {
        texts: StdMutex<Vec<String>>,
        finishes: AtomicUsize,
        resets: AtomicUsize,
    }

    impl MockTts {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                texts: StdMutex::new(Vec::new()),
                finishes: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl TtsProvider for MockTts {
        fn set_config(&self, mut cfg: TtsConfig) -> TtsConfig {
            if cfg.speaker.is_empty() {
                cfg.speaker = "mock-voice".to_string();
            }
            if cfg.volume == 0 {
                cfg.volume = 50;
            }
            cfg
        }

        fn set_listener(&self, _listener: Arc<dyn TtsListener>) {}

        async fn to_tts(&self, text: &str) -> Result<()> {
            self.texts.lock().expect("texts lock").push(text.to_string());
            Ok(())
        }

        async fn to_session_finish(&self) -> Result<()> {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------------

    fn test_config(cmd_exit: Vec<&str>) -> ConfigHandle {
        ConfigHandle::fixed(Config {
            cmd_exit: cmd_exit.into_iter().map(String::from).collect(),
            ..Config::default()
        })
    }

    struct Harness {
        session: Arc<Session>,
        conn: Arc<MockConn>,
        client: mpsc::Sender<(FrameKind, Vec<u8>)>,
        agent: Arc<MockAgent>,
    }

    /// Build a session, deliver the hello frame and wait until the agent is
    /// installed.
    async fn start_session(
        cmd_exit: Vec<&str>,
        hello: &str,
        asr: Option<Arc<MockAsr>>,
        tts: Option<Arc<MockTts>>,
        scripts: Vec<Script>,
    ) -> Harness {
        let (conn, client) = mock_conn();
        let session = Session::new(
            test_config(cmd_exit),
            conn.clone(),
            asr.map(|a| a as Arc<dyn AsrProvider>),
            tts.map(|t| t as Arc<dyn TtsProvider>),
        );
        let agent = MockAgent::new(scripts);

        client
            .send((FrameKind::Text, hello.as_bytes().to_vec()))
            .await
            .expect("send hello");

        let agent_for_factory = agent.clone();
        tokio::spawn(session.clone().handle(move || async move {
            Ok(agent_for_factory as Arc<dyn AgentProvider>)
        }));

        wait_until(|| session.agent().is_some()).await;
        Harness {
            session,
            conn,
            client,
            agent,
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn send_text(client: &mpsc::Sender<(FrameKind, Vec<u8>)>, text: &str) {
        client
            .send((FrameKind::Text, text.as_bytes().to_vec()))
            .await
            .expect("send text frame");
    }

    // ------------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_happy_text_chat_without_tts() {
        let h = start_session(
            vec![],
            r#"{"type":"hello"}"#,
            None,
            None,
            vec![Script { deltas: vec!["你", "好"], hold: false }],
        )
        .await;

        assert_eq!(h.conn.frames_of("hello").len(), 1);

        send_text(&h.client, r#"{"type":"chat","chat_text":"你好"}"#).await;
        wait_until(|| h.conn.chat_texts().concat() == "你好").await;

        assert!(h.conn.frames_of("tts").is_empty());
        assert!(!h.conn.is_closed());
        assert_eq!(h.agent.prompts(), vec!["你好"]);
    }

    #[tokio::test]
    async fn test_hello_echo_contains_effective_params() {
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_asr":true,"enable_tts":true,
                "asr_params":{"vad_eos":800},
                "tts_params":{"speed":1.5}}"#,
            Some(MockAsr::new(0)),
            Some(MockTts::new()),
            vec![],
        )
        .await;

        let hello = &h.conn.frames_of("hello")[0];
        assert_eq!(hello["session_id"], h.session.session_id());
        // Defaults applied by the provider are echoed back.
        assert_eq!(hello["asr_params"]["language"], "zh");
        assert_eq!(hello["asr_params"]["sample_rate"], 16000);
        assert_eq!(hello["asr_params"]["vad_eos"], 800);
        assert_eq!(hello["tts_params"]["speaker"], "mock-voice");
        assert_eq!(hello["tts_params"]["volume"], 50);
        assert_eq!(hello["tts_params"]["speed"], 1.5);
    }

    #[tokio::test]
    async fn test_malformed_text_frame_sends_error_and_continues() {
        let h = start_session(
            vec![],
            r#"{"type":"hello"}"#,
            None,
            None,
            vec![Script { deltas: vec!["ok"], hold: false }],
        )
        .await;

        send_text(&h.client, "not json").await;
        wait_until(|| !h.conn.frames_of("error").is_empty()).await;
        let error = &h.conn.frames_of("error")[0];
        assert_eq!(error["error_code"], 10400);

        // The session survives the bad frame.
        send_text(&h.client, r#"{"type":"chat","chat_text":"hi"}"#).await;
        wait_until(|| h.conn.chat_texts().concat() == "ok").await;
    }

    #[tokio::test]
    async fn test_abort_suppresses_previous_round() {
        let tts = MockTts::new();
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_tts":true}"#,
            None,
            Some(tts.clone()),
            vec![
                Script { deltas: vec!["A1"], hold: true },
                Script { deltas: vec!["B1", "B2"], hold: false },
            ],
        )
        .await;

        send_text(&h.client, r#"{"type":"chat","chat_text":"first"}"#).await;
        wait_until(|| h.conn.chat_texts().contains(&"A1".to_string())).await;

        send_text(&h.client, r#"{"type":"abort"}"#).await;
        wait_until(|| h.agent.resets.load(Ordering::SeqCst) >= 1).await;
        assert!(tts.resets.load(Ordering::SeqCst) >= 1);

        send_text(&h.client, r#"{"type":"chat","chat_text":"second"}"#).await;
        wait_until(|| h.conn.chat_texts().contains(&"B2".to_string())).await;

        // No frame of the aborted round is delivered after the first frame
        // of the new round.
        let texts = h.conn.chat_texts();
        let first_b = texts.iter().position(|t| t.starts_with('B')).expect("B1");
        assert!(
            texts[first_b..].iter().all(|t| !t.starts_with('A')),
            "stale frames after new round: {texts:?}"
        );
    }

    #[tokio::test]
    async fn test_new_chat_interrupts_streaming_reply() {
        let h = start_session(
            vec![],
            r#"{"type":"hello"}"#,
            None,
            None,
            vec![
                Script { deltas: vec!["old"], hold: true },
                Script { deltas: vec!["new"], hold: false },
            ],
        )
        .await;

        send_text(&h.client, r#"{"type":"chat","chat_text":"one"}"#).await;
        wait_until(|| h.conn.chat_texts().contains(&"old".to_string())).await;

        // A chat while streaming aborts implicitly before the new round.
        send_text(&h.client, r#"{"type":"chat","chat_text":"two"}"#).await;
        wait_until(|| h.conn.chat_texts().contains(&"new".to_string())).await;
        assert!(h.agent.resets.load(Ordering::SeqCst) >= 1);
        assert_eq!(h.agent.prompts(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_exit_phrase_closes_after_reply() {
        let h = start_session(
            vec!["再见"],
            r#"{"type":"hello"}"#,
            None,
            None,
            vec![Script { deltas: vec!["拜拜"], hold: false }],
        )
        .await;

        send_text(&h.client, r#"{"type":"chat","chat_text":"再见。"}"#).await;
        wait_until(|| h.conn.is_closed()).await;

        // The reply went out before the close.
        assert_eq!(h.conn.chat_texts().concat(), "拜拜");
        assert_eq!(h.conn.real_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silence_shutdown_runs_synthetic_prompt() {
        let asr = MockAsr::new(2);
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_asr":true}"#,
            Some(asr.clone()),
            None,
            vec![Script { deltas: vec!["下次聊"], hold: false }],
        )
        .await;

        // The provider reports two consecutive silence windows.
        let stop = h.session.on_asr_result("", AsrState::Processing).await;
        assert!(stop, "silence completion terminates the asr reader");

        wait_until(|| h.conn.is_closed()).await;
        assert_eq!(h.agent.prompts(), vec![SILENCE_PROMPT]);
        // The synthetic prompt is never mirrored to the client.
        assert!(h.conn.frames_of("asr").is_empty());
        assert_eq!(h.conn.chat_texts().concat(), "下次聊");
    }

    #[tokio::test]
    async fn test_asr_sentence_end_starts_chat_round() {
        let asr = MockAsr::new(0);
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_asr":true}"#,
            Some(asr.clone()),
            None,
            vec![Script { deltas: vec!["reply"], hold: false }],
        )
        .await;

        let stop = h.session.on_asr_result("讲个笑话", AsrState::SentenceEnd).await;
        assert!(!stop);

        wait_until(|| h.agent.prompts() == vec!["讲个笑话"]).await;
        let frames = h.conn.frames_of("asr");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["result"], "讲个笑话");
        assert_eq!(frames[0]["state"], 1);
    }

    #[tokio::test]
    async fn test_asr_partial_barges_in() {
        let asr = MockAsr::new(0);
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_asr":true}"#,
            Some(asr.clone()),
            None,
            vec![Script { deltas: vec!["long reply"], hold: true }],
        )
        .await;

        send_text(&h.client, r#"{"type":"chat","chat_text":"start"}"#).await;
        wait_until(|| h.conn.chat_texts().contains(&"long reply".to_string())).await;

        // A non-empty partial while the reply streams interrupts it.
        let stop = h.session.on_asr_result("换一个", AsrState::Processing).await;
        assert!(!stop);
        wait_until(|| h.agent.resets.load(Ordering::SeqCst) >= 1).await;

        let frames = h.conn.frames_of("asr");
        assert_eq!(frames[0]["result"], "换一个");
        assert_eq!(frames[0]["state"], 0);
    }

    #[tokio::test]
    async fn test_asr_completed_resets_provider() {
        let asr = MockAsr::new(0);
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_asr":true}"#,
            Some(asr.clone()),
            None,
            vec![Script { deltas: vec!["reply"], hold: false }],
        )
        .await;

        let stop = h.session.on_asr_result("现在几点", AsrState::Completed).await;
        assert!(stop, "completed terminates the asr reader");
        wait_until(|| h.agent.prompts() == vec!["现在几点"]).await;
        assert!(asr.resets.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_agent_deltas_feed_tts() {
        let tts = MockTts::new();
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_tts":true}"#,
            None,
            Some(tts.clone()),
            vec![Script { deltas: vec!["你好，", "世界。"], hold: false }],
        )
        .await;

        send_text(&h.client, r#"{"type":"chat","chat_text":"hi"}"#).await;
        wait_until(|| tts.finishes.load(Ordering::SeqCst) == 1).await;

        assert_eq!(
            tts.texts.lock().expect("texts lock").clone(),
            vec!["你好，", "世界。"]
        );
    }

    #[tokio::test]
    async fn test_tts_callback_mirrors_audio() {
        let tts = MockTts::new();
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_tts":true}"#,
            None,
            Some(tts.clone()),
            vec![],
        )
        .await;

        let stop = h.session.on_tts_result(b"abc", TtsState::Processing).await;
        assert!(!stop);
        let stop = h.session.on_tts_result(&[], TtsState::Completed).await;
        assert!(stop);

        let frames = h.conn.frames_of("tts");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["audio"], "YWJj");
        assert_eq!(frames[0]["state"], 0);
        assert_eq!(frames[1]["state"], 1);
        assert!(tts.resets.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_interrupt_drops_tts_frames() {
        let tts = MockTts::new();
        let h = start_session(
            vec![],
            r#"{"type":"hello","enable_tts":true}"#,
            None,
            Some(tts.clone()),
            vec![],
        )
        .await;

        h.session.interrupt.store(true, Ordering::SeqCst);
        let stop = h.session.on_tts_result(b"late", TtsState::Processing).await;
        // Stays alive but drops the frame.
        assert!(!stop);
        assert!(h.conn.frames_of("tts").is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_under_concurrency() {
        let h = start_session(vec![], r#"{"type":"hello"}"#, None, None, vec![]).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let session = h.session.clone();
            handles.push(tokio::spawn(async move { session.close().await }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        assert_eq!(h.conn.real_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_recv_drops_client_text() {
        let h = start_session(
            vec![],
            r#"{"type":"hello"}"#,
            None,
            None,
            vec![Script { deltas: vec!["never"], hold: false }],
        )
        .await;

        h.session.stop_recv.store(true, Ordering::SeqCst);
        send_text(&h.client, r#"{"type":"chat","chat_text":"ignored"}"#).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.agent.prompts().is_empty());
        assert!(h.conn.chat_texts().is_empty());
    }
}
