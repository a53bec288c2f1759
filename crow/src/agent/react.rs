//! ReAct agent: alternate think (LLM call) and act (tool execution) until a
//! special tool fires, the step limit is reached or the run is interrupted.

use crate::agent::{AgentListener, AgentProvider, AgentState, ReplyState};
use crate::error::{AgentError, AgentResult};
use crate::llm::{ChatRequest, DELTA_CHANNEL_CAPACITY, Llm, StreamDelta};
use crate::memory::{INTERRUPTED_TOOL_RESULT, Memory};
use crate::schema::{Message, ToolCall, ToolChoice};
use crate::tool::{ToolFlow, ToolRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

const DEFAULT_MAX_STEPS: usize = 20;
const DEFAULT_DUPLICATE_THRESHOLD: usize = 2;
const DEFAULT_PEER_ASK_TIMEOUT: Duration = Duration::from_secs(300);

const STUCK_PROMPT: &str = "Observed duplicate responses. Consider a new \
strategy and avoid repeating paths that have already proven ineffective.";

/// Mutable state owned by a run. The mutex doubles as the per-agent run
/// lock: two runs can never overlap.
struct RunState {
    memory: Memory,
    next_step_prompt: String,
    tool_calls: Vec<ToolCall>,
    state: AgentState,
    current_step: usize,
}

/// Think→act loop agent over an LLM and a tool registry.
pub struct ReActAgent {
    name: String,
    llm: Arc<dyn Llm>,
    registry: Arc<ToolRegistry>,
    listener: std::sync::RwLock<Option<Arc<dyn AgentListener>>>,

    system_prompt: String,
    support_images: bool,
    max_steps: usize,
    max_observe: usize,
    peer_ask_timeout: Duration,
    duplicate_threshold: usize,

    interrupt: Arc<AtomicBool>,
    run_state: Mutex<RunState>,
}

impl std::fmt::Debug for ReActAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReActAgent")
            .field("name", &self.name)
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

impl ReActAgent {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> ReActAgentBuilder {
        ReActAgentBuilder::default()
    }

    fn listener(&self) -> Option<Arc<dyn AgentListener>> {
        self.listener.read().expect("listener lock poisoned").clone()
    }

    async fn drive(&self, run: &mut RunState) -> AgentResult<()> {
        let mut executed = 0usize;
        while run.current_step < self.max_steps
            && run.state != AgentState::Finished
            && !self.interrupt.load(Ordering::SeqCst)
        {
            run.current_step += 1;
            executed += 1;
            let step = run.current_step;
            let result = self
                .step(run)
                .await
                .map_err(|e| AgentError::step(step, e.to_string()))?;
            debug!(agent = %self.name, step, result = %result, "step finished");

            if self.is_stuck(run) {
                self.handle_stuck(run);
            }
        }

        if run.current_step >= self.max_steps {
            info!(agent = %self.name, max_steps = self.max_steps, "reached max steps");
        }
        if executed == 0 {
            return Err(AgentError::NoStepsExecuted);
        }
        Ok(())
    }

    async fn step(&self, run: &mut RunState) -> AgentResult<String> {
        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let reader = self.spawn_delta_reader(rx);

        let thought = self.think(run, tx).await;
        let _ = reader.await;
        let should_act = thought?;

        if !should_act {
            run.state = AgentState::Finished;
            return Ok("thinking complete - no action needed".to_string());
        }
        self.act(run).await
    }

    /// Forward streamed content deltas to the listener until the stream
    /// ends or the listener asks to stop.
    fn spawn_delta_reader(
        &self,
        mut rx: mpsc::Receiver<StreamDelta>,
    ) -> tokio::task::JoinHandle<()> {
        let listener = self.listener();
        let interrupt = Arc::clone(&self.interrupt);
        tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                let StreamDelta::Content(text) = delta else {
                    continue;
                };
                if text.is_empty() {
                    continue;
                }
                let Some(listener) = &listener else { continue };
                if listener.on_agent_result(&text, ReplyState::Processing).await {
                    interrupt.store(true, Ordering::SeqCst);
                    return;
                }
            }
        })
    }

    async fn think(
        &self,
        run: &mut RunState,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> AgentResult<bool> {
        if !run.next_step_prompt.is_empty() {
            run.memory
                .add_message(Message::user(run.next_step_prompt.clone(), None));
        }

        let tool_choice = self.registry.tool_choice();
        let request = ChatRequest {
            timeout: Some(self.peer_ask_timeout),
            tool_choice,
            tools: self.registry.definitions(),
            system_message: (!self.system_prompt.is_empty())
                .then(|| Message::system(self.system_prompt.clone())),
            messages: run.memory.get_all().to_vec(),
            supports_images: self.support_images,
        };
        let response = self.llm.handle(request, deltas).await?;

        if tool_choice == ToolChoice::None {
            if !response.tool_calls.is_empty() {
                return Err(AgentError::step(
                    run.current_step,
                    format!("{} tried to use tools when they weren't available", self.name),
                ));
            }
            if !response.content.is_empty() {
                run.memory.add_message(Message::assistant(response.content));
                return Ok(true);
            }
            return Ok(false);
        }

        if response.tool_calls.is_empty() {
            run.tool_calls.clear();
            run.memory
                .add_message(Message::assistant(response.content.clone()));
        } else {
            run.tool_calls = response.tool_calls.clone();
            run.memory.add_message(Message::from_tool_calls(
                response.tool_calls,
                response.content.clone(),
            ));
        }

        match tool_choice {
            // Missing required calls are reported from act().
            ToolChoice::Required if run.tool_calls.is_empty() => Ok(true),
            ToolChoice::Auto if run.tool_calls.is_empty() => Ok(!response.content.is_empty()),
            _ => Ok(!run.tool_calls.is_empty()),
        }
    }

    async fn act(&self, run: &mut RunState) -> AgentResult<String> {
        if run.tool_calls.is_empty() {
            if self.registry.tool_choice() == ToolChoice::Required {
                return Err(AgentError::step(
                    run.current_step,
                    "tool calls required but none provided",
                ));
            }
            let last = run
                .memory
                .get_recent(1)
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if !last.is_empty() {
                return Ok(last);
            }
            return Ok("No content or commands to execute".to_string());
        }

        let calls = std::mem::take(&mut run.tool_calls);
        let mut results = Vec::with_capacity(calls.len());
        for (i, call) in calls.iter().enumerate() {
            if self.interrupt.load(Ordering::SeqCst) {
                self.mark_interrupted(run, &calls[i..]);
                break;
            }

            let (flow, mut output) = self.registry.execute(call).await;
            if self.max_observe > 0 {
                output = output.chars().take(self.max_observe).collect();
            }
            debug!(tool = %call.function.name, result = %output, "tool executed");

            run.memory
                .add_message(Message::tool(&output, &call.function.name, &call.id));
            results.push(output);

            if flow == ToolFlow::Finished {
                run.state = AgentState::Finished;
                info!(agent = %self.name, "all tools are executed");
                // Unexecuted calls still need answers for the model.
                self.mark_interrupted(run, &calls[i + 1..]);
                break;
            }
        }
        Ok(results.join("\n\n"))
    }

    /// Answer every not-yet-executed tool call with a synthetic marker so
    /// the memory invariant holds across the interruption.
    fn mark_interrupted(&self, run: &mut RunState, remaining: &[ToolCall]) {
        for call in remaining {
            run.memory.add_message(Message::tool(
                INTERRUPTED_TOOL_RESULT,
                &call.function.name,
                &call.id,
            ));
        }
    }

    /// Stuck when the last assistant content repeats at least
    /// `duplicate_threshold` earlier assistant messages.
    fn is_stuck(&self, run: &RunState) -> bool {
        if self.duplicate_threshold == 0 {
            return false;
        }
        let messages = run.memory.get_all();
        if messages.len() < self.duplicate_threshold {
            return false;
        }
        let Some(last) = messages.last() else {
            return false;
        };
        if last.content.is_empty() {
            return false;
        }
        let duplicates = messages[..messages.len() - 1]
            .iter()
            .filter(|m| m.role == crate::schema::Role::Assistant && m.content == last.content)
            .count();
        duplicates >= self.duplicate_threshold
    }

    fn handle_stuck(&self, run: &mut RunState) {
        info!(agent = %self.name, "stuck state detected, diversifying");
        run.next_step_prompt = format!("{STUCK_PROMPT}\n{}", run.next_step_prompt);
    }
}

#[async_trait]
impl AgentProvider for ReActAgent {
    fn set_listener(&self, listener: Arc<dyn AgentListener>) {
        *self.listener.write().expect("listener lock poisoned") = Some(listener);
    }

    async fn run(&self, user_prompt: &str) -> AgentResult<()> {
        if user_prompt.is_empty() {
            return Err(AgentError::EmptyPrompt);
        }

        let mut run = self.run_state.lock().await;
        // A stale interrupt from an abort that landed while idle must not
        // kill the round it was not aimed at.
        self.interrupt.store(false, Ordering::SeqCst);
        run.state = AgentState::Running;
        run.current_step = 0;

        run.memory.normalize();
        run.memory.add_message(Message::user(user_prompt, None));

        let result = self.drive(&mut run).await;
        if result.is_err() {
            run.state = AgentState::Error;
        }

        if !self.interrupt.load(Ordering::SeqCst)
            && let Some(listener) = self.listener()
        {
            listener.on_agent_result("", ReplyState::Completed).await;
        }

        run.state = AgentState::Idle;
        self.interrupt.store(false, Ordering::SeqCst);
        result
    }

    fn reset(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

/// Builder for [`ReActAgent`].
pub struct ReActAgentBuilder {
    name: String,
    llm: Option<Arc<dyn Llm>>,
    registry: Option<Arc<ToolRegistry>>,
    system_prompt: String,
    next_step_prompt: String,
    support_images: bool,
    max_steps: usize,
    max_observe: usize,
    peer_ask_timeout: Duration,
    duplicate_threshold: usize,
    memory_max: usize,
}

impl Default for ReActAgentBuilder {
    fn default() -> Self {
        Self {
            name: "agent".to_string(),
            llm: None,
            registry: None,
            system_prompt: String::new(),
            next_step_prompt: String::new(),
            support_images: false,
            max_steps: DEFAULT_MAX_STEPS,
            max_observe: 0,
            peer_ask_timeout: DEFAULT_PEER_ASK_TIMEOUT,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            memory_max: 0,
        }
    }
}

impl ReActAgentBuilder {
    /// Set the agent name used in logs and error messages.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the chat model.
    #[must_use]
    pub fn llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Set the tool registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Set the prompt injected before each think step.
    #[must_use]
    pub fn next_step_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.next_step_prompt = prompt.into();
        self
    }

    /// Forward user images to the model.
    #[must_use]
    pub const fn support_images(mut self, support: bool) -> Self {
        self.support_images = support;
        self
    }

    /// Maximum think/act iterations per run.
    #[must_use]
    pub const fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = if max_steps == 0 { DEFAULT_MAX_STEPS } else { max_steps };
        self
    }

    /// Truncate tool outputs to this many characters; 0 disables.
    #[must_use]
    pub const fn max_observe(mut self, max_observe: usize) -> Self {
        self.max_observe = max_observe;
        self
    }

    /// Per-LLM-request timeout.
    #[must_use]
    pub const fn peer_ask_timeout(mut self, timeout: Duration) -> Self {
        self.peer_ask_timeout = timeout;
        self
    }

    /// Repetitions of an assistant reply that count as stuck; 0 disables.
    #[must_use]
    pub const fn duplicate_threshold(mut self, threshold: usize) -> Self {
        self.duplicate_threshold = threshold;
        self
    }

    /// Bound on the conversation memory.
    #[must_use]
    pub const fn memory_max(mut self, memory_max: usize) -> Self {
        self.memory_max = memory_max;
        self
    }

    /// Build the agent.
    ///
    /// # Panics
    ///
    /// Panics if the LLM or the registry is not set.
    #[must_use]
    pub fn build(self) -> ReActAgent {
        let memory = if self.memory_max > 0 {
            Memory::new(self.memory_max)
        } else {
            Memory::default()
        };
        ReActAgent {
            name: self.name,
            llm: self.llm.expect("llm is required"),
            registry: self.registry.expect("registry is required"),
            listener: std::sync::RwLock::new(None),
            system_prompt: self.system_prompt,
            support_images: self.support_images,
            max_steps: self.max_steps,
            max_observe: self.max_observe,
            peer_ask_timeout: self.peer_ask_timeout,
            duplicate_threshold: self.duplicate_threshold,
            interrupt: Arc::new(AtomicBool::new(false)),
            run_state: Mutex::new(RunState {
                memory,
                next_step_prompt: self.next_step_prompt,
                tool_calls: Vec::new(),
                state: AgentState::Idle,
                current_step: 0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmResult, ToolResult};
    use crate::llm::ChatResponse;
    use crate::schema::{Role, Tool};
    use crate::tool::ToolCaller;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted model: each turn streams its content in two deltas and
    /// returns the canned response.
    struct ScriptedLlm {
        turns: StdMutex<VecDeque<ChatResponse>>,
    }

    impl ScriptedLlm {
        fn new(turns: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                turns: StdMutex::new(turns.into()),
            })
        }
    }

    #[async_trait]
    impl Llm for ScriptedLlm {
        async fn handle(
            &self,
            _request: ChatRequest,
            deltas: mpsc::Sender<StreamDelta>,
        ) -> LlmResult<ChatResponse> {
            let response = self
                .turns
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_default();
            let content = response.content.clone();
            if !content.is_empty() {
                let mid = content.len() / 2;
                let (a, b) = content.split_at(mid);
                let _ = deltas.send(StreamDelta::Content(a.to_string())).await;
                let _ = deltas.send(StreamDelta::Content(b.to_string())).await;
            }
            let _ = deltas.send(StreamDelta::Final).await;
            Ok(response)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<(String, ReplyState)>>,
        stop_after: Option<usize>,
    }

    impl Recorder {
        fn completed_count(&self) -> usize {
            self.events
                .lock()
                .expect("events lock")
                .iter()
                .filter(|(_, s)| *s == ReplyState::Completed)
                .count()
        }

        fn concatenated(&self) -> String {
            self.events
                .lock()
                .expect("events lock")
                .iter()
                .map(|(t, _)| t.as_str())
                .collect()
        }
    }

    #[async_trait]
    impl AgentListener for Recorder {
        async fn on_agent_result(&self, text: &str, state: ReplyState) -> bool {
            let mut events = self.events.lock().expect("events lock");
            events.push((text.to_string(), state));
            matches!(self.stop_after, Some(n) if events.len() >= n)
        }
    }

    struct SlowTool;

    #[async_trait]
    impl ToolCaller for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn definition(&self) -> Tool {
            Tool::function("slow", "sleeps", serde_json::json!({"type": "object"}))
        }
        async fn call(
            &self,
            _arguments: serde_json::Map<String, serde_json::Value>,
        ) -> ToolResult<String> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("done".to_string())
        }
    }

    struct LongTool;

    #[async_trait]
    impl ToolCaller for LongTool {
        fn name(&self) -> &str {
            "long"
        }
        fn definition(&self) -> Tool {
            Tool::function("long", "long output", serde_json::json!({"type": "object"}))
        }
        async fn call(
            &self,
            _arguments: serde_json::Map<String, serde_json::Value>,
        ) -> ToolResult<String> {
            Ok("x".repeat(1000))
        }
    }

    fn terminate_call(id: &str) -> ToolCall {
        ToolCall::function(id, "terminate", r#"{"status":"success"}"#)
    }

    fn agent_with(llm: Arc<ScriptedLlm>, registry: Arc<ToolRegistry>) -> (Arc<ReActAgent>, Arc<Recorder>) {
        let agent = Arc::new(
            ReActAgent::builder()
                .name("test")
                .llm(llm)
                .registry(registry)
                .build(),
        );
        let recorder = Arc::new(Recorder::default());
        agent.set_listener(recorder.clone());
        (agent, recorder)
    }

    #[tokio::test]
    async fn test_plain_reply_then_terminate() {
        let llm = ScriptedLlm::new(vec![ChatResponse {
            content: "hello there".to_string(),
            tool_calls: vec![terminate_call("c1")],
        }]);
        let (agent, recorder) = agent_with(llm, Arc::new(ToolRegistry::new()));

        agent.run("hi").await.unwrap();

        assert_eq!(recorder.completed_count(), 1);
        assert_eq!(recorder.concatenated(), "hello there");

        let run = agent.run_state.lock().await;
        let roles: Vec<Role> = run.memory.get_all().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
    }

    #[tokio::test]
    async fn test_tool_round_pairs_messages() {
        let llm = ScriptedLlm::new(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCall::function("c1", "current_time", "{}")],
            },
            ChatResponse {
                content: "it is noon".to_string(),
                tool_calls: vec![terminate_call("c2")],
            },
        ]);
        let (agent, _recorder) = agent_with(llm, Arc::new(ToolRegistry::new()));

        agent.run("what time is it").await.unwrap();

        let run = agent.run_state.lock().await;
        let all = run.memory.get_all();
        // Every issued tool call has a matching tool message.
        let issued: usize = all.iter().map(|m| m.tool_calls.len()).sum();
        let answered = all.iter().filter(|m| m.role == Role::Tool).count();
        assert_eq!(issued, answered);
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let llm = ScriptedLlm::new(vec![]);
        let (agent, _) = agent_with(llm, Arc::new(ToolRegistry::new()));
        assert!(matches!(
            agent.run("").await,
            Err(AgentError::EmptyPrompt)
        ));
    }

    #[tokio::test]
    async fn test_abort_mid_act_marks_unexecuted_calls() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(SlowTool));
        let llm = ScriptedLlm::new(vec![ChatResponse {
            content: String::new(),
            tool_calls: vec![
                ToolCall::function("c1", "slow", "{}"),
                ToolCall::function("c2", "current_time", "{}"),
            ],
        }]);
        let (agent, recorder) = agent_with(llm, registry);

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run("go").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.reset();
        let _ = runner.await.expect("join");

        // No Completed after an abort.
        assert_eq!(recorder.completed_count(), 0);

        let run = agent.run_state.lock().await;
        let all = run.memory.get_all();
        let marker = all
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c2"))
            .expect("synthetic tool message for unexecuted call");
        assert_eq!(marker.content, INTERRUPTED_TOOL_RESULT);
        // The next round starts clean: normalize leaves no dangling tail.
        let issued: usize = all.iter().map(|m| m.tool_calls.len()).sum();
        let answered = all.iter().filter(|m| m.role == Role::Tool).count();
        assert_eq!(issued, answered);
    }

    #[tokio::test]
    async fn test_listener_true_interrupts_run() {
        let llm = ScriptedLlm::new(vec![
            ChatResponse {
                content: "a long reply streamed in pieces".to_string(),
                tool_calls: vec![],
            },
            // Would loop again if not interrupted.
            ChatResponse {
                content: "should never be reached".to_string(),
                tool_calls: vec![terminate_call("c9")],
            },
        ]);
        let agent = Arc::new(
            ReActAgent::builder()
                .name("test")
                .llm(llm)
                .registry(Arc::new(ToolRegistry::new()))
                .build(),
        );
        let recorder = Arc::new(Recorder {
            stop_after: Some(1),
            ..Recorder::default()
        });
        agent.set_listener(recorder.clone());

        let _ = agent.run("hi").await;
        assert_eq!(recorder.completed_count(), 0);
    }

    #[tokio::test]
    async fn test_max_observe_truncates() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(LongTool));
        let llm = ScriptedLlm::new(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCall::function("c1", "long", "{}")],
            },
            ChatResponse {
                content: "ok".to_string(),
                tool_calls: vec![terminate_call("c2")],
            },
        ]);
        let agent = Arc::new(
            ReActAgent::builder()
                .llm(llm)
                .registry(registry)
                .max_observe(10)
                .build(),
        );
        agent.set_listener(Arc::new(Recorder::default()));
        agent.run("go").await.unwrap();

        let run = agent.run_state.lock().await;
        let tool_msg = run
            .memory
            .get_all()
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c1"))
            .expect("tool message");
        assert_eq!(tool_msg.content.chars().count(), 10);
    }

    #[tokio::test]
    async fn test_max_observe_zero_keeps_output() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(LongTool));
        let llm = ScriptedLlm::new(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCall::function("c1", "long", "{}")],
            },
            ChatResponse {
                content: "ok".to_string(),
                tool_calls: vec![terminate_call("c2")],
            },
        ]);
        let agent = Arc::new(
            ReActAgent::builder()
                .llm(llm)
                .registry(registry)
                .build(),
        );
        agent.set_listener(Arc::new(Recorder::default()));
        agent.run("go").await.unwrap();

        let run = agent.run_state.lock().await;
        let tool_msg = run
            .memory
            .get_all()
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c1"))
            .expect("tool message");
        assert_eq!(tool_msg.content.len(), 1000);
    }

    #[tokio::test]
    async fn test_stuck_detection_injects_diversification() {
        let repeat = |id: &str| ChatResponse {
            content: "same answer".to_string(),
            tool_calls: vec![ToolCall::function(id, "current_time", "{}")],
        };
        let llm = ScriptedLlm::new(vec![
            repeat("c1"),
            repeat("c2"),
            repeat("c3"),
            ChatResponse {
                content: "done".to_string(),
                tool_calls: vec![terminate_call("c4")],
            },
        ]);
        let agent = Arc::new(
            ReActAgent::builder()
                .llm(llm)
                .registry(Arc::new(ToolRegistry::new()))
                .duplicate_threshold(2)
                .build(),
        );
        agent.set_listener(Arc::new(Recorder::default()));
        agent.run("loop").await.unwrap();

        let run = agent.run_state.lock().await;
        assert!(run.next_step_prompt.contains("Consider a new strategy"));
        assert!(
            run.memory
                .get_all()
                .iter()
                .any(|m| m.role == Role::User && m.content.contains("Consider a new strategy")),
            "diversification prompt was injected into the context"
        );
    }

    #[tokio::test]
    async fn test_duplicate_threshold_zero_disables_stuck() {
        let repeat = |id: &str| ChatResponse {
            content: "same answer".to_string(),
            tool_calls: vec![ToolCall::function(id, "current_time", "{}")],
        };
        let llm = ScriptedLlm::new(vec![
            repeat("c1"),
            repeat("c2"),
            repeat("c3"),
            ChatResponse {
                content: "done".to_string(),
                tool_calls: vec![terminate_call("c4")],
            },
        ]);
        let agent = Arc::new(
            ReActAgent::builder()
                .llm(llm)
                .registry(Arc::new(ToolRegistry::new()))
                .duplicate_threshold(0)
                .build(),
        );
        agent.set_listener(Arc::new(Recorder::default()));
        agent.run("loop").await.unwrap();

        let run = agent.run_state.lock().await;
        assert!(run.next_step_prompt.is_empty());
    }

    #[tokio::test]
    async fn test_memory_survives_across_runs() {
        let llm = ScriptedLlm::new(vec![
            ChatResponse {
                content: "first".to_string(),
                tool_calls: vec![terminate_call("c1")],
            },
            ChatResponse {
                content: "second".to_string(),
                tool_calls: vec![terminate_call("c2")],
            },
        ]);
        let (agent, _) = agent_with(llm, Arc::new(ToolRegistry::new()));

        agent.run("one").await.unwrap();
        agent.run("two").await.unwrap();

        let run = agent.run_state.lock().await;
        let users: Vec<&str> = run
            .memory
            .get_all()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(users, vec!["one", "two"]);
    }
}
