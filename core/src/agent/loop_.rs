use crate::agent::{ContextBuilder, ToolRegistry};
use crate::error::{AgentError, ProviderError};
use crate::traits::{
    ChatMessage, ChatRequest, ChatResponse, Provider, Role, Session, SessionStore, ToolCall,
    ToolResult, ToolSpec,
};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MAX_TURNS: usize = 20;
const ARGS_PREVIEW_LEN: usize = 200;
const INTERRUPTED_CALL: &str = "interrupted before a result was recorded";

const TOOL_CALL_OPEN_TAG: &str = "<tool_call>";
const TOOL_CALL_CLOSE_TAG: &str = "</tool_call>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    ModelTurn,
    ToolTurn,
    Done,
}

/// Outcome of one completed turn.
#[derive(Debug, Clone)]
pub struct AssistantReply {
    pub session_id: String,
    pub text: String,
    /// Assistant and tool messages appended during the turn, in order.
    pub messages: Vec<ChatMessage>,
    pub model_turns: usize,
}

pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    context_builder: ContextBuilder,
    tool_registry: Arc<ToolRegistry>,
    session_store: Arc<dyn SessionStore>,
    tool_specs: Vec<ToolSpec>,
    model: String,
    temperature: f64,
    max_turns: usize,
    model_timeout: Option<Duration>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        context_builder: ContextBuilder,
        tool_registry: Arc<ToolRegistry>,
        session_store: Arc<dyn SessionStore>,
    ) -> Self {
        let tool_specs = tool_registry.list_tools();
        Self {
            provider,
            context_builder: context_builder.with_tool_specs(tool_specs.clone()),
            tool_registry,
            session_store,
            tool_specs,
            model: String::new(),
            temperature: 0.0,
            max_turns: DEFAULT_MAX_TURNS,
            model_timeout: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_turns(mut self, max: usize) -> Self {
        self.max_turns = max.max(1);
        self
    }

    pub fn with_model_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn tool_specs(&self) -> &[ToolSpec] {
        &self.tool_specs
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Session, AgentError> {
        Ok(self.session_store.load(session_id).await?)
    }

    pub async fn run_turn(
        &self,
        session: &mut Session,
        user_text: &str,
    ) -> Result<AssistantReply, AgentError> {
        self.run_turn_with_cancel(session, user_text, &CancellationToken::new())
            .await
    }

    /// Runs one user query to a final answer.
    ///
    /// Every appended message is checkpointed before the next step. On error
    /// the session holds exactly what was checkpointed.
    pub async fn run_turn_with_cancel(
        &self,
        session: &mut Session,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<AssistantReply, AgentError> {
        if user_text.trim().is_empty() {
            return Err(AgentError::EmptyInput);
        }

        self.answer_dangling_calls(session).await?;
        self.commit(session, ChatMessage::user(user_text)).await?;

        let turn_start = session.len();
        let mut state = TurnState::ModelTurn;
        let mut model_turns = 0;
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut final_text = String::new();

        while state != TurnState::Done {
            state = match state {
                TurnState::ModelTurn => {
                    if model_turns >= self.max_turns {
                        warn!(
                            session_id = %session.id,
                            "Agent loop reached max turns ({}) without final response",
                            self.max_turns
                        );
                        return Err(AgentError::MaxTurnsExceeded {
                            limit: self.max_turns,
                        });
                    }
                    model_turns += 1;

                    let response = self.call_model(session, cancel).await?;
                    let (text, tool_calls) = self.normalize_response(response)?;

                    if tool_calls.is_empty() {
                        self.commit(session, ChatMessage::assistant(text.clone()))
                            .await?;
                        final_text = text;
                        TurnState::Done
                    } else {
                        self.commit(
                            session,
                            ChatMessage::assistant_with_tool_calls(text, tool_calls.clone()),
                        )
                        .await?;
                        pending = tool_calls;
                        TurnState::ToolTurn
                    }
                }
                TurnState::ToolTurn => {
                    let total = pending.len();
                    for (idx, call) in pending.drain(..).enumerate() {
                        let result = self.call_tool(&call, idx, total, cancel).await?;
                        self.commit(session, ChatMessage::tool_result(call.id, &result))
                            .await?;
                    }
                    TurnState::ModelTurn
                }
                TurnState::Done => TurnState::Done,
            };
        }

        Ok(AssistantReply {
            session_id: session.id.clone(),
            text: final_text,
            messages: session.messages()[turn_start..].to_vec(),
            model_turns,
        })
    }

    async fn commit(&self, session: &mut Session, message: ChatMessage) -> Result<(), AgentError> {
        session.append(message);
        if let Err(e) = self.session_store.checkpoint(session).await {
            session.rollback_last();
            return Err(e.into());
        }
        Ok(())
    }

    /// A previous run may have stopped between an assistant tool request and
    /// its results. Those calls get failure results so the history stays
    /// well-formed for the model.
    async fn answer_dangling_calls(&self, session: &mut Session) -> Result<(), AgentError> {
        let messages = session.messages();
        let Some(request_idx) = messages.iter().rposition(|m| !m.tool_calls().is_empty()) else {
            return Ok(());
        };

        let answered: HashSet<&str> = messages[request_idx + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        let missing: Vec<String> = messages[request_idx]
            .tool_calls()
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();

        for id in missing {
            warn!(session_id = %session.id, call_id = %id, "Answering interrupted tool call");
            self.commit(
                session,
                ChatMessage::tool_result(id, &ToolResult::error(INTERRUPTED_CALL)),
            )
            .await?;
        }
        Ok(())
    }

    async fn call_model(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, AgentError> {
        let messages = self.context_builder.build_messages(session.messages());
        let request = ChatRequest {
            messages: &messages,
            tools: if self.tool_registry.is_empty() {
                None
            } else {
                Some(&self.tool_specs)
            },
        };

        debug!(
            session_id = %session.id,
            provider = self.provider.name(),
            messages = messages.len(),
            "Calling model"
        );

        let chat = self.provider.chat(request, &self.model, self.temperature);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            response = async {
                match self.model_timeout {
                    Some(limit) => tokio::time::timeout(limit, chat).await.unwrap_or_else(|_| {
                        Err(ProviderError::Unavailable(format!(
                            "no response within {} seconds",
                            limit.as_secs()
                        )))
                    }),
                    None => chat.await,
                }
            } => response,
        };

        Ok(response?)
    }

    async fn call_tool(
        &self,
        call: &ToolCall,
        idx: usize,
        total: usize,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let args = Value::Object(call.arguments.clone());
        info!(
            "Tool call [{}/{}]: {}({})",
            idx + 1,
            total,
            call.name,
            preview(&args.to_string())
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = self.tool_registry.invoke(&call.name, &args) => outcome,
        };

        if let Err(e) = &outcome {
            warn!(tool = %call.name, call_id = %call.id, "Tool failed: {}", e);
        }
        Ok(ToolResult::from(outcome))
    }

    fn normalize_response(
        &self,
        response: ChatResponse,
    ) -> Result<(String, Vec<ToolCall>), AgentError> {
        let (text, tool_calls) = if response.has_tool_calls() {
            (response.text.unwrap_or_default(), response.tool_calls)
        } else if let Some(text) = response.text {
            parse_tool_calls_fallback(&text)
        } else {
            (String::new(), Vec::new())
        };

        if text.trim().is_empty() && tool_calls.is_empty() {
            return Err(AgentError::MalformedModelResponse(
                "response has neither text nor tool calls".into(),
            ));
        }

        Ok((text, tool_calls))
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > ARGS_PREVIEW_LEN {
        let cut: String = text.chars().take(ARGS_PREVIEW_LEN).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// Pulls `<tool_call>{...}</tool_call>` blocks out of plain text, for models
/// that do not emit native tool calls.
fn parse_tool_calls_fallback(response: &str) -> (String, Vec<ToolCall>) {
    let mut text_parts = Vec::new();
    let mut calls = Vec::new();
    let mut remaining = response;

    while let Some(start) = remaining.find(TOOL_CALL_OPEN_TAG) {
        let after_open = &remaining[start + TOOL_CALL_OPEN_TAG.len()..];
        let Some(close_idx) = after_open.find(TOOL_CALL_CLOSE_TAG) else {
            break;
        };

        let before = remaining[..start].trim();
        if !before.is_empty() {
            text_parts.push(before.to_string());
        }

        for value in extract_json_values(&after_open[..close_idx]) {
            if let Some(call) = parse_tool_call_value(&value) {
                calls.push(call);
            }
        }

        remaining = &after_open[close_idx + TOOL_CALL_CLOSE_TAG.len()..];
    }

    if !remaining.trim().is_empty() {
        text_parts.push(remaining.trim().to_string());
    }

    (text_parts.join("\n"), calls)
}

fn extract_json_values(text: &str) -> Vec<Value> {
    let mut values = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if !in_string && depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(s) = start.take()
                    && let Ok(value) = serde_json::from_str::<Value>(&text[s..=i])
                {
                    values.push(value);
                }
            }
            _ => {}
        }
    }

    values
}

fn parse_tool_call_value(value: &Value) -> Option<ToolCall> {
    let name = value.get("name")?.as_str()?.to_string();
    let arguments: Map<String, Value> = match value.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(raw)) => serde_json::from_str(raw).ok()?,
        Some(_) => {
            warn!("Ignoring <tool_call> for {} with non-object arguments", name);
            return None;
        }
    };

    Some(ToolCall {
        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
        name,
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SessionError, ToolError};
    use crate::session::MemorySessionStore;
    use crate::traits::{SessionInfo, Tool};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
        requests: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<ChatResponse, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Vec<ChatMessage>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            request: ChatRequest<'_>,
            _model: &str,
            temperature: f64,
        ) -> Result<ChatResponse, ProviderError> {
            assert_eq!(temperature, 0.0);
            self.requests.lock().unwrap().push(request.messages.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Unavailable("script exhausted".into())))
        }
    }

    struct HangingProvider;

    #[async_trait]
    impl Provider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn chat(
            &self,
            _request: ChatRequest<'_>,
            _model: &str,
            _temperature: f64,
        ) -> Result<ChatResponse, ProviderError> {
            std::future::pending().await
        }
    }

    /// Sleeps for `delay_ms`, then echoes `label`.
    struct SleepyTool;

    #[async_trait]
    impl Tool for SleepyTool {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "Sleep then echo"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "label": {"type": "string"},
                    "delay_ms": {"type": "integer"}
                },
                "required": ["label", "delay_ms"]
            })
        }

        async fn execute(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
            let delay = args["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(args["label"].as_str().unwrap_or_default().to_string())
        }
    }

    #[derive(Default)]
    struct CountingStore {
        inner: MemorySessionStore,
        checkpoints: AtomicUsize,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl SessionStore for CountingStore {
        fn name(&self) -> &str {
            "counting"
        }

        async fn load(&self, session_id: &str) -> Result<Session, SessionError> {
            self.inner.load(session_id).await
        }

        async fn checkpoint(&self, session: &Session) -> Result<(), SessionError> {
            let n = self.checkpoints.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(n) {
                return Err(SessionError::Io {
                    path: "/dev/full".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.checkpoint(session).await
        }

        async fn list(&self) -> Result<Vec<SessionInfo>, SessionError> {
            self.inner.list().await
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args.as_object().cloned().unwrap_or_default(),
        }
    }

    fn calls(tool_calls: Vec<ToolCall>) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            text: None,
            tool_calls,
        })
    }

    fn text(text: &str) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            text: Some(text.into()),
            tool_calls: vec![],
        })
    }

    fn agent(
        provider: Arc<dyn Provider>,
        registry: ToolRegistry,
        store: Arc<dyn SessionStore>,
    ) -> AgentLoop {
        AgentLoop::new(
            provider,
            ContextBuilder::new("/configs", "/scripts"),
            Arc::new(registry),
            store,
        )
        .with_model("test-model")
    }

    fn sleepy_registry() -> ToolRegistry {
        ToolRegistry::builder().register(SleepyTool).build()
    }

    #[tokio::test]
    async fn tool_results_follow_call_order_not_latency() {
        let provider = ScriptedProvider::new(vec![
            calls(vec![
                call("a", "sleepy", json!({"label": "first", "delay_ms": 60})),
                call("b", "sleepy", json!({"label": "second", "delay_ms": 0})),
                call("c", "sleepy", json!({"label": "third", "delay_ms": 30})),
            ]),
            text("done"),
        ]);
        let store = Arc::new(MemorySessionStore::new());
        let agent = agent(provider.clone(), sleepy_registry(), store.clone());

        let mut session = Session::new("order");
        let reply = agent.run_turn(&mut session, "run all three").await.unwrap();
        assert_eq!(reply.text, "done");

        let tool_msgs: Vec<(String, String)> = session
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| (m.tool_call_id.clone().unwrap(), m.text()))
            .collect();
        assert_eq!(
            tool_msgs,
            vec![
                ("a".to_string(), "first".to_string()),
                ("b".to_string(), "second".to_string()),
                ("c".to_string(), "third".to_string()),
            ]
        );

        let persisted = store.load("order").await.unwrap();
        assert_eq!(persisted.messages(), session.messages());
    }

    #[tokio::test]
    async fn list_scripts_on_empty_directory() {
        let tmp = TempDir::new().unwrap();
        let config = crate::config::Config {
            configs_dir: tmp.path().join("configs"),
            scripts_dir: tmp.path().join("scripts"),
            ..Default::default()
        };
        std::fs::create_dir_all(&config.configs_dir).unwrap();
        std::fs::create_dir_all(&config.scripts_dir).unwrap();
        let registry = ToolRegistry::discover(&config).unwrap();

        let provider = ScriptedProvider::new(vec![
            calls(vec![call("call_1", "list_scripts", json!({}))]),
            text("There are no scripts in the scripts directory."),
        ]);
        let store = Arc::new(MemorySessionStore::new());
        let agent = agent(provider.clone(), registry, store);

        let mut session = Session::new("scenario");
        let reply = agent.run_turn(&mut session, "list scripts").await.unwrap();

        assert_eq!(reply.text, "There are no scripts in the scripts directory.");
        assert_eq!(reply.model_turns, 2);
        assert_eq!(reply.messages.len(), 3);

        let tool_msg = &session.messages()[2];
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_msg.text(), "[]");
        assert!(!tool_msg.is_error);

        let last = session.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.tool_calls().is_empty());

        // second model call saw the tool result
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].last().unwrap(), tool_msg);
        assert_eq!(requests[0][0].role, Role::System);
    }

    #[tokio::test]
    async fn tool_failures_are_fed_back_to_the_model() {
        let provider = ScriptedProvider::new(vec![
            calls(vec![
                call("x", "drop_database", json!({})),
                call("y", "sleepy", json!({"label": 5})),
            ]),
            text("Sorry, neither tool worked."),
        ]);
        let agent = agent(
            provider,
            sleepy_registry(),
            Arc::new(MemorySessionStore::new()),
        );

        let mut session = Session::new("failures");
        let reply = agent.run_turn(&mut session, "do it").await.unwrap();
        assert_eq!(reply.text, "Sorry, neither tool worked.");

        let unknown = &session.messages()[2];
        assert!(unknown.is_error);
        assert_eq!(unknown.text(), "Error: unknown tool: drop_database");

        let invalid = &session.messages()[3];
        assert!(invalid.is_error);
        assert!(invalid.text().starts_with("Error: invalid arguments for 'sleepy'"));
    }

    #[tokio::test]
    async fn max_turns_guard() {
        let looping = || calls(vec![call("again", "sleepy", json!({"label": "x", "delay_ms": 0}))]);
        let provider = ScriptedProvider::new(vec![looping(), looping(), looping()]);
        let store = Arc::new(MemorySessionStore::new());
        let agent = agent(provider, sleepy_registry(), store.clone()).with_max_turns(2);

        let mut session = Session::new("loop");
        let err = agent.run_turn(&mut session, "spin").await.unwrap_err();
        assert!(matches!(err, AgentError::MaxTurnsExceeded { limit: 2 }));

        let persisted = store.load("loop").await.unwrap();
        assert_eq!(persisted.len(), 5);
        assert_eq!(persisted.messages(), session.messages());
    }

    #[tokio::test]
    async fn model_failure_leaves_last_checkpoint() {
        let provider = ScriptedProvider::new(vec![
            calls(vec![call("a", "sleepy", json!({"label": "ok", "delay_ms": 0}))]),
            Err(ProviderError::Unavailable("connection refused".into())),
        ]);
        let store = Arc::new(MemorySessionStore::new());
        let agent = agent(provider, sleepy_registry(), store.clone());

        let mut session = Session::new("flaky");
        let err = agent.run_turn(&mut session, "check").await.unwrap_err();
        assert!(matches!(err, AgentError::ModelUnavailable(_)));

        let persisted = store.load("flaky").await.unwrap();
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted.messages(), session.messages());
    }

    #[tokio::test]
    async fn empty_response_is_malformed() {
        let provider = ScriptedProvider::new(vec![Ok(ChatResponse::default())]);
        let agent = agent(
            provider,
            sleepy_registry(),
            Arc::new(MemorySessionStore::new()),
        );
        let mut session = Session::new("empty");
        let err = agent.run_turn(&mut session, "hello").await.unwrap_err();
        assert!(matches!(err, AgentError::MalformedModelResponse(_)));
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn empty_input_appends_nothing() {
        let store = Arc::new(CountingStore::default());
        let agent = agent(ScriptedProvider::new(vec![]), sleepy_registry(), store.clone());
        let mut session = Session::new("blank");
        let err = agent.run_turn(&mut session, "   ").await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyInput));
        assert!(session.is_empty());
        assert_eq!(store.checkpoints.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn every_append_is_checkpointed() {
        let provider = ScriptedProvider::new(vec![
            calls(vec![
                call("a", "sleepy", json!({"label": "1", "delay_ms": 0})),
                call("b", "sleepy", json!({"label": "2", "delay_ms": 0})),
            ]),
            text("ok"),
        ]);
        let store = Arc::new(CountingStore::default());
        let agent = agent(provider, sleepy_registry(), store.clone());

        let mut session = Session::new("counted");
        agent.run_turn(&mut session, "go").await.unwrap();
        assert_eq!(session.len(), 5);
        assert_eq!(store.checkpoints.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn failed_checkpoint_rolls_back_the_message() {
        let provider = ScriptedProvider::new(vec![text("hi there")]);
        let store = Arc::new(CountingStore {
            fail_on: Some(2),
            ..Default::default()
        });
        let agent = agent(provider, sleepy_registry(), store.clone());

        let mut session = Session::new("diskfull");
        let err = agent.run_turn(&mut session, "hello").await.unwrap_err();
        assert!(matches!(err, AgentError::Session(_)));
        assert_eq!(session.len(), 1);
        assert_eq!(store.load("diskfull").await.unwrap().messages(), session.messages());
    }

    #[tokio::test]
    async fn resumed_session_replays_prior_turns() {
        let store = Arc::new(MemorySessionStore::new());
        let mut prior = Session::new("abc123");
        prior.append(ChatMessage::user("what clusters exist?"));
        prior.append(ChatMessage::assistant("prod-useast-01."));
        prior.append(ChatMessage::user("how many nodes?"));
        prior.append(ChatMessage::assistant("5 nodes."));
        store.checkpoint(&prior).await.unwrap();

        let provider = ScriptedProvider::new(vec![text("Two pods are unhealthy.")]);
        let agent = agent(provider.clone(), sleepy_registry(), store.clone());

        let mut session = agent.load_session("abc123").await.unwrap();
        agent.run_turn(&mut session, "any unhealthy pods?").await.unwrap();

        let request = &provider.requests()[0];
        assert_eq!(&request[1..5], prior.messages());
        assert_eq!(request[5].text(), "any unhealthy pods?");
        assert_eq!(store.load("abc123").await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn fallback_tool_calls_are_executed() {
        let provider = ScriptedProvider::new(vec![
            text(
                "Checking.\n<tool_call>\n{\"name\": \"sleepy\", \"arguments\": {\"label\": \"a\", \"delay_ms\": 0}}\n</tool_call>\n<tool_call>{\"name\": \"sleepy\", \"arguments\": {\"label\": \"a\", \"delay_ms\": 0}}</tool_call>",
            ),
            text("Both returned a."),
        ]);
        let agent = agent(
            provider,
            sleepy_registry(),
            Arc::new(MemorySessionStore::new()),
        );

        let mut session = Session::new("fallback");
        agent.run_turn(&mut session, "try").await.unwrap();

        let request = &session.messages()[1];
        assert_eq!(request.text(), "Checking.");
        let ids: Vec<&str> = request.tool_calls().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(session.messages()[2].tool_call_id.as_deref(), Some(ids[0]));
        assert_eq!(session.messages()[3].tool_call_id.as_deref(), Some(ids[1]));
    }

    #[tokio::test]
    async fn cancelled_model_call_appends_nothing_partial() {
        let store = Arc::new(MemorySessionStore::new());
        let agent = agent(Arc::new(HangingProvider), sleepy_registry(), store.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut session = Session::new("cancel");
        let err = agent
            .run_turn_with_cancel(&mut session, "hello", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(session.len(), 1);
        assert_eq!(store.load("cancel").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn model_timeout_is_unavailable() {
        let agent = agent(
            Arc::new(HangingProvider),
            sleepy_registry(),
            Arc::new(MemorySessionStore::new()),
        )
        .with_model_timeout(Some(Duration::from_millis(50)));

        let mut session = Session::new("slow");
        let err = agent.run_turn(&mut session, "hello").await.unwrap_err();
        assert!(matches!(err, AgentError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn interrupted_calls_are_answered_on_resume() {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = Session::new("crashed");
        session.append(ChatMessage::user("run it"));
        session.append(ChatMessage::assistant_with_tool_calls(
            "",
            vec![
                call("done", "sleepy", json!({"label": "x", "delay_ms": 0})),
                call("lost", "sleepy", json!({"label": "y", "delay_ms": 0})),
            ],
        ));
        session.append(ChatMessage::tool_result("done", &ToolResult::success("x")));
        store.checkpoint(&session).await.unwrap();

        let provider = ScriptedProvider::new(vec![text("Picking up again.")]);
        let agent = agent(provider, sleepy_registry(), store.clone());
        agent.run_turn(&mut session, "continue").await.unwrap();

        let repaired = &session.messages()[3];
        assert_eq!(repaired.tool_call_id.as_deref(), Some("lost"));
        assert!(repaired.is_error);
        assert_eq!(session.messages()[4].role, Role::User);
    }

    #[tokio::test]
    async fn cancelled_tool_call_is_answered_on_next_turn() {
        let provider = ScriptedProvider::new(vec![
            calls(vec![call("slow", "sleepy", json!({"label": "late", "delay_ms": 10_000}))]),
            text("Starting over."),
        ]);
        let store = Arc::new(MemorySessionStore::new());
        let agent = agent(provider, sleepy_registry(), store.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut session = Session::new("cancel-tool");
        let started = std::time::Instant::now();
        let err = agent
            .run_turn_with_cancel(&mut session, "run the slow one", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));

        // stops at the tool request, with no result for it
        assert_eq!(session.len(), 2);
        let request = session.messages().last().unwrap();
        assert_eq!(request.role, Role::Assistant);
        assert_eq!(request.tool_calls()[0].id, "slow");
        assert_eq!(store.load("cancel-tool").await.unwrap().messages(), session.messages());

        let reply = agent.run_turn(&mut session, "never mind").await.unwrap();
        assert_eq!(reply.text, "Starting over.");

        let repaired = &session.messages()[2];
        assert_eq!(repaired.role, Role::Tool);
        assert_eq!(repaired.tool_call_id.as_deref(), Some("slow"));
        assert!(repaired.is_error);
        assert_eq!(session.messages()[3].text(), "never mind");
    }

    #[tokio::test]
    async fn repeated_fallback_calls_get_fresh_ids_each_turn() {
        let block = r#"<tool_call>{"name": "sleepy", "arguments": {"label": "a", "delay_ms": 0}}</tool_call>"#;
        let provider = ScriptedProvider::new(vec![text(block), text(block), text("Same both times.")]);
        let agent = agent(
            provider,
            sleepy_registry(),
            Arc::new(MemorySessionStore::new()),
        );

        let mut session = Session::new("repeat");
        agent.run_turn(&mut session, "run it twice").await.unwrap();

        let ids: Vec<&str> = session
            .messages()
            .iter()
            .flat_map(|m| m.tool_calls())
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        let answered: Vec<&str> = session
            .messages()
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(answered, ids);
    }

    #[test]
    fn same_block_parsed_twice_gets_distinct_ids() {
        let block = r#"<tool_call>{"name": "list_scripts", "arguments": {}}</tool_call>"#;
        let (_, first) = parse_tool_calls_fallback(block);
        let (_, second) = parse_tool_calls_fallback(block);
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn json_extraction_handles_escapes() {
        let values = extract_json_values(r#"{"a": "quote \" and brace }"} trailing {"b": "\\"}"#);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["a"], "quote \" and brace }");
        assert_eq!(values[1]["b"], "\\");
    }

    #[test]
    fn fallback_accepts_stringified_arguments() {
        let (text, calls) = parse_tool_calls_fallback(
            r#"<tool_call>{"name": "read_local_config", "arguments": "{\"file_name\": \"app.toml\"}"}</tool_call>"#,
        );
        assert!(text.is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["file_name"], "app.toml");
    }
}
