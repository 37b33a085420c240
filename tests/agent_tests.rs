//! Integration tests for the agent loop
//!
//! The model, web backend and proxy are replaced with scripted stubs so the
//! loop can be driven deterministically without Ollama or network access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use veilagent::agent::{AgentEvent, AgentLoop, ChatRequest, ModelBackend, ModelReply, Role, Session, SessionStore};
use veilagent::config::{AgentConfig, SandboxConfig, ToolConfig};
use veilagent::error::{AgentError, ErrorKind, ModelError, ToolError, ToolErrorKind};
use veilagent::proxy::{ProxyControl, ProxyProcessState, ProxyStatus};
use veilagent::tools::{Route, Sandbox, ToolCallRequest, ToolExecutor, WebTools, TRUNCATION_MARKER};

// ─────────────────────────────────────────────────────────────────────────────
// Stubs
// ─────────────────────────────────────────────────────────────────────────────

/// Replays a fixed script, then repeats `fallback` (or fails) forever
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    fallback: Option<ModelReply>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    fn new(script: Vec<Result<ModelReply, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    fn repeating(reply: ModelReply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedModel {
    async fn chat(&self, request: &ChatRequest) -> Result<ModelReply, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(next) = self.replies.lock().unwrap().pop_front() {
            return next;
        }
        match &self.fallback {
            Some(reply) => Ok(reply.clone()),
            None => Err(ModelError::Unavailable("script exhausted".into())),
        }
    }
}

/// Records every backend invocation in order
#[derive(Default)]
struct MockWeb {
    calls: Mutex<Vec<String>>,
    delay: Duration,
    /// Length of the search snippet; 0 keeps the short canned one
    snippet_chars: usize,
}

impl MockWeb {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn verbose(snippet_chars: usize) -> Self {
        Self {
            snippet_chars,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl WebTools for MockWeb {
    async fn duck_search(&self, query: &str, _max_results: usize) -> Result<Value, ToolError> {
        self.record(format!("duck_search:{}", query)).await;
        let content = match self.snippet_chars {
            0 => "A language empowering everyone".to_string(),
            n => "r".repeat(n),
        };
        Ok(json!({
            "results": [{
                "title": "The Rust Programming Language",
                "url": "https://www.rust-lang.org/",
                "content": content
            }]
        }))
    }

    async fn fetch_page(&self, url: &str, _max_chars: usize, route: Route) -> Result<Value, ToolError> {
        self.record(format!("fetch_page:{}:{:?}", url, route)).await;
        Ok(json!({"title": "Page", "url": url, "content": "body text", "links": []}))
    }

    async fn tor_search(&self, query: &str, _base_url: &str, _route: Route) -> Result<Value, ToolError> {
        self.record(format!("tor_search:{}", query)).await;
        Ok(json!({"results": []}))
    }

    async fn onion_up(&self, url: &str, _timeout: Duration, _route: Route) -> Result<Value, ToolError> {
        self.record(format!("onion_up:{}", url)).await;
        Ok(json!({"url": url, "up": true}))
    }
}

/// Proxy frozen in one state
struct StubProxy {
    state: ProxyProcessState,
    ensure_calls: AtomicUsize,
}

impl StubProxy {
    fn with_status(status: ProxyStatus) -> Self {
        Self {
            state: ProxyProcessState {
                status,
                ..ProxyProcessState::default()
            },
            ensure_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProxyControl for StubProxy {
    fn status(&self) -> ProxyProcessState {
        self.state.clone()
    }

    async fn ensure_ready(&self, _timeout: Duration) -> ProxyProcessState {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        self.state.clone()
    }

    async fn start(&self, _timeout: Duration) -> ProxyProcessState {
        self.state.clone()
    }

    async fn health_check(&self) -> ProxyProcessState {
        self.state.clone()
    }

    async fn shutdown(&self) -> ProxyProcessState {
        self.state.clone()
    }
}

struct Harness {
    _dir: TempDir,
    agent: AgentLoop,
    model: Arc<ScriptedModel>,
    web: Arc<MockWeb>,
    proxy: Arc<StubProxy>,
    store: Arc<SessionStore>,
    session: Session,
}

fn agent_config() -> AgentConfig {
    AgentConfig {
        model: "test-model".into(),
        think: true,
        model_timeout: Duration::from_secs(5),
        max_tool_rounds: 4,
        ..AgentConfig::default()
    }
}

fn harness_with(model: ScriptedModel, web: MockWeb, proxy: StubProxy, config: AgentConfig) -> Harness {
    harness_with_tools(model, web, proxy, config, ToolConfig::default())
}

fn harness_with_tools(
    model: ScriptedModel,
    web: MockWeb,
    proxy: StubProxy,
    config: AgentConfig,
    tool_config: ToolConfig,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let model = Arc::new(model);
    let web = Arc::new(web);
    let proxy = Arc::new(proxy);

    let tool_config = ToolConfig {
        home_dir: dir.path().to_path_buf(),
        ..tool_config
    };
    let tools = Arc::new(ToolExecutor::new(
        tool_config,
        web.clone(),
        Sandbox::new(SandboxConfig::default()),
    ));
    let agent = AgentLoop::new(config, model.clone(), tools, proxy.clone(), store.clone());

    let id = store.create(Some("test"), "test-model").unwrap();
    let session = store.load(&id).unwrap();

    Harness {
        _dir: dir,
        agent,
        model,
        web,
        proxy,
        store,
        session,
    }
}

fn harness(model: ScriptedModel) -> Harness {
    harness_with(
        model,
        MockWeb::default(),
        StubProxy::with_status(ProxyStatus::Running),
        agent_config(),
    )
}

fn call(name: &str, args: Value, id: &str) -> ToolCallRequest {
    ToolCallRequest::new(name, args, id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool loop
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_search_then_answer_persists_four_turns() {
    let mut h = harness(ScriptedModel::new(vec![
        Ok(ModelReply::calls(vec![call("duck_search", json!({"query": "rust"}), "c1")])),
        Ok(ModelReply::text("Rust is a systems language (https://www.rust-lang.org/).")),
    ]));

    let outcome = h
        .agent
        .run_turn(&mut h.session, "What is Rust?", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.reply, "Rust is a systems language (https://www.rust-lang.org/).");
    assert_eq!(outcome.rounds, 1);
    assert!(!outcome.synthesized);
    assert_eq!(h.web.calls(), vec!["duck_search:rust".to_string()]);

    let roles: Vec<Role> = h.session.turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(h.session.turns[1].tool_calls[0].tool_name, "duck_search");
    assert_eq!(h.session.turns[2].tool_call_id.as_deref(), Some("c1"));
    assert!(h.session.turns[2].content.contains("rust-lang.org"));
    assert_eq!(h.session.turns[2].error, None);

    // the tool output is fed back on the second request
    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, "tool");
    assert_eq!(last.tool_name.as_deref(), Some("duck_search"));
    assert_eq!(requests[0].messages[0].role, "system");

    // what was committed is what a fresh load sees
    let reloaded = h.store.load(&h.session.id).unwrap();
    assert_eq!(reloaded.turns, h.session.turns);
    assert_eq!(reloaded.updated_at, h.session.updated_at);
}

#[tokio::test]
async fn test_max_rounds_synthesizes_reply() {
    let config = AgentConfig {
        max_tool_rounds: 3,
        ..agent_config()
    };
    let mut h = harness_with(
        ScriptedModel::repeating(ModelReply::calls(vec![call("duck_search", json!({"query": "loop"}), "c")])),
        MockWeb::default(),
        StubProxy::with_status(ProxyStatus::Running),
        config,
    );

    let outcome = h
        .agent
        .run_turn(&mut h.session, "keep searching", &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.synthesized);
    assert_eq!(outcome.rounds, 3);
    assert!(outcome.reply.contains("3 tool rounds"));
    assert_eq!(h.web.calls().len(), 3);
    // three rounds plus the reply that was cut off
    assert_eq!(h.model.requests().len(), 4);

    // user + 3 × (assistant, tool) + synthesized answer
    assert_eq!(h.session.turns.len(), 8);
    let last = h.session.turns.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.tool_calls.is_empty());
    assert_eq!(last.content, outcome.reply);
}

#[tokio::test]
async fn test_slow_tool_times_out_and_turn_completes() {
    let tools = ToolConfig {
        timeout: Duration::from_millis(50),
        ..ToolConfig::default()
    };
    let mut h = harness_with_tools(
        ScriptedModel::new(vec![
            Ok(ModelReply::calls(vec![call("duck_search", json!({"query": "slow"}), "c1")])),
            Ok(ModelReply::text("The search timed out.")),
        ]),
        MockWeb::slow(Duration::from_secs(30)),
        StubProxy::with_status(ProxyStatus::Running),
        agent_config(),
        tools,
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        h.agent.run_turn(&mut h.session, "search", &CancellationToken::new()),
    )
    .await
    .expect("turn must not hang on a slow tool")
    .unwrap();

    assert_eq!(outcome.reply, "The search timed out.");
    let tool_turn = &h.session.turns[2];
    assert_eq!(tool_turn.role, Role::Tool);
    assert_eq!(tool_turn.error, Some(ToolErrorKind::Timeout));
    assert!(tool_turn.content.contains("did not finish"));
    assert_eq!(h.session.turns.last().unwrap().content, "The search timed out.");
}

#[tokio::test]
async fn test_verbose_tool_output_capped_with_marker() {
    let tools = ToolConfig {
        output_char_cap: 500,
        ..ToolConfig::default()
    };
    let mut h = harness_with_tools(
        ScriptedModel::new(vec![
            Ok(ModelReply::calls(vec![call("duck_search", json!({"query": "rust"}), "c1")])),
            Ok(ModelReply::text("summarized")),
        ]),
        MockWeb::verbose(5_000),
        StubProxy::with_status(ProxyStatus::Running),
        agent_config(),
        tools,
    );

    h.agent
        .run_turn(&mut h.session, "search", &CancellationToken::new())
        .await
        .unwrap();

    let tool_turn = &h.session.turns[2];
    assert_eq!(tool_turn.error, None);
    assert!(tool_turn.content.chars().count() <= 500);
    assert!(tool_turn.content.ends_with(TRUNCATION_MARKER));

    // the model saw the capped text
    let requests = h.model.requests();
    let fed_back = requests[1].messages.last().unwrap();
    assert!(fed_back.content.ends_with(TRUNCATION_MARKER));
}

#[tokio::test]
async fn test_events_report_reasoning_and_tool_progress() {
    let mut h = harness(ScriptedModel::new(vec![
        Ok(ModelReply {
            thinking: Some("search first".into()),
            ..ModelReply::calls(vec![
                call("duck_search", json!({"query": "rust"}), "c1"),
                call("rm_rf", json!({}), "c2"),
            ])
        }),
        Ok(ModelReply::text("done")),
    ]));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.agent = h.agent.with_events(tx);

    h.agent
        .run_turn(&mut h.session, "look it up", &CancellationToken::new())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 5, "{:?}", events);
    assert!(matches!(&events[0], AgentEvent::Thinking(text) if text == "search first"));
    assert!(matches!(&events[1], AgentEvent::ToolStart(c) if c.call_id == "c1"));
    assert!(matches!(&events[2], AgentEvent::ToolEnd(r) if r.call_id == "c1" && !r.is_error()));
    assert!(matches!(&events[3], AgentEvent::ToolStart(c) if c.tool_name == "rm_rf"));
    assert!(matches!(&events[4], AgentEvent::ToolEnd(r) if r.error == Some(ToolErrorKind::NotFound)));
}

#[tokio::test]
async fn test_tools_run_sequentially_in_request_order() {
    let mut h = harness(ScriptedModel::new(vec![
        Ok(ModelReply::calls(vec![
            call("duck_search", json!({"query": "a"}), "c1"),
            call("fetch_url", json!({"url": "https://example.com/"}), "c2"),
            call("duck_search", json!({"query": "b"}), "c3"),
        ])),
        Ok(ModelReply::text("done")),
    ]));

    h.agent
        .run_turn(&mut h.session, "compare", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        h.web.calls(),
        vec![
            "duck_search:a".to_string(),
            "fetch_page:https://example.com/:Direct".to_string(),
            "duck_search:b".to_string(),
        ]
    );
    let ids: Vec<&str> = h
        .session
        .turns
        .iter()
        .filter(|t| t.role == Role::Tool)
        .filter_map(|t| t.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["c1", "c2", "c3"]);
}

#[tokio::test]
async fn test_bad_calls_become_error_turns() {
    let mut h = harness(ScriptedModel::new(vec![
        Ok(ModelReply::calls(vec![
            call("rm_rf", json!({}), "c1"),
            call("duck_search", json!({}), "c2"),
        ])),
        Ok(ModelReply::text("sorry")),
    ]));

    let outcome = h
        .agent
        .run_turn(&mut h.session, "do something", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.reply, "sorry");
    assert!(h.web.calls().is_empty());
    let errors: Vec<Option<ToolErrorKind>> = h
        .session
        .turns
        .iter()
        .filter(|t| t.role == Role::Tool)
        .map(|t| t.error)
        .collect();
    assert_eq!(
        errors,
        vec![Some(ToolErrorKind::NotFound), Some(ToolErrorKind::ArgumentInvalid)]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Model fallback
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_capability_rejection_retries_without_think() {
    let mut h = harness(ScriptedModel::new(vec![
        Err(ModelError::CapabilityRejected("model does not support thinking".into())),
        Ok(ModelReply::text("hello")),
        Ok(ModelReply::text("again")),
    ]));
    assert!(h.agent.think_enabled());

    let outcome = h
        .agent
        .run_turn(&mut h.session, "hi", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.reply, "hello");

    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].think);
    assert!(!requests[1].think);
    assert!(!h.agent.think_enabled());

    // later turns no longer ask for think
    h.agent
        .run_turn(&mut h.session, "hi again", &CancellationToken::new())
        .await
        .unwrap();
    assert!(!h.model.requests()[2].think);
}

#[tokio::test]
async fn test_model_failure_on_both_attempts() {
    let mut h = harness(ScriptedModel::new(vec![
        Err(ModelError::Unavailable("connection refused".into())),
        Err(ModelError::Unavailable("connection refused".into())),
    ]));

    let err = h
        .agent
        .run_turn(&mut h.session, "anyone there?", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::ModelUnavailable(_)));
    assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    assert_eq!(h.model.requests().len(), 2);
    // the user turn is still recorded, without a made-up answer
    assert_eq!(h.session.turns.len(), 1);
    assert_eq!(h.session.turns[0].role, Role::User);
    assert_eq!(h.store.load(&h.session.id).unwrap().turns.len(), 1);
}

#[tokio::test]
async fn test_empty_answer_nudges_once() {
    let mut h = harness(ScriptedModel::new(vec![
        Ok(ModelReply::text("")),
        Ok(ModelReply::text("   ")),
    ]));

    let outcome = h
        .agent
        .run_turn(&mut h.session, "say nothing", &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.synthesized);
    assert!(!outcome.reply.is_empty());
    let requests = h.model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.last().unwrap().role, "user");
    // the nudge is not persisted
    assert_eq!(h.session.turns.len(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy gate and cancellation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_proxy_tools_refused_when_proxy_down() {
    let mut h = harness_with(
        ScriptedModel::new(vec![
            Ok(ModelReply::calls(vec![call(
                "tor_fetch",
                json!({"url": "http://exampleonionaddress.onion/"}),
                "c1",
            )])),
            Ok(ModelReply::text("Tor is not available right now.")),
        ]),
        MockWeb::default(),
        StubProxy::with_status(ProxyStatus::Failed),
        agent_config(),
    );

    let outcome = h
        .agent
        .run_turn(&mut h.session, "open the onion site", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.reply, "Tor is not available right now.");
    assert!(h.web.calls().is_empty());
    assert_eq!(h.proxy.ensure_calls.load(Ordering::SeqCst), 1);
    let tool_turn = &h.session.turns[2];
    assert_eq!(tool_turn.error, Some(ToolErrorKind::ProxyUnavailable));
    assert!(tool_turn.content.starts_with("ERROR [proxy_unavailable]"));
}

#[tokio::test]
async fn test_direct_tools_skip_proxy_wait() {
    let mut h = harness_with(
        ScriptedModel::new(vec![
            Ok(ModelReply::calls(vec![call("duck_search", json!({"query": "x"}), "c1")])),
            Ok(ModelReply::text("ok")),
        ]),
        MockWeb::default(),
        StubProxy::with_status(ProxyStatus::NotFound),
        agent_config(),
    );

    h.agent
        .run_turn(&mut h.session, "search", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.proxy.ensure_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.web.calls().len(), 1);
}

#[tokio::test]
async fn test_cancel_during_tool_marks_remaining_calls() {
    let mut h = harness_with(
        ScriptedModel::new(vec![Ok(ModelReply::calls(vec![
            call("duck_search", json!({"query": "slow"}), "c1"),
            call("duck_search", json!({"query": "never"}), "c2"),
        ]))]),
        MockWeb::slow(Duration::from_secs(10)),
        StubProxy::with_status(ProxyStatus::Running),
        agent_config(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = h.agent.run_turn(&mut h.session, "search slowly", &cancel).await.unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert_eq!(h.web.calls(), vec!["duck_search:slow".to_string()]);

    // user, assistant tool calls, then one cancelled turn per call
    let turns = h.store.load(&h.session.id).unwrap().turns;
    assert_eq!(turns.len(), 4);
    assert_eq!(turns[2].error, Some(ToolErrorKind::Cancelled));
    assert_eq!(turns[3].error, Some(ToolErrorKind::Cancelled));
    assert_eq!(turns[3].tool_call_id.as_deref(), Some("c2"));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let mut h = harness(ScriptedModel::new(vec![Ok(ModelReply::text("unused"))]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.agent.run_turn(&mut h.session, "hello", &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(h.model.requests().is_empty());
    assert_eq!(h.session.turns.len(), 1);
}

#[tokio::test]
async fn test_history_carried_into_next_turn() {
    let mut h = harness(ScriptedModel::new(vec![
        Ok(ModelReply::text("first answer")),
        Ok(ModelReply::text("second answer")),
    ]));

    h.agent
        .run_turn(&mut h.session, "first question", &CancellationToken::new())
        .await
        .unwrap();
    h.agent
        .run_turn(&mut h.session, "second question", &CancellationToken::new())
        .await
        .unwrap();

    let requests = h.model.requests();
    let contents: Vec<&str> = requests[1].messages.iter().skip(1).map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first question", "first answer", "second question"]);
    assert_eq!(h.session.turns.len(), 4);
}
