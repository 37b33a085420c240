//! Agent loop - orchestration between the model and the tool set
//!
//! ```text
//! user text ─▶ AwaitingModel ──final answer──▶ Done ─▶ append_turns
//!                  ▲    │
//!                  │    └─tool calls─▶ ExecutingTools (sequential)
//!                  └─────────tool turns───────┘
//! ```
//!
//! New turns accumulate in memory and are committed once, at the end of the
//! user turn. A failed or cancelled turn still commits what completed, so
//! the transcript always ends on a consistent boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{AgentError, ModelError, StoreError, ToolError, ToolErrorKind};
use crate::metrics::{AGENT_ROUNDS, AGENT_TURNS, MODEL_CALLS, MODEL_CALL_DURATION};
use crate::ollama::{parse_tool_calls_from_text, ChatMessage, FunctionCall, ToolCall};
use crate::proxy::ProxyControl;
use crate::tools::{cap_output, tool_schemas, ToolCallRequest, ToolExecutor, ToolKind, ToolResult};

use super::model::{reply_from_message, ChatRequest, ModelAttempt, ModelBackend, ModelReply};
use super::sessions::{Role, Session, SessionStore, Turn};

/// Sent (not persisted) when the model returns an empty answer
const NUDGE: &str = "Summarize what you found so far and give your final answer to the user now.";

/// Used when the model stays silent after the nudge
const EMPTY_ANSWER_FALLBACK: &str =
    "I could not produce an answer for this request. Please try rephrasing it or narrowing it down.";

/// Result of one user turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Assistant text shown to the user
    pub reply: String,
    /// Tool round-trips used
    pub rounds: usize,
    /// Turns committed for this user turn, user turn first
    pub new_turns: Vec<Turn>,
    /// The reply was synthesized rather than produced by the model
    pub synthesized: bool,
    pub trace_id: String,
}

/// Progress reported while a turn runs
///
/// Every `ToolStart` is followed by a `ToolEnd` for the same call, including
/// when the turn is cancelled mid-tool.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Reasoning text returned alongside a model reply
    Thinking(String),
    ToolStart(ToolCallRequest),
    ToolEnd(ToolResult),
}

enum Finish {
    Answered(String),
    EmptyAnswer,
    MaxRounds,
}

/// The stateful tool-calling loop
pub struct AgentLoop {
    config: AgentConfig,
    model: Arc<dyn ModelBackend>,
    tools: Arc<ToolExecutor>,
    proxy: Arc<dyn ProxyControl>,
    store: Arc<SessionStore>,
    /// Set once the backend rejects `think`; later calls skip it
    think_rejected: AtomicBool,
    events: Option<UnboundedSender<AgentEvent>>,
}

impl AgentLoop {
    pub fn new(
        config: AgentConfig,
        model: Arc<dyn ModelBackend>,
        tools: Arc<ToolExecutor>,
        proxy: Arc<dyn ProxyControl>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            config,
            model,
            tools,
            proxy,
            store,
            think_rejected: AtomicBool::new(false),
            events: None,
        }
    }

    /// Report [`AgentEvent`]s on `events` as turns run
    pub fn with_events(mut self, events: UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            // receiver gone: nobody is listening any more
            let _ = events.send(event);
        }
    }

    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    /// Whether `think` is still requested on full attempts
    pub fn think_enabled(&self) -> bool {
        self.config.think && !self.think_rejected.load(Ordering::Relaxed)
    }

    /// Process one user message against `session`
    ///
    /// `session` is updated in place with the committed turns.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let trace_id = Uuid::now_v7().to_string();
        let span = info_span!(
            "agent_turn",
            trace_id = %trace_id,
            session = %session.id,
            model = %self.config.model,
            otel.name = "agent_turn"
        );

        async {
            info!(chars = user_text.chars().count(), "user turn started");
            let mut pending = vec![Turn::user(user_text)];
            let mut rounds = 0usize;

            let outcome = self.drive(session, &mut pending, &mut rounds, cancel).await;
            AGENT_ROUNDS.observe(rounds as f64);

            let (reply, synthesized, label) = match &outcome {
                Ok(Finish::Answered(text)) => (text.clone(), false, "answered"),
                Ok(Finish::EmptyAnswer) => (EMPTY_ANSWER_FALLBACK.to_string(), true, "empty_answer"),
                Ok(Finish::MaxRounds) => (self.max_rounds_message(), true, "max_rounds"),
                Err(AgentError::Cancelled) => (String::new(), false, "cancelled"),
                Err(_) => (String::new(), false, "model_error"),
            };
            if outcome.is_ok() {
                pending.push(Turn::assistant(reply.clone()));
            }

            if let Err(e) = self.commit(session, &pending) {
                AGENT_TURNS.with_label_values(&["storage_error"]).inc();
                warn!(error = %e, "failed to persist turn");
                return Err(match outcome {
                    Err(turn_err) => turn_err,
                    Ok(_) => AgentError::Storage(e),
                });
            }
            AGENT_TURNS.with_label_values(&[label]).inc();

            match outcome {
                Ok(_) => {
                    info!(rounds, synthesized, "user turn finished");
                    Ok(TurnOutcome {
                        reply,
                        rounds,
                        new_turns: pending,
                        synthesized,
                        trace_id: trace_id.clone(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, rounds, persisted = pending.len(), "user turn aborted");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        session: &Session,
        pending: &mut Vec<Turn>,
        rounds: &mut usize,
        cancel: &CancellationToken,
    ) -> Result<Finish, AgentError> {
        let mut nudged = false;

        loop {
            let nudge = nudged.then(|| ChatMessage::user(NUDGE));
            let mut reply = self.call_model(session, pending, nudge, cancel).await?;
            if let Some(thinking) = reply.thinking.take() {
                debug!(chars = thinking.chars().count(), "model returned reasoning");
                self.emit(AgentEvent::Thinking(thinking));
            }
            let (content, calls) = self.extract_calls(reply);

            if calls.is_empty() {
                let text = content.trim();
                if !text.is_empty() {
                    return Ok(Finish::Answered(text.to_string()));
                }
                if nudged {
                    warn!("model returned an empty answer after the nudge");
                    return Ok(Finish::EmptyAnswer);
                }
                debug!("empty answer, nudging the model once");
                nudged = true;
                continue;
            }

            if *rounds >= self.config.max_tool_rounds {
                warn!(rounds = *rounds, "tool round limit reached");
                return Ok(Finish::MaxRounds);
            }
            *rounds += 1;
            debug!(round = *rounds, calls = calls.len(), "executing tool calls");

            pending.push(Turn::assistant_tool_calls(content, calls.clone()));
            for (index, call) in calls.iter().enumerate() {
                self.emit(AgentEvent::ToolStart(call.clone()));
                match self.run_tool(call, cancel).await {
                    Some(result) => {
                        if result.is_error() {
                            debug!(tool = %result.tool_name, kind = ?result.error, "tool returned an error");
                        }
                        pending.push(Turn::tool(&result));
                        self.emit(AgentEvent::ToolEnd(result));
                    }
                    None => {
                        let results: Vec<ToolResult> =
                            calls[index..].iter().map(|skipped| self.cancelled_result(skipped)).collect();
                        pending.extend(results.iter().map(Turn::tool));
                        if let Some(current) = results.into_iter().next() {
                            self.emit(AgentEvent::ToolEnd(current));
                        }
                        return Err(AgentError::Cancelled);
                    }
                }
            }
        }
    }

    /// Native tool calls, or calls recovered from the message text
    fn extract_calls(&self, reply: ModelReply) -> (String, Vec<ToolCallRequest>) {
        if !reply.tool_calls.is_empty() {
            return (reply.content, reply.tool_calls);
        }

        let recovered: Vec<ToolCall> = parse_tool_calls_from_text(&reply.content)
            .into_iter()
            .filter(|call| ToolKind::from_name(&call.function.name).is_some())
            .collect();
        if recovered.is_empty() {
            return (reply.content, Vec::new());
        }

        debug!(count = recovered.len(), "recovered inline tool calls");
        let message = ChatMessage::assistant_tool_calls("", recovered);
        (String::new(), reply_from_message(message).tool_calls)
    }

    async fn call_model(
        &self,
        session: &Session,
        pending: &[Turn],
        nudge: Option<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<ModelReply, AgentError> {
        let mut messages = self.build_context(&session.turns, pending);
        messages.extend(nudge);

        let mut attempt = ModelAttempt::Full;
        loop {
            let think = attempt.think(self.think_enabled());
            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: messages.clone(),
                tools: tool_schemas(),
                think,
                num_predict: self.config.num_predict,
            };

            let span = info_span!("model_call", attempt = attempt.as_str(), think, otel.name = "model_call");
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                result = tokio::time::timeout(self.config.model_timeout, self.model.chat(&request)).instrument(span) => {
                    match result {
                        Ok(reply) => reply,
                        Err(_) => Err(ModelError::Timeout(self.config.model_timeout.as_secs())),
                    }
                }
            };
            MODEL_CALL_DURATION
                .with_label_values(&[&self.config.model])
                .observe(started.elapsed().as_secs_f64());

            match outcome {
                Ok(reply) => {
                    MODEL_CALLS.with_label_values(&[attempt.as_str(), "ok"]).inc();
                    return Ok(reply);
                }
                Err(e) => {
                    MODEL_CALLS
                        .with_label_values(&[attempt.as_str(), e.kind().as_str()])
                        .inc();
                    if matches!(e, ModelError::CapabilityRejected(_)) {
                        self.think_rejected.store(true, Ordering::Relaxed);
                    }
                    attempt = attempt.next();
                    if attempt == ModelAttempt::Exhausted {
                        warn!(error = %e, "model call failed on the reduced request");
                        return Err(e.into());
                    }
                    warn!(error = %e, "model call failed, retrying without think");
                }
            }
        }
    }

    /// Run one call; `None` when cancelled first
    async fn run_tool(&self, call: &ToolCallRequest, cancel: &CancellationToken) -> Option<ToolResult> {
        if cancel.is_cancelled() {
            return None;
        }

        let needs_proxy = ToolKind::from_name(&call.tool_name)
            .map(|kind| kind.requires_proxy())
            .unwrap_or(false);
        let proxy_state = if needs_proxy {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                state = self.proxy.ensure_ready(self.config.proxy_ready_timeout) => state,
            }
        } else {
            self.proxy.status()
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.tools.dispatch(call, &proxy_state) => Some(result),
        }
    }

    fn cancelled_result(&self, call: &ToolCallRequest) -> ToolResult {
        let error = ToolError::new(ToolErrorKind::Cancelled, "turn cancelled before the tool finished");
        ToolResult::err(call, &error, self.tools.output_cap())
    }

    fn max_rounds_message(&self) -> String {
        format!(
            "I was unable to complete this request within the limit of {} tool rounds. \
             Try a narrower question or ask me to continue from here.",
            self.config.max_tool_rounds
        )
    }

    /// System prompt + as much recent history as fits + the current turn
    ///
    /// Turns of the in-progress user turn are always included; the character
    /// budget is spent on history, newest first.
    pub fn build_context(&self, history: &[Turn], pending: &[Turn]) -> Vec<ChatMessage> {
        let current: Vec<ChatMessage> = pending.iter().map(|t| self.to_message(t)).collect();
        let used: usize = current.iter().map(message_chars).sum();
        let mut remaining = self.config.context_char_budget.saturating_sub(used);

        let mut earlier: Vec<ChatMessage> = Vec::new();
        for turn in history.iter().rev() {
            let message = self.to_message(turn);
            let size = message_chars(&message);
            if size > remaining {
                break;
            }
            remaining -= size;
            earlier.push(message);
        }
        earlier.reverse();

        // A cut can leave tool results whose request fell outside the budget
        let orphaned = earlier.iter().take_while(|m| m.role == "tool").count();
        earlier.drain(..orphaned);

        let mut messages = Vec::with_capacity(earlier.len() + current.len() + 1);
        messages.push(ChatMessage::system(system_prompt()));
        messages.extend(earlier);
        messages.extend(current);
        messages
    }

    fn to_message(&self, turn: &Turn) -> ChatMessage {
        match turn.role {
            Role::User => ChatMessage::user(turn.content.clone()),
            Role::Assistant if turn.tool_calls.is_empty() => ChatMessage::assistant(turn.content.clone()),
            Role::Assistant => {
                let calls = turn
                    .tool_calls
                    .iter()
                    .map(|call| ToolCall {
                        id: Some(call.call_id.clone()),
                        function: FunctionCall {
                            name: call.tool_name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect();
                ChatMessage::assistant_tool_calls(turn.content.clone(), calls)
            }
            Role::Tool => {
                let (content, _) = cap_output(&turn.content, self.config.tool_context_chars);
                ChatMessage::tool(turn.tool_name.clone().unwrap_or_default(), content)
            }
        }
    }

    fn commit(&self, session: &mut Session, turns: &[Turn]) -> Result<(), StoreError> {
        let meta = self.store.append_turns(&session.id, turns)?;
        session.turns.extend(turns.iter().cloned());
        session.updated_at = meta.updated_at;
        Ok(())
    }
}

fn message_chars(message: &ChatMessage) -> usize {
    let calls = message
        .tool_calls
        .as_ref()
        .map(|calls| {
            calls
                .iter()
                .map(|c| c.function.name.len() + c.function.arguments.to_string().len())
                .sum()
        })
        .unwrap_or(0);
    message.content.chars().count() + calls
}

/// Date-stamped instructions, rebuilt for every request and never persisted
pub fn system_prompt() -> String {
    format!(
        "You are a careful research assistant running on the user's machine. Today is {date}.\n\
         \n\
         Tools:\n\
         - duck_search finds current information on the web; fetch_url reads a page before you rely on it.\n\
         - tor_search, tor_fetch and onion_up go through the Tor network. Use them only for .onion sites or when the user asks for anonymized access.\n\
         - load_file and search_files read files under the user's home directory.\n\
         - python_exec runs short computations in a sandbox without network access.\n\
         \n\
         Rules:\n\
         - Call tools with a JSON object that matches their parameters.\n\
         - If a tool result starts with ERROR, change the arguments or explain the limitation; do not repeat the same call.\n\
         - Cite the URLs or file paths you used.\n\
         - When you have enough information, answer directly without calling more tools.",
        date = Utc::now().format("%A, %B %-d, %Y"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_is_dated() {
        let prompt = system_prompt();
        assert!(prompt.contains(&Utc::now().format("%Y").to_string()));
        assert!(prompt.contains("python_exec"));
    }

    #[test]
    fn test_message_chars_counts_tool_calls() {
        let plain = ChatMessage::user("abcd");
        assert_eq!(message_chars(&plain), 4);
        let calls = ChatMessage::assistant_tool_calls(
            "",
            vec![ToolCall::new("duck_search", serde_json::json!({"q": 1}))],
        );
        assert_eq!(message_chars(&calls), "duck_search".len() + "{\"q\":1}".len());
    }
}
