//! Agent loop - the per-turn step driver
//!
//! PLANNING → STREAMING (bounded tool rounds) → FINISHED | ABORTED
//!
//! Each round the LLM either streams answer text or requests tool calls.
//! Requested calls are validated, checked against the per-turn deduplicator,
//! executed, and fed back as tool results for the next round. The loop has no
//! retry layer of its own: tool failures become tool-error results and
//! resilience is delegated to the LLM within its step budget.

use crate::dedup::{dedup_key, ToolCallDeduper};
use crate::llm::{LanguageModel, StepToolCall};
use crate::models::{
    ContentPart, MessageRole, ProgressEvent, QueryLoadingContent, ResponseMessage, SubTask,
};
use crate::planner::{rewrite_for_execution_bias, TaskPlanner};
use crate::stream::EventSink;
use crate::tools::{tool_definitions, ToolCall, ToolExecutor};
use crate::Result;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_STEPS: u32 = 10;

pub const SYSTEM_PROMPT: &str = "\
You are a financial analysis assistant with access to live market data tools: \
stock prices, income statements, balance sheets, cash flow statements, derived \
financial metrics, stock screening, and company news.

Guidelines:
- Use the tools to ground every figure you state; never invent numbers.
- Be structured and concise, and include dates alongside time-sensitive data.
- When a tool fails, explain what you could not retrieve in plain language.
- Use professional financial language suitable for investment research.";

/// Per-turn knobs. Owned by the caller so turns stay isolated.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Hard upper bound on sequential LLM/tool rounds.
    pub max_steps: u32,
    pub system_prompt: String,
    /// When set, the planner's task list transiently replaces the last user
    /// message fed to the main agent.
    pub context_rewrite: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            system_prompt: SYSTEM_PROMPT.to_string(),
            context_rewrite: false,
        }
    }
}

/// Raw result of one turn, handed to the persistence finalizer.
#[derive(Debug)]
pub struct TurnOutcome {
    pub messages: Vec<ResponseMessage>,
    pub aborted: bool,
    pub steps_used: u32,
}

pub struct TurnRunner {
    model: Arc<dyn LanguageModel>,
    planner: Arc<dyn TaskPlanner>,
    tools: Arc<dyn ToolExecutor>,
    config: TurnConfig,
}

enum PlannedExecution {
    Execute { call: ToolCall, key: String },
    /// Same key as a call executing earlier in this round.
    Reuse(String),
    /// Already executed in an earlier round; result comes from the cache.
    Cached(Value),
    Invalid(String),
}

impl TurnRunner {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        planner: Arc<dyn TaskPlanner>,
        tools: Arc<dyn ToolExecutor>,
        config: TurnConfig,
    ) -> Self {
        Self {
            model,
            planner,
            tools,
            config,
        }
    }

    /// Run one turn over the given conversation history. Events are appended
    /// to `events` in production order; `cancel` aborts further rounds.
    pub async fn run(
        &self,
        history: Vec<ResponseMessage>,
        user_message_id: Uuid,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        events.emit(ProgressEvent::UserMessageId(user_message_id));
        events.emit(ProgressEvent::QueryLoading(QueryLoadingContent {
            is_loading: true,
            task_names: vec!["Analyzing your query...".to_string()],
        }));

        // === PLANNING ===
        let user_text = history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text())
            .unwrap_or_default();

        let tasks = match self.planner.decompose(&user_text).await {
            Ok(tasks) => tasks,
            Err(e) => {
                // The task list is cosmetic; a planner failure must not sink
                // the turn.
                warn!(error = %e, "planner failed, using placeholder task");
                vec![SubTask {
                    name: "Analyzing your query...".to_string(),
                    class: "analysis".to_string(),
                }]
            }
        };

        events.emit(ProgressEvent::QueryLoading(QueryLoadingContent {
            is_loading: true,
            task_names: tasks.iter().map(|t| t.name.clone()).collect(),
        }));

        let mut context = history;
        if self.config.context_rewrite {
            rewrite_for_execution_bias(&mut context, &tasks);
        }

        // === STREAMING ===
        let mut deduper = ToolCallDeduper::new();
        let definitions = tool_definitions();
        let received_first_chunk = AtomicBool::new(false);

        let mut response_messages: Vec<ResponseMessage> = Vec::new();
        let mut steps_used = 0;
        let mut aborted = false;

        for _round in 0..self.config.max_steps {
            if cancel.is_cancelled() {
                aborted = true;
                break;
            }

            let on_delta = |delta: &str| {
                // The displayed loading state flips off on the first
                // non-tool-call content chunk of the turn.
                if !received_first_chunk.swap(true, Ordering::SeqCst) {
                    events.emit(ProgressEvent::QueryLoading(QueryLoadingContent {
                        is_loading: false,
                        task_names: vec![],
                    }));
                }
                events.emit(ProgressEvent::TextDelta(delta.to_string()));
            };

            let step = self
                .model
                .stream_step(
                    &self.config.system_prompt,
                    &context,
                    &definitions,
                    &on_delta,
                )
                .await;
            let outcome = match step {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Transport failure is fatal, but the client still gets a
                    // terminal event so the stream closes unambiguously.
                    events.emit(ProgressEvent::Finish);
                    return Err(e);
                }
            };
            steps_used += 1;

            // A stop arriving while the step streamed discards its output.
            if cancel.is_cancelled() {
                aborted = true;
                break;
            }

            let assistant = assistant_message(&outcome.text, &outcome.tool_calls);
            context.push(assistant.clone());
            response_messages.push(assistant);

            if outcome.tool_calls.is_empty() {
                debug!(steps_used, "loop finished without further tool calls");
                break;
            }

            let results = self
                .run_tool_calls(&outcome.tool_calls, &mut deduper, events)
                .await;

            let tool_message = ResponseMessage {
                role: MessageRole::Tool,
                parts: results,
            };
            context.push(tool_message.clone());
            response_messages.push(tool_message);

            if cancel.is_cancelled() {
                aborted = true;
                break;
            }
        }

        if aborted {
            // Truncated in-progress content is discarded entirely; an aborted
            // turn persists nothing.
            info!(steps_used, "turn aborted, discarding response messages");
            response_messages.clear();
        } else if steps_used == self.config.max_steps {
            warn!(steps_used, "step budget exhausted");
        }

        if !received_first_chunk.load(Ordering::SeqCst) {
            events.emit(ProgressEvent::QueryLoading(QueryLoadingContent {
                is_loading: false,
                task_names: vec![],
            }));
        }
        events.emit(ProgressEvent::Finish);

        Ok(TurnOutcome {
            messages: response_messages,
            aborted,
            steps_used,
        })
    }

    /// Validate, dedup, and execute one round's tool calls. Unique calls run
    /// concurrently; the deduplicator is consulted per call, before any call
    /// is issued. Every duplicate receives the first execution's result
    /// verbatim, whether the original ran this round or an earlier one, and
    /// each result is attached to the call it answers.
    async fn run_tool_calls(
        &self,
        requested: &[StepToolCall],
        deduper: &mut ToolCallDeduper,
        events: &EventSink,
    ) -> Vec<ContentPart> {
        let mut in_round: HashSet<String> = HashSet::new();
        let mut planned = Vec::with_capacity(requested.len());
        for request in requested {
            let execution = match ToolCall::parse(&request.name, &request.arguments) {
                Ok(call) => {
                    let key = dedup_key(&call);
                    if let Some(cached) = deduper.cached(&key) {
                        debug!(tool = %request.name, "reusing cached tool result");
                        PlannedExecution::Cached(cached.clone())
                    } else if !in_round.insert(key.clone()) {
                        debug!(tool = %request.name, "skipping duplicate tool call");
                        PlannedExecution::Reuse(key)
                    } else {
                        PlannedExecution::Execute { call, key }
                    }
                }
                Err(e) => {
                    warn!(tool = %request.name, error = %e, "tool call failed validation");
                    PlannedExecution::Invalid(e.to_string())
                }
            };
            planned.push((request.id.clone(), request.name.clone(), execution));
        }

        let jobs: Vec<(String, ToolCall)> = planned
            .iter()
            .filter_map(|(_, _, execution)| match execution {
                PlannedExecution::Execute { call, key } => Some((key.clone(), call.clone())),
                _ => None,
            })
            .collect();

        let settled = futures::future::join_all(jobs.into_iter().map(|(key, call)| async move {
            let result = match self.tools.execute(&call, events).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(tool = call.name(), error = %e, "tool execution failed");
                    json!({ "error": e.to_string() })
                }
            };
            (key, result)
        }))
        .await;

        let mut round_results: HashMap<String, Value> = HashMap::with_capacity(settled.len());
        for (key, result) in settled {
            deduper.record(key.clone(), result.clone());
            round_results.insert(key, result);
        }

        planned
            .into_iter()
            .map(|(id, name, execution)| {
                let result = match execution {
                    PlannedExecution::Execute { key, .. } | PlannedExecution::Reuse(key) => {
                        round_results.get(&key).cloned().unwrap_or(Value::Null)
                    }
                    PlannedExecution::Cached(value) => value,
                    PlannedExecution::Invalid(error) => json!({ "error": error }),
                };
                ContentPart::ToolResult {
                    tool_call_id: id,
                    tool_name: name,
                    result,
                }
            })
            .collect()
    }
}

fn assistant_message(text: &str, tool_calls: &[StepToolCall]) -> ResponseMessage {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::Text {
            text: text.to_string(),
        });
    }
    for call in tool_calls {
        parts.push(ContentPart::ToolCall {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });
    }
    ResponseMessage {
        role: MessageRole::Assistant,
        parts,
    }
}
