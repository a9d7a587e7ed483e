//! The ReAct run loop: budget-gated streamed LLM turns with interleaved
//! tool execution.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use argus_bus::Bus;
use argus_engine::{BudgetManager, Reservation};
use argus_providers::with_retries;
use argus_store::{CATALOG_PREFIX_RUN, Store};
use argus_tools::{ToolCall, ToolContext, ToolError, ToolRegistry};
use argus_types::{
    AlertId, ConnectionId, ContentBlock, ConversationId, Message, Priority, Provider, Role,
    RunId, ServerMessage, StopReason, StreamEvent, TokenUsage,
};

use crate::emit;

/// Static configuration for a [`ReactRunner`].
#[derive(Debug, Clone)]
pub struct ReactConfig {
    /// Base system prompt for every run.
    pub system_prompt: String,
    /// Maximum reasoning steps before forced termination.
    pub max_steps: u32,
    /// Maximum response tokens per turn (also the admission estimate).
    pub max_response_tokens: u32,
    /// Hard deadline for one streamed LLM turn.
    pub turn_timeout: Duration,
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are Argus, an observability agent. Investigate using the \
                            available tools and explain findings concisely."
                .into(),
            max_steps: 12,
            max_response_tokens: 1024,
            turn_timeout: Duration::from_secs(120),
        }
    }
}

/// Who started a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunInitiator {
    /// A user chat message over a push connection.
    UserChat {
        /// The originating connection (runs die with it).
        connection: ConnectionId,
    },
    /// An automatic investigation of an urgent alert.
    AutoInvestigation {
        /// The alert under investigation.
        alert_id: AlertId,
    },
}

/// Why a run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTermination {
    /// The model produced a final answer.
    FinalAnswer,
    /// Budget admission was refused.
    BudgetExhausted,
    /// The provider failed persistently.
    ToolErrorFatal,
    /// The step ceiling was reached.
    MaxSteps,
    /// The client (or session teardown) cancelled the run.
    Cancelled,
}

/// Everything needed to start one run.
pub struct RunSpec {
    /// Run id (also the push-stream correlation key).
    pub run_id: RunId,
    /// Conversation the run extends.
    pub conversation_id: ConversationId,
    /// Who started it.
    pub initiator: RunInitiator,
    /// Budget priority for admissions.
    pub priority: Priority,
    /// Prior conversation turns.
    pub history: Vec<Message>,
    /// The new user (or alert-derived) message.
    pub user_message: Message,
    /// Cancelled to stop the run after the current chunk.
    pub cancel: CancellationToken,
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The run.
    pub run_id: RunId,
    /// Why it stopped.
    pub termination: RunTermination,
    /// Final assistant text (may be empty on early termination).
    pub final_text: String,
    /// Messages after the run (history + new turns).
    pub messages: Vec<Message>,
    /// Total tokens spent.
    pub usage: TokenUsage,
    /// Steps executed.
    pub steps: u32,
}

/// The persisted record of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// The run.
    pub id: RunId,
    /// Who started it.
    pub initiator: RunInitiator,
    /// Conversation the run belonged to.
    pub conversation_id: ConversationId,
    /// Budget priority it ran at.
    pub priority: Priority,
    /// Full message transcript.
    pub messages: Vec<Message>,
    /// Why it stopped.
    pub termination: RunTermination,
    /// Tokens spent.
    pub usage: TokenUsage,
    /// When it started.
    pub started_at: DateTime<Utc>,
    /// When it finished.
    pub finished_at: DateTime<Utc>,
}

/// Outcome of one streamed provider turn.
struct TurnResult {
    message: Message,
    usage: TokenUsage,
    stop_reason: StopReason,
}

/// Drives ReAct runs against a provider.
///
/// Generic over `P:`[`Provider`]; production wires in the runtime-selected
/// `LlmClient`.
pub struct ReactRunner<P: Provider> {
    provider: P,
    tools: Arc<ToolRegistry>,
    budget: Arc<BudgetManager>,
    bus: Bus,
    store: Store,
    config: ReactConfig,
}

impl<P: Provider> ReactRunner<P> {
    /// Create a runner with all dependencies.
    pub fn new(
        provider: P,
        tools: Arc<ToolRegistry>,
        budget: Arc<BudgetManager>,
        bus: Bus,
        store: Store,
        config: ReactConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            budget,
            bus,
            store,
            config,
        }
    }

    /// Run to termination. Every user-visible step is emitted on the bus
    /// in order before the next one begins.
    pub async fn run(&self, spec: RunSpec) -> RunOutcome {
        let started_at = Utc::now();
        let run_id = spec.run_id.clone();
        let investigation = matches!(spec.initiator, RunInitiator::AutoInvestigation { .. });

        let mut messages = spec.history.clone();
        messages.push(spec.user_message.clone());

        let mut total_usage = TokenUsage::default();
        let mut steps: u32 = 0;
        let mut final_text = String::new();

        emit(&self.bus, ServerMessage::ThinkingStart { run_id: run_id.clone() });

        let termination = loop {
            // 1. Budget admission: history plus the response ceiling.
            let estimate = history_estimate(&messages, &self.config.system_prompt)
                + self.config.max_response_tokens as u64;
            let reservation = match self.budget.reserve(spec.priority, estimate) {
                Ok(reservation) => reservation,
                Err(e) => {
                    tracing::info!(run_id = %run_id, err = %e, "budget refused, ending run");
                    self.emit_error(&run_id, "budget-exhausted", &e.to_string());
                    break RunTermination::BudgetExhausted;
                }
            };

            // 2-4. One streamed provider turn.
            let turn = match self
                .streamed_turn(&run_id, &messages, &spec.cancel, investigation)
                .await
            {
                Ok(turn) => {
                    self.settle(reservation, turn.usage);
                    total_usage.accumulate(&turn.usage);
                    turn
                }
                Err(TurnFailure::Cancelled { partial_usage }) => {
                    self.settle(reservation, partial_usage);
                    total_usage.accumulate(&partial_usage);
                    self.emit_error(&run_id, "cancelled", "run cancelled");
                    break RunTermination::Cancelled;
                }
                Err(TurnFailure::Provider { message, partial_usage }) => {
                    self.settle(reservation, partial_usage);
                    total_usage.accumulate(&partial_usage);
                    self.emit_error(&run_id, "upstream_unavailable", &message);
                    break RunTermination::ToolErrorFatal;
                }
            };

            let text = turn.message.text();
            if !text.is_empty() {
                final_text = text;
            }
            let tool_uses: Vec<(String, String, serde_json::Value)> = turn
                .message
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            messages.push(turn.message);

            if tool_uses.is_empty() || turn.stop_reason == StopReason::EndTurn {
                if !investigation {
                    emit(&self.bus, ServerMessage::AssistantMessageEnd { run_id: run_id.clone() });
                }
                emit(&self.bus, ServerMessage::ThinkingEnd { run_id: run_id.clone() });
                break RunTermination::FinalAnswer;
            }

            // 5. Dispatch tools; errors are data, the loop continues.
            let mut result_blocks = Vec::new();
            for (call_id, name, input) in tool_uses {
                emit(
                    &self.bus,
                    ServerMessage::ToolCall {
                        run_id: run_id.clone(),
                        call_id: call_id.clone(),
                        name: name.clone(),
                        arguments: input.clone(),
                    },
                );

                let ctx = ToolContext {
                    run_id: run_id.clone(),
                    tenant: None,
                    cancel: spec.cancel.child_token(),
                };
                let call = ToolCall {
                    id: call_id.clone(),
                    name: name.clone(),
                    input,
                };
                let (content, display, is_error) = match self.tools.execute(&call, &ctx).await {
                    Ok(output) => (output.content, output.display_type, false),
                    Err(ToolError::Cancelled) => {
                        self.emit_error(&run_id, "cancelled", "run cancelled");
                        // Record the interrupted call so the transcript
                        // stays well-formed, then stop.
                        result_blocks.push(ContentBlock::ToolResult {
                            tool_use_id: call_id,
                            content: "cancelled".into(),
                            is_error: true,
                        });
                        messages.push(Message {
                            role: Role::User,
                            content: result_blocks,
                        });
                        return self
                            .finish(
                                spec,
                                run_id,
                                messages,
                                RunTermination::Cancelled,
                                final_text,
                                total_usage,
                                steps,
                                started_at,
                            )
                            .await;
                    }
                    Err(e) => (
                        serde_json::json!({"error": e.to_string()}),
                        argus_types::DisplayType::JsonTree,
                        true,
                    ),
                };

                emit(
                    &self.bus,
                    ServerMessage::ToolResult {
                        run_id: run_id.clone(),
                        call_id: call_id.clone(),
                        name,
                        display_type: display,
                        result: content.clone(),
                        is_error,
                    },
                );
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call_id,
                    content: content.to_string(),
                    is_error,
                });
            }
            messages.push(Message {
                role: Role::User,
                content: result_blocks,
            });

            // 6. Step ceiling.
            steps += 1;
            if steps >= self.config.max_steps {
                let summary = if final_text.is_empty() {
                    format!("Stopped after {steps} steps without a final answer.")
                } else {
                    format!("Stopped after {steps} steps. Last findings: {final_text}")
                };
                let mut summary_started = false;
                self.emit_delta(&run_id, &summary, investigation, &mut summary_started);
                if !investigation {
                    emit(&self.bus, ServerMessage::AssistantMessageEnd { run_id: run_id.clone() });
                }
                emit(&self.bus, ServerMessage::ThinkingEnd { run_id: run_id.clone() });
                final_text = summary;
                break RunTermination::MaxSteps;
            }
        };

        self.finish(
            spec,
            run_id,
            messages,
            termination,
            final_text,
            total_usage,
            steps,
            started_at,
        )
        .await
    }

    /// One provider turn with streaming, establishment retries, and the
    /// turn deadline. Returns the assembled message and actual usage.
    async fn streamed_turn(
        &self,
        run_id: &RunId,
        messages: &[Message],
        cancel: &CancellationToken,
        investigation: bool,
    ) -> Result<TurnResult, TurnFailure> {
        let request = argus_types::CompletionRequest {
            model: String::new(),
            messages: messages.to_vec(),
            system: Some(self.config.system_prompt.clone()),
            tools: self.tools.definitions(),
            max_tokens: self.config.max_response_tokens,
            temperature: None,
        };

        // Establishment failures are retried with backoff; a stream that
        // dies after emission is surfaced instead of replayed.
        let handle = with_retries(3, || self.provider.complete_stream(request.clone()))
            .await
            .map_err(|e| TurnFailure::Provider {
                message: e.to_string(),
                partial_usage: TokenUsage::default(),
            })?;

        let mut stream = handle.receiver;
        let mut assembled: Option<Message> = None;
        let mut usage = TokenUsage::default();
        let mut received_chars: usize = 0;
        let mut message_started = false;
        let deadline = tokio::time::Instant::now() + self.config.turn_timeout;

        loop {
            // Biased so a pending cancellation wins over buffered chunks:
            // the loop stops after the chunk in flight, not after the
            // stream happens to drain.
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(TurnFailure::Cancelled {
                        partial_usage: partial_usage(usage, received_chars),
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(TurnFailure::Provider {
                        message: "turn deadline exceeded".into(),
                        partial_usage: partial_usage(usage, received_chars),
                    });
                }
                event = stream.next() => event,
            };
            let Some(event) = event else { break };

            match event {
                StreamEvent::TextDelta(delta) => {
                    received_chars += delta.len();
                    self.emit_delta(run_id, &delta, investigation, &mut message_started);
                }
                StreamEvent::ThinkingDelta(_) => {}
                StreamEvent::ToolUseStart { .. } | StreamEvent::ToolUseInputDelta { .. } => {
                    // Tool calls are announced once assembled, with full
                    // arguments, right before dispatch.
                }
                StreamEvent::Usage(u) => usage = u,
                StreamEvent::MessageComplete(message) => assembled = Some(message),
                StreamEvent::Error(fault) => {
                    return Err(TurnFailure::Provider {
                        message: fault.message,
                        partial_usage: partial_usage(usage, received_chars),
                    });
                }
            }
        }

        let message = assembled.ok_or_else(|| TurnFailure::Provider {
            message: "stream ended without a complete message".into(),
            partial_usage: partial_usage(usage, received_chars),
        })?;
        let stop_reason = if message.tool_uses().is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        };
        Ok(TurnResult {
            message,
            usage,
            stop_reason,
        })
    }

    fn emit_delta(
        &self,
        run_id: &RunId,
        delta: &str,
        investigation: bool,
        message_started: &mut bool,
    ) {
        if investigation {
            emit(
                &self.bus,
                ServerMessage::InvestigationUpdate {
                    run_id: run_id.clone(),
                    delta: delta.to_string(),
                },
            );
            return;
        }
        if !*message_started {
            *message_started = true;
            emit(&self.bus, ServerMessage::AssistantMessageStart { run_id: run_id.clone() });
        }
        emit(
            &self.bus,
            ServerMessage::AssistantMessageDelta {
                run_id: run_id.clone(),
                delta: delta.to_string(),
            },
        );
    }

    fn emit_error(&self, run_id: &RunId, code: &str, message: &str) {
        emit(
            &self.bus,
            ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
                correlation_id: None,
                run_id: Some(run_id.clone()),
            },
        );
    }

    fn settle(&self, reservation: Reservation, usage: TokenUsage) {
        self.budget.settle(reservation, usage.total());
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        spec: RunSpec,
        run_id: RunId,
        messages: Vec<Message>,
        termination: RunTermination,
        final_text: String,
        usage: TokenUsage,
        steps: u32,
        started_at: DateTime<Utc>,
    ) -> RunOutcome {
        let record = RunRecord {
            id: run_id.clone(),
            initiator: spec.initiator,
            conversation_id: spec.conversation_id,
            priority: spec.priority,
            messages: messages.clone(),
            termination,
            usage,
            started_at,
            finished_at: Utc::now(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(e) = self
                    .store
                    .catalog_put(format!("{CATALOG_PREFIX_RUN}{run_id}"), value)
                    .await
                {
                    tracing::error!(run_id = %run_id, err = %e, "run record persist failed");
                }
            }
            Err(e) => tracing::error!(run_id = %run_id, err = %e, "run record serialize failed"),
        }

        RunOutcome {
            run_id,
            termination,
            final_text,
            messages,
            usage,
            steps,
        }
    }
}

enum TurnFailure {
    Cancelled { partial_usage: TokenUsage },
    Provider { message: String, partial_usage: TokenUsage },
}

/// When a turn dies mid-stream the provider never reported usage; fall
/// back to the chars/4 heuristic over what actually arrived.
fn partial_usage(reported: TokenUsage, received_chars: usize) -> TokenUsage {
    if reported.total() > 0 {
        reported
    } else {
        TokenUsage {
            input_tokens: 0,
            output_tokens: (received_chars / 4) as u64,
        }
    }
}

fn history_estimate(messages: &[Message], system_prompt: &str) -> u64 {
    messages.iter().map(Message::estimate_tokens).sum::<u64>()
        + (system_prompt.len() / 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_bus::{BusMessage, Subscription, Topic};
    use argus_types::{CompletionRequest, CompletionResponse, ProviderError, StreamHandle};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Provider replaying canned streams.
    struct MockProvider {
        turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    }

    impl MockProvider {
        fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
            }
        }
    }

    impl Provider for MockProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            Err(ProviderError::RequestFailed("complete() unused".into()))
        }

        async fn complete_stream(
            &self,
            _request: CompletionRequest,
        ) -> Result<StreamHandle, ProviderError> {
            let events = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| text_turn("out of canned turns"));
            Ok(StreamHandle {
                receiver: Box::pin(futures::stream::iter(events)),
            })
        }
    }

    fn text_turn(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta(text.to_string()),
            StreamEvent::Usage(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            }),
            StreamEvent::MessageComplete(Message {
                role: Role::Assistant,
                content: vec![ContentBlock::Text { text: text.to_string() }],
            }),
        ]
    }

    fn tool_turn(call_id: &str, name: &str, input: serde_json::Value) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolUseStart {
                id: call_id.to_string(),
                name: name.to_string(),
            },
            StreamEvent::Usage(TokenUsage {
                input_tokens: 10,
                output_tokens: 15,
            }),
            StreamEvent::MessageComplete(Message {
                role: Role::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: call_id.to_string(),
                    name: name.to_string(),
                    input,
                }],
            }),
        ]
    }

    #[derive(Deserialize, JsonSchema)]
    struct EchoInput {
        message: String,
    }

    struct EchoTool;

    impl argus_tools::Tool for EchoTool {
        const NAME: &'static str = "echo";
        type Input = EchoInput;

        fn description(&self) -> &str {
            "Echoes"
        }

        async fn call(
            &self,
            input: EchoInput,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({"echoed": input.message}))
        }
    }

    struct Harness {
        runner: ReactRunner<MockProvider>,
        delta_sub: Subscription,
        budget: Arc<BudgetManager>,
    }

    fn harness(turns: Vec<Vec<StreamEvent>>, hourly_limit: u64) -> Harness {
        let bus = Bus::new();
        let delta_sub = bus.subscribe(Topic::ReactDelta);
        let budget = Arc::new(BudgetManager::new(hourly_limit, hourly_limit * 10, bus.clone()));
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let runner = ReactRunner::new(
            MockProvider::new(turns),
            Arc::new(tools),
            Arc::clone(&budget),
            bus,
            Store::open_in_memory().unwrap(),
            ReactConfig::default(),
        );
        Harness {
            runner,
            delta_sub,
            budget,
        }
    }

    fn chat_spec(text: &str) -> RunSpec {
        RunSpec {
            run_id: RunId::generate(),
            conversation_id: ConversationId::generate(),
            initiator: RunInitiator::UserChat {
                connection: ConnectionId::new("c-1"),
            },
            priority: Priority::Routine,
            history: vec![],
            user_message: Message::user(text),
            cancel: CancellationToken::new(),
        }
    }

    fn drain_types(sub: &mut Subscription) -> Vec<String> {
        let mut types = Vec::new();
        while let Some(message) = sub.try_recv() {
            if let BusMessage::ReactDelta(envelope) = message {
                let value = serde_json::to_value(&*envelope).unwrap();
                types.push(value["type"].as_str().unwrap_or_default().to_string());
            }
        }
        types
    }

    #[tokio::test]
    async fn final_answer_flow_and_ordering() {
        let mut h = harness(vec![text_turn("All clear.")], 100_000);
        let outcome = h.runner.run(chat_spec("status?")).await;

        assert_eq!(outcome.termination, RunTermination::FinalAnswer);
        assert_eq!(outcome.final_text, "All clear.");

        let types = drain_types(&mut h.delta_sub);
        assert_eq!(
            types,
            vec![
                "thinking_start",
                "assistant_message_start",
                "assistant_message_delta",
                "assistant_message_end",
                "thinking_end",
            ]
        );
    }

    #[tokio::test]
    async fn tool_call_flow_continues_to_answer() {
        let mut h = harness(
            vec![
                tool_turn("tc_1", "echo", serde_json::json!({"message": "ping"})),
                text_turn("Echo said ping."),
            ],
            100_000,
        );
        let outcome = h.runner.run(chat_spec("use echo")).await;

        assert_eq!(outcome.termination, RunTermination::FinalAnswer);
        assert_eq!(outcome.steps, 1);
        assert_eq!(outcome.usage.total(), 40);

        let types = drain_types(&mut h.delta_sub);
        let call_pos = types.iter().position(|t| t == "tool_call").unwrap();
        let result_pos = types.iter().position(|t| t == "tool_result").unwrap();
        assert!(call_pos < result_pos, "tool_result after its tool_call");
    }

    #[tokio::test]
    async fn tool_error_is_data_not_termination() {
        let mut h = harness(
            vec![
                tool_turn("tc_1", "nonexistent", serde_json::json!({})),
                text_turn("That tool does not exist."),
            ],
            100_000,
        );
        let outcome = h.runner.run(chat_spec("use ghost tool")).await;
        assert_eq!(outcome.termination, RunTermination::FinalAnswer);

        let types = drain_types(&mut h.delta_sub);
        assert!(types.contains(&"tool_result".to_string()));
    }

    #[tokio::test]
    async fn budget_refusal_terminates_with_error() {
        let mut h = harness(vec![text_turn("never sent")], 10);
        let outcome = h.runner.run(chat_spec("hi")).await;

        assert_eq!(outcome.termination, RunTermination::BudgetExhausted);
        let snap = h.budget.snapshot();
        assert_eq!(snap.hourly_used, 0, "refused admission reserves nothing");
        assert_eq!(snap.reserved, 0);

        let types = drain_types(&mut h.delta_sub);
        assert!(types.contains(&"error".to_string()));
        assert!(!types.contains(&"assistant_message_end".to_string()));
    }

    #[tokio::test]
    async fn max_steps_produces_summary() {
        // Every turn asks for another tool call.
        let turns: Vec<Vec<StreamEvent>> = (0..20)
            .map(|i| tool_turn(&format!("tc_{i}"), "echo", serde_json::json!({"message": "x"})))
            .collect();
        let bus = Bus::new();
        let budget = Arc::new(BudgetManager::new(10_000_000, 100_000_000, bus.clone()));
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let runner = ReactRunner::new(
            MockProvider::new(turns),
            Arc::new(tools),
            budget,
            bus,
            Store::open_in_memory().unwrap(),
            ReactConfig {
                max_steps: 3,
                ..ReactConfig::default()
            },
        );
        let outcome = runner.run(chat_spec("loop forever")).await;
        assert_eq!(outcome.termination, RunTermination::MaxSteps);
        assert_eq!(outcome.steps, 3);
        assert!(outcome.final_text.contains("3 steps"));
    }

    #[tokio::test]
    async fn cancellation_settles_actuals_only() {
        let mut h = harness(vec![text_turn("never read")], 100_000);
        let spec = chat_spec("cancel me");
        spec.cancel.cancel();
        let outcome = h.runner.run(spec).await;

        assert_eq!(outcome.termination, RunTermination::Cancelled);
        let snap = h.budget.snapshot();
        assert_eq!(snap.reserved, 0, "reservation settled on cancel");

        let types = drain_types(&mut h.delta_sub);
        assert!(types.contains(&"error".to_string()));
        assert!(!types.contains(&"assistant_message_end".to_string()));
    }

    #[tokio::test]
    async fn provider_fault_terminates_fatally() {
        let h = harness(
            vec![vec![StreamEvent::Error(argus_types::StreamFault::fatal("boom"))]],
            100_000,
        );
        let outcome = h.runner.run(chat_spec("hi")).await;
        assert_eq!(outcome.termination, RunTermination::ToolErrorFatal);
    }

    #[tokio::test]
    async fn investigation_streams_investigation_updates() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topic::ReactDelta);
        let budget = Arc::new(BudgetManager::new(100_000, 1_000_000, bus.clone()));
        let runner = ReactRunner::new(
            MockProvider::new(vec![text_turn("Root cause found.")]),
            Arc::new(ToolRegistry::new()),
            budget,
            bus,
            Store::open_in_memory().unwrap(),
            ReactConfig::default(),
        );
        let outcome = runner
            .run(RunSpec {
                run_id: RunId::generate(),
                conversation_id: ConversationId::generate(),
                initiator: RunInitiator::AutoInvestigation {
                    alert_id: AlertId::new("a-1"),
                },
                priority: Priority::Urgent,
                history: vec![],
                user_message: Message::user("investigate cpu alert"),
                cancel: CancellationToken::new(),
            })
            .await;

        assert_eq!(outcome.termination, RunTermination::FinalAnswer);
        let types = drain_types(&mut sub);
        assert!(types.contains(&"investigation_update".to_string()));
        assert!(!types.contains(&"assistant_message_delta".to_string()));
    }

    #[tokio::test]
    async fn run_record_persisted() {
        let bus = Bus::new();
        let budget = Arc::new(BudgetManager::new(100_000, 1_000_000, bus.clone()));
        let store = Store::open_in_memory().unwrap();
        let runner = ReactRunner::new(
            MockProvider::new(vec![text_turn("done")]),
            Arc::new(ToolRegistry::new()),
            budget,
            bus,
            store.clone(),
            ReactConfig::default(),
        );
        let outcome = runner.run(chat_spec("hi")).await;

        let record = store
            .catalog_get(format!("run:{}", outcome.run_id))
            .await
            .unwrap()
            .expect("run record persisted");
        let parsed: RunRecord = serde_json::from_value(record).unwrap();
        assert_eq!(parsed.termination, RunTermination::FinalAnswer);
        assert_eq!(parsed.usage.total(), 15);
    }
}
