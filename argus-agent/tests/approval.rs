//! Full approval round-trip: a run issues a gated command tool call, an
//! operator approves it over the bus, the command executes, and the run
//! continues to a final answer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use argus_agent::{ActionEngine, ReactConfig, ReactRunner, RunInitiator, RunSpec, RunTermination};
use argus_bus::{Bus, BusMessage, Topic};
use argus_engine::BudgetManager;
use argus_store::Store;
use argus_tools::{RunCommandTool, ToolRegistry};
use argus_types::{
    ActionResponse, CompletionRequest, CompletionResponse, ConnectionId, ContentBlock,
    ConversationId, Message, Priority, Provider, ProviderError, Role, RunId, StreamEvent,
    StreamHandle, TokenUsage,
};

struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<StreamEvent>>>,
}

impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        Err(ProviderError::RequestFailed("streaming only".into()))
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
            .expect("provider called more times than scripted");
        Ok(StreamHandle {
            receiver: Box::pin(futures::stream::iter(events)),
        })
    }
}

fn tool_call_turn(command: &str) -> Vec<StreamEvent> {
    let input = serde_json::json!({"command": command});
    vec![
        StreamEvent::ToolUseStart {
            id: "tc_1".into(),
            name: "run_command".into(),
        },
        StreamEvent::Usage(TokenUsage {
            input_tokens: 20,
            output_tokens: 10,
        }),
        StreamEvent::MessageComplete(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "tc_1".into(),
                name: "run_command".into(),
                input,
            }],
        }),
    ]
}

fn final_turn(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta(text.to_string()),
        StreamEvent::Usage(TokenUsage {
            input_tokens: 30,
            output_tokens: 5,
        }),
        StreamEvent::MessageComplete(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }),
    ]
}

#[tokio::test]
async fn approved_command_flows_back_into_the_run() {
    let bus = Bus::new();
    let store = Store::open_in_memory().unwrap();
    let mut delta_sub = bus.subscribe(Topic::ReactDelta);
    let mut request_sub = bus.subscribe(Topic::ActionsRequested);

    let budget = Arc::new(BudgetManager::new(1_000_000, 10_000_000, bus.clone()));
    let actions = Arc::new(ActionEngine::new(bus.clone(), store.clone()));

    let mut tools = ToolRegistry::new();
    tools.register(RunCommandTool::new(
        Arc::clone(&actions) as Arc<dyn argus_tools::ActionBroker>
    ));

    let provider = ScriptedProvider {
        turns: Mutex::new(VecDeque::from(vec![
            tool_call_turn("echo it-worked"),
            final_turn("The command printed it-worked."),
        ])),
    };
    let runner = ReactRunner::new(
        provider,
        Arc::new(tools),
        budget,
        bus.clone(),
        store.clone(),
        ReactConfig::default(),
    );

    // Operator-side task: approve the request as soon as it appears.
    let approver = {
        let actions = Arc::clone(&actions);
        tokio::spawn(async move {
            if let Some(BusMessage::ActionRequested(request)) = request_sub.recv().await {
                actions
                    .resolve(ActionResponse {
                        action_id: request.id.clone(),
                        approved: true,
                        authorization: None,
                    })
                    .await
                    .unwrap();
            }
        })
    };

    let outcome = runner
        .run(RunSpec {
            run_id: RunId::generate(),
            conversation_id: ConversationId::generate(),
            initiator: RunInitiator::UserChat {
                connection: ConnectionId::new("c-1"),
            },
            priority: Priority::Routine,
            history: vec![],
            user_message: Message::user("run echo"),
            cancel: CancellationToken::new(),
        })
        .await;
    approver.await.unwrap();

    assert_eq!(outcome.termination, RunTermination::FinalAnswer);
    assert_eq!(outcome.final_text, "The command printed it-worked.");

    // The push stream carries the gated flow in order: tool_call,
    // action_request, action_executing, action_complete, tool_result.
    let mut types = Vec::new();
    let mut exit_code = None;
    let mut tool_result_ok = false;
    while let Some(message) = delta_sub.try_recv() {
        if let BusMessage::ReactDelta(envelope) = message {
            let value = serde_json::to_value(&*envelope).unwrap();
            let kind = value["type"].as_str().unwrap_or_default().to_string();
            if kind == "action_complete" {
                exit_code = value["data"]["exit_code"].as_i64();
            }
            if kind == "tool_result" {
                tool_result_ok = value["data"]["is_error"] == false
                    && value["data"]["result"]["stdout"]
                        .as_str()
                        .is_some_and(|s| s.contains("it-worked"));
            }
            types.push(kind);
        }
    }
    let pos = |t: &str| types.iter().position(|x| x == t).unwrap_or(usize::MAX);
    assert!(pos("tool_call") < pos("action_request"));
    assert!(pos("action_request") < pos("action_executing"));
    assert!(pos("action_executing") < pos("action_complete"));
    assert!(pos("action_complete") < pos("tool_result"));
    assert_eq!(exit_code, Some(0));
    assert!(tool_result_ok, "tool result carries the command output");

    // The audit trail recorded the request, approval, and execution.
    let audit = store.audit_list(20).await.unwrap();
    let actions_logged: Vec<&str> = audit.iter().map(|r| r.action.as_str()).collect();
    assert!(actions_logged.contains(&"action_requested"));
    assert!(actions_logged.contains(&"action_approved"));
    assert!(actions_logged.contains(&"action_executed"));
}

#[tokio::test]
async fn rejected_command_continues_the_run_with_error_result() {
    let bus = Bus::new();
    let store = Store::open_in_memory().unwrap();
    let mut delta_sub = bus.subscribe(Topic::ReactDelta);
    let mut request_sub = bus.subscribe(Topic::ActionsRequested);

    let budget = Arc::new(BudgetManager::new(1_000_000, 10_000_000, bus.clone()));
    let actions = Arc::new(ActionEngine::new(bus.clone(), store.clone()));
    let mut tools = ToolRegistry::new();
    tools.register(RunCommandTool::new(
        Arc::clone(&actions) as Arc<dyn argus_tools::ActionBroker>
    ));

    let provider = ScriptedProvider {
        turns: Mutex::new(VecDeque::from(vec![
            tool_call_turn("echo never"),
            final_turn("Understood, not running it."),
        ])),
    };
    let runner = ReactRunner::new(
        provider,
        Arc::new(tools),
        budget,
        bus.clone(),
        store.clone(),
        ReactConfig::default(),
    );

    let rejecter = {
        let actions = Arc::clone(&actions);
        tokio::spawn(async move {
            if let Some(BusMessage::ActionRequested(request)) = request_sub.recv().await {
                actions
                    .resolve(ActionResponse {
                        action_id: request.id.clone(),
                        approved: false,
                        authorization: None,
                    })
                    .await
                    .unwrap();
            }
        })
    };

    let outcome = runner
        .run(RunSpec {
            run_id: RunId::generate(),
            conversation_id: ConversationId::generate(),
            initiator: RunInitiator::UserChat {
                connection: ConnectionId::new("c-1"),
            },
            priority: Priority::Routine,
            history: vec![],
            user_message: Message::user("run echo"),
            cancel: CancellationToken::new(),
        })
        .await;
    rejecter.await.unwrap();

    // Rejection is data: the run observes the error result and finishes.
    assert_eq!(outcome.termination, RunTermination::FinalAnswer);

    let mut saw_error_result = false;
    while let Some(message) = delta_sub.try_recv() {
        if let BusMessage::ReactDelta(envelope) = message {
            let value = serde_json::to_value(&*envelope).unwrap();
            if value["type"] == "tool_result" && value["data"]["is_error"] == true {
                saw_error_result = true;
            }
        }
    }
    assert!(saw_error_result, "rejected action surfaces as an error tool result");
}
