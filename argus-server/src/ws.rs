//! The realtime push layer: one WebSocket session per client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use argus_agent::{RunScope, RunSpec, load_conversation, save_conversation};
use argus_bus::{BusMessage, Topic};
use argus_types::{
    ClientMessage, ConnectionId, ConversationId, Envelope, Message, Priority, RunId,
    ServerMessage,
};

use crate::state::{AppState, OUTBOUND_QUEUE_CAPACITY, OutboundQueue};

/// Expected client ping interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive missed pings before the connection closes.
const HEARTBEAT_MISSES: u32 = 2;

/// `GET /ws`: upgrade to a push session.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection session loop.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = ConnectionId::generate();
    let queue = Arc::new(OutboundQueue::new(OUTBOUND_QUEUE_CAPACITY));
    state
        .connections
        .insert(connection_id.clone(), Arc::clone(&queue));
    tracing::info!(connection = %connection_id, "push client connected");

    queue.push(Envelope::new(ServerMessage::Connected {
        connection_id: connection_id.clone(),
    }));

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat_check = tokio::time::interval(Duration::from_secs(1));
    let mut last_ping = Instant::now();
    let deadline = HEARTBEAT_INTERVAL * HEARTBEAT_MISSES;

    let close_reason = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break "shutdown",

            envelope = queue.recv() => match envelope {
                Some(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(err = %e, "push envelope serialize failed");
                            continue;
                        }
                    };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break "send failed";
                    }
                }
                // Queue hit the backpressure close condition.
                None => {
                    let _ = ws_tx
                        .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                            code: 1013,
                            reason: "backpressure".into(),
                        })))
                        .await;
                    break "backpressure";
                }
            },

            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_client_text(&state, &connection_id, &queue, text.as_str(), &mut last_ping)
                        .await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break "client closed",
                Some(Err(_)) => break "receive error",
                Some(Ok(_)) => {}
            },

            _ = heartbeat_check.tick() => {
                if last_ping.elapsed() > deadline {
                    break "heartbeat missed";
                }
            }
        }
    };

    state.connections.remove(&connection_id);
    // Chat runs are session-scoped; auto-investigations keep going.
    state.runs.cancel_for_connection(&connection_id);
    tracing::info!(connection = %connection_id, reason = close_reason, "push client disconnected");
}

/// Handle one inbound text frame. Unknown types fail closed with an
/// error envelope; the frame is dropped.
async fn handle_client_text(
    state: &Arc<AppState>,
    connection_id: &ConnectionId,
    queue: &Arc<OutboundQueue>,
    text: &str,
    last_ping: &mut Instant,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            queue.push(Envelope::new(ServerMessage::Error {
                code: "validation".into(),
                message: format!("unrecognized message: {e}"),
                correlation_id: None,
                run_id: None,
            }));
            return;
        }
    };

    match message {
        ClientMessage::Ping => {
            *last_ping = Instant::now();
            queue.push(Envelope::new(ServerMessage::Pong));
        }
        ClientMessage::UserMessage {
            text,
            conversation_id,
        } => {
            spawn_chat(state, connection_id.clone(), conversation_id, text);
        }
        ClientMessage::ActionResponse {
            action_id,
            approved,
            authorization,
        } => {
            let response = argus_types::ActionResponse {
                action_id: action_id.clone(),
                approved,
                authorization,
            };
            if let Err(e) = state.actions.resolve(response).await {
                queue.push(Envelope::new(ServerMessage::Error {
                    code: "not_found".into(),
                    message: e.to_string(),
                    correlation_id: None,
                    run_id: None,
                }));
            }
        }
        ClientMessage::Cancel { run_id } => {
            if !state.runs.cancel(&run_id) {
                queue.push(Envelope::new(ServerMessage::Error {
                    code: "not_found".into(),
                    message: format!("no active run {run_id}"),
                    correlation_id: None,
                    run_id: Some(run_id),
                }));
            }
        }
    }
}

/// Start a session-scoped chat run for a user message.
fn spawn_chat(
    state: &Arc<AppState>,
    connection_id: ConnectionId,
    conversation_id: Option<ConversationId>,
    text: String,
) {
    let conversation_id = conversation_id.unwrap_or_else(ConversationId::generate);
    let run_id = RunId::generate();
    let cancel = state
        .runs
        .register(run_id.clone(), RunScope::Connection(connection_id.clone()));

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let history = load_conversation(&state.store, &conversation_id).await;
        let outcome = state
            .runner
            .run(RunSpec {
                run_id,
                conversation_id: conversation_id.clone(),
                initiator: argus_agent::RunInitiator::UserChat {
                    connection: connection_id,
                },
                priority: Priority::Routine,
                history,
                user_message: Message::user(text),
                cancel,
            })
            .await;
        save_conversation(&state.store, &conversation_id, &outcome.messages).await;
        state.runs.complete(&outcome.run_id);
    });
}

/// Fan bus traffic out to every connected client.
///
/// Run-scoped envelopes arrive pre-built on `react.delta`; domain
/// messages from the other client-visible topics are wrapped here.
pub async fn fanout(state: Arc<AppState>) {
    let mut react = state.bus.subscribe(Topic::ReactDelta);
    let mut alerts = state.bus.subscribe(Topic::AlertsFired);
    let mut alert_state = state.bus.subscribe(Topic::AlertsState);
    let mut budget = state.bus.subscribe(Topic::BudgetUpdate);
    let mut status = state.bus.subscribe(Topic::SystemStatus);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            message = react.recv() => match message {
                Some(BusMessage::ReactDelta(envelope)) => {
                    state.connections.broadcast(&envelope);
                }
                Some(_) => {}
                None => break,
            },
            message = alerts.recv() => {
                if let Some(BusMessage::AlertFired(alert)) = message {
                    state
                        .connections
                        .broadcast_message(ServerMessage::Alert(alert.as_ref().clone()));
                }
            },
            message = alert_state.recv() => {
                if let Some(BusMessage::AlertState { alert, status, by }) = message {
                    state.connections.broadcast_message(ServerMessage::AlertStateChange {
                        alert_id: alert.id.clone(),
                        status,
                        by,
                    });
                }
            },
            message = budget.recv() => {
                if let Some(BusMessage::Budget(snapshot)) = message {
                    state
                        .connections
                        .broadcast_message(ServerMessage::BudgetUpdate(snapshot));
                }
            },
            message = status.recv() => {
                if let Some(BusMessage::Status(snapshot)) = message {
                    state
                        .connections
                        .broadcast_message(ServerMessage::SystemStatus(snapshot.as_ref().clone()));
                }
            },
        }
    }
    tracing::debug!("push fan-out stopped");
}
