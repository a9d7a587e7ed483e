//! Auto-investigation orchestration: urgent alerts become ReAct runs.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use argus_bus::{Bus, BusMessage, Topic};
use argus_engine::{AlertEngine, BudgetManager};
use argus_store::{Order, QuerySpec, Store, TelemetryKind};
use argus_types::{
    Alert, AlertStatus, ConversationId, Message, Priority, Provider, RunId, ServerMessage,
};

use crate::emit;
use crate::manager::{RunManager, RunScope};
use crate::react::{ReactRunner, RunInitiator, RunSpec};

/// Admission probe estimate for starting an investigation.
const PROBE_ESTIMATE: u64 = 512;

/// Turns urgent auto-investigate alerts into ReAct runs.
///
/// Listens for firings forwarded by the alert engine and for lifecycle
/// changes (a resolved alert cancels its in-flight investigation).
pub struct Investigator<P: Provider> {
    requests: mpsc::Receiver<Arc<Alert>>,
    bus: Bus,
    budget: Arc<BudgetManager>,
    runner: Arc<ReactRunner<P>>,
    engine: Arc<AlertEngine>,
    manager: Arc<RunManager>,
    store: Store,
}

impl<P: Provider + 'static> Investigator<P> {
    /// Create an investigator consuming `requests`.
    pub fn new(
        requests: mpsc::Receiver<Arc<Alert>>,
        bus: Bus,
        budget: Arc<BudgetManager>,
        runner: Arc<ReactRunner<P>>,
        engine: Arc<AlertEngine>,
        manager: Arc<RunManager>,
        store: Store,
    ) -> Self {
        Self {
            requests,
            bus,
            budget,
            runner,
            engine,
            manager,
            store,
        }
    }

    /// Consume requests and lifecycle changes until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut state_sub = self.bus.subscribe(Topic::AlertsState);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(alert) => self.start(alert).await,
                    None => break,
                },
                state = state_sub.recv() => {
                    if let Some(BusMessage::AlertState { alert, status, .. }) = state {
                        if status == AlertStatus::Resolved {
                            self.manager.cancel_for_alert(&alert.id);
                        }
                    }
                }
            }
        }
        tracing::debug!("investigator stopped");
    }

    /// Start one investigation, if the budget admits urgent work.
    async fn start(&self, alert: Arc<Alert>) {
        // Admission gate only: the run loop accounts for real usage
        // turn by turn, so the probe is settled back immediately.
        match self.budget.reserve(Priority::Urgent, PROBE_ESTIMATE) {
            Ok(probe) => self.budget.settle(probe, 0),
            Err(e) => {
                tracing::warn!(alert_id = %alert.id, err = %e, "investigation not admitted");
                return;
            }
        }

        let run_id = RunId::generate();
        if let Err(e) = self.engine.set_investigation(&alert.id, run_id.clone()).await {
            tracing::warn!(alert_id = %alert.id, err = %e, "could not attach investigation");
        }

        emit(
            &self.bus,
            ServerMessage::InvestigationStart {
                run_id: run_id.clone(),
                alert_id: alert.id.clone(),
                title: format!("Investigating: {}", alert.title),
            },
        );

        let prompt = self.initial_prompt(&alert).await;
        let cancel = self
            .manager
            .register(run_id.clone(), RunScope::Alert(alert.id.clone()));
        let spec = RunSpec {
            run_id: run_id.clone(),
            conversation_id: ConversationId::new(format!("investigation-{run_id}")),
            initiator: RunInitiator::AutoInvestigation {
                alert_id: alert.id.clone(),
            },
            priority: Priority::Urgent,
            history: vec![],
            user_message: Message::user(prompt),
            cancel,
        };

        let runner = Arc::clone(&self.runner);
        let manager = Arc::clone(&self.manager);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let outcome = runner.run(spec).await;
            manager.complete(&outcome.run_id);
            emit(
                &bus,
                ServerMessage::InvestigationEnd {
                    run_id: outcome.run_id,
                    summary: outcome.final_text,
                    usage: outcome.usage,
                },
            );
        });
    }

    /// Compact alert description with the key metrics at alert time.
    async fn initial_prompt(&self, alert: &Alert) -> String {
        let mut prompt = format!(
            "An urgent alert fired and needs investigation.\n\
             Rule: {} ({})\nSource: {}\nSummary: {}\nFired at: {}\n",
            alert.title, alert.rule_id, alert.source, alert.summary, alert.timestamp
        );

        let now = Utc::now();
        let spec = QuerySpec {
            kind: TelemetryKind::SystemMetrics,
            window: (now - ChronoDuration::minutes(10), now),
            source: Some(alert.source.clone()),
            order: Order::Desc,
            limit: 10,
            ..QuerySpec::default_for(TelemetryKind::SystemMetrics)
        };
        if let Ok(result) = self.store.query(spec).await {
            if !result.rows.is_empty() {
                prompt.push_str("Recent metrics from the source:\n");
                for row in &result.rows {
                    prompt.push_str(&format!(
                        "  {} {}={}\n",
                        row.timestamp,
                        row.name,
                        row.value.unwrap_or_default()
                    ));
                }
            }
        }
        prompt.push_str(
            "Use the available tools to find the root cause, then summarize findings and \
             recommended remediation.",
        );
        prompt
    }
}
