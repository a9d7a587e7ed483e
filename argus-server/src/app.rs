//! Application root: construction, background tasks, and serving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use argus_agent::{ActionEngine, Investigator, ReactConfig, ReactRunner, RunManager};
use argus_bus::{Bus, BusMessage, Topic};
use argus_engine::{AlertEngine, BudgetManager, Classifier, LogNotifier, NotifierRegistry};
use argus_providers::LlmClient;
use argus_store::{RetentionPolicy, Store};
use argus_types::Config;

use crate::http;
use crate::ingest;
use crate::state::{AppState, ConnectionRegistry};
use crate::ws;

/// How often the status snapshot is published.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);
/// How often old telemetry is purged.
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);
/// Telemetry retention.
const RETENTION_DAYS: i64 = 7;

/// Build the application state and start every background task.
///
/// Separated from [`run`] so tests can drive the full pipeline without
/// binding a socket.
pub async fn build(config: Config) -> anyhow::Result<Arc<AppState>> {
    let store = Store::open(&config.storage.data_dir.join("argus.db"))
        .context("opening telemetry store")?;
    let bus = Bus::new();
    let shutdown = tokio_util::sync::CancellationToken::new();

    let budget = Arc::new(BudgetManager::new(
        config.budget.hourly_limit,
        config.budget.daily_limit,
        bus.clone(),
    ));

    let mut notifiers = NotifierRegistry::new();
    notifiers.register(Arc::new(LogNotifier));

    let (investigate_tx, investigate_rx) = mpsc::channel(64);
    let alerts = Arc::new(AlertEngine::new(
        store.clone(),
        bus.clone(),
        notifiers,
        Some(investigate_tx),
    ));
    alerts.load_or_seed().await.context("loading alert rules")?;

    let actions = Arc::new(ActionEngine::new(bus.clone(), store.clone()));

    let mut tools = argus_tools::ToolRegistry::new();
    tools.register(argus_tools::QueryMetricsTool::new(store.clone()));
    tools.register(argus_tools::AggregateMetricsTool::new(store.clone()));
    tools.register(argus_tools::SearchLogsTool::new(store.clone()));
    tools.register(argus_tools::GetSpansTool::new(store.clone()));
    tools.register(argus_tools::GetDependenciesTool::new(store.clone()));
    tools.register(argus_tools::GetDeployEventsTool::new(store.clone()));
    tools.register(argus_tools::GetProcessesTool::new(store.clone()));
    tools.register(argus_tools::GetSecurityFindingsTool::new(store.clone()));
    tools.register(argus_tools::ListAlertsTool::new(Arc::clone(&alerts)));
    tools.register(argus_tools::GetAlertTool::new(Arc::clone(&alerts)));
    tools.register(argus_tools::RunCommandTool::new(
        Arc::clone(&actions) as Arc<dyn argus_tools::ActionBroker>
    ));
    tools.register(argus_tools::KillProcessTool::new(
        Arc::clone(&actions) as Arc<dyn argus_tools::ActionBroker>
    ));
    let screen = argus_tools::InputScreen::new(&tools);
    tools.add_middleware(screen);
    tools.add_middleware(argus_tools::OutputLimiter::new(256 * 1024));
    let tools = Arc::new(tools);

    let provider = LlmClient::from_config(&config.llm);
    let runner = Arc::new(ReactRunner::new(
        provider,
        Arc::clone(&tools),
        Arc::clone(&budget),
        bus.clone(),
        store.clone(),
        ReactConfig::default(),
    ));
    let runs = Arc::new(RunManager::new());

    let state = Arc::new(AppState {
        config,
        bus: bus.clone(),
        store: store.clone(),
        alerts: Arc::clone(&alerts),
        budget: Arc::clone(&budget),
        actions,
        runs: Arc::clone(&runs),
        runner: Arc::clone(&runner),
        connections: ConnectionRegistry::new(),
        shutdown: shutdown.clone(),
        started_at: Instant::now(),
    });

    // Classifier: telemetry.raw -> events.classified.
    {
        let bus = bus.clone();
        let mut sub = bus.subscribe(Topic::TelemetryRaw);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut classifier = Classifier::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = sub.recv() => match message {
                        Some(BusMessage::Telemetry(event)) => {
                            let mut classified = event.as_ref().clone();
                            classified.severity = classifier.classify(&classified);
                            bus.publish(
                                Topic::EventsClassified,
                                BusMessage::Classified(Arc::new(classified)),
                            );
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            tracing::debug!("classifier stopped");
        });
    }

    // Alert engine consumes classified events.
    tokio::spawn(Arc::clone(&alerts).run(bus.subscribe(Topic::EventsClassified), shutdown.clone()));

    // Auto-investigations.
    let investigator = Investigator::new(
        investigate_rx,
        bus.clone(),
        budget,
        runner,
        alerts,
        runs,
        store.clone(),
    );
    tokio::spawn(investigator.run(shutdown.clone()));

    // Push fan-out.
    tokio::spawn(ws::fanout(Arc::clone(&state)));

    // Periodic status snapshots.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATUS_INTERVAL);
            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let snapshot = http::snapshot(&state).await;
                        state.bus.publish(
                            Topic::SystemStatus,
                            BusMessage::Status(Arc::new(snapshot)),
                        );
                    }
                }
            }
        });
    }

    // Retention purge.
    {
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PURGE_INTERVAL);
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let policy =
                            RetentionPolicy::uniform(chrono::Duration::days(RETENTION_DAYS));
                        match store.purge(policy).await {
                            Ok(deleted) if deleted > 0 => {
                                tracing::info!(deleted, "purged expired telemetry");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(err = %e, "purge failed"),
                        }
                    }
                }
            }
        });
    }

    Ok(state)
}

/// Build the axum router over the application state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors.origins);
    Router::new()
        .route("/ingest", post(ingest::ingest))
        .route("/ws", get(ws::ws_handler))
        .route("/alerts", get(http::list_alerts))
        .route("/alerts/{id}/acknowledge", post(http::acknowledge_alert))
        .route("/alerts/{id}/resolve", post(http::resolve_alert))
        .route("/rules", get(http::list_rules))
        .route("/rules/{id}/mute", post(http::mute_rule))
        .route("/rules/{id}/unmute", post(http::unmute_rule))
        .route("/investigations", get(http::list_investigations))
        .route("/budget", get(http::get_budget))
        .route("/logs", get(http::get_logs))
        .route("/security", get(http::get_security))
        .route("/status", get(http::get_status))
        .route("/settings", get(http::get_settings))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<axum::http::HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if parsed.is_empty() {
        CorsLayer::new()
    } else {
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Run the server until SIGINT/SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = build(config).await?;
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "argus listening");

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    let cancel = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("serving")?;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(err = %e, "SIGTERM handler failed, using ctrl-c only");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
