mod cli;
mod logging;
mod routes;

use std::{collections::VecDeque, sync::Arc, time::Instant};

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use squadron_agent::{ProcessWorker, ProcessWorkerConfig};
use squadron_core::activity::ActivityLog;
use squadron_core::config::AppConfig;
use squadron_core::db::Db;
use squadron_core::definitions::{self, DefinitionSet};
use squadron_core::events::{EventRouter, RouteDecision};
use squadron_core::forge::{ForgeClient, HttpForgeClient};
use squadron_core::gates::GateRegistry;
use squadron_core::lifecycle::LifecycleManager;
use squadron_core::pipeline::PipelineEngine;
use squadron_core::reconcile::Reconciler;
use squadron_core::sandbox::Sandbox;
use squadron_core::types::{NormalizedEvent, StageKind};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<AppConfig>,
    pub definitions: Arc<DefinitionSet>,
    pub engine: Arc<PipelineEngine>,
    pub event_router: Arc<EventRouter>,
    pub activity: Arc<ActivityLog>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
    pub pipeline_event_tx: broadcast::Sender<String>,
}

/// Routes an inbound event through the router and actuates whatever
/// decisions it returns: starting a pipeline run, or feeding a reactive
/// directive to one already running. Shared by the webhook-shaped
/// ingestion endpoint and any future non-HTTP event sources.
pub(crate) async fn dispatch_event(
    state: &AppState,
    event: &NormalizedEvent,
) -> anyhow::Result<Vec<RouteDecision>> {
    let decisions = state.event_router.route(event)?;
    for decision in &decisions {
        match decision {
            RouteDecision::StartPipeline { pipeline_name } => {
                let Some(def) = state.definitions.get(pipeline_name) else {
                    warn!(%pipeline_name, "router named a pipeline not in the loaded set");
                    continue;
                };
                match state.engine.start_pipeline(def, event, None).await {
                    Ok(run_id) => {
                        info!(%run_id, %pipeline_name, "started pipeline run");
                        let _ = state.pipeline_event_tx.send(
                            serde_json::json!({"type": "pipeline_run", "run_id": run_id}).to_string(),
                        );
                    }
                    Err(e) => warn!(%pipeline_name, error = %e, "start_pipeline failed"),
                }
            }
            RouteDecision::Reactive { run_id, directive } => {
                if let Err(e) = state.engine.apply_reactive(run_id, directive, event).await {
                    warn!(%run_id, error = %e, "apply_reactive failed");
                }
            }
            RouteDecision::Duplicate | RouteDecision::SelfEvent | RouteDecision::Unhandled => {}
        }
    }
    Ok(decisions)
}

/// Distinct agent roles referenced by any loaded pipeline's agent stages —
/// used to decide which session-worker roles need a registered backend.
fn roles_in(definitions: &DefinitionSet) -> Vec<String> {
    let mut roles = std::collections::HashSet::new();
    for def in definitions.by_name.values() {
        for stage in &def.stages {
            if let StageKind::Agent(cfg) = &stage.kind {
                roles.insert(cfg.role.clone());
            }
        }
    }
    roles.into_iter().collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring: Arc<std::sync::Mutex<VecDeque<String>>> =
        Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "squadron_server=info,squadron_core=info,squadron_agent=info,tower_http=warn".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    match cli.command {
        cli::Command::Serve => serve(log_tx, log_ring).await,
        other => cli::run_client_command(other).await,
    }
}

async fn serve(
    log_tx: broadcast::Sender<String>,
    log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
) -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(Db::open(&config.sqlite_path)?);

    // A malformed definitions directory must never come up partially
    // serving; validation failure here is fatal at startup.
    let definitions = Arc::new(definitions::load_and_validate(std::path::Path::new(&config.pipelines_dir))?);
    info!(count = definitions.by_name.len(), "pipeline definitions loaded");

    let forge: Arc<dyn ForgeClient> = Arc::new(HttpForgeClient::new(
        config.forge_base_url.clone(),
        config.forge_token.clone(),
        config.backoff_policy(),
    ));

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&db),
        config.repo_path.clone(),
        config.agent_limits.clone(),
        config.agent_concurrency_limit,
    ));
    let gates = Arc::new(GateRegistry::with_builtins(()));

    let engine = Arc::new(PipelineEngine::new(
        Arc::clone(&db),
        Arc::clone(&definitions),
        Arc::clone(&lifecycle),
        Arc::clone(&gates),
        Arc::clone(&forge),
        config.repo_path.clone(),
        config.repo_name.clone(),
    ));

    let sandbox_mode = Sandbox::detect(&config.sandbox_backend).await;
    let agent_command = std::env::var("SQUADRON_AGENT_COMMAND").unwrap_or_else(|_| "squadron-session-runner".to_string());
    for role in roles_in(&definitions) {
        let worker = Arc::new(ProcessWorker::new(ProcessWorkerConfig {
            command: agent_command.clone(),
            base_args: vec![],
            sandbox_mode: sandbox_mode.clone(),
            docker_image: None,
        }));
        engine.register_worker(&role, worker).await;
        info!(%role, "registered subprocess worker");
    }

    let event_router = Arc::new(EventRouter::new(
        Arc::clone(&db),
        Arc::clone(&definitions),
        config.bot_identity.clone(),
    ));

    let activity = Arc::new(ActivityLog::new(config.activity_log_ring_size));
    let (pipeline_event_tx, _) = broadcast::channel::<String>(1024);

    let reconciler = Reconciler::new(Arc::clone(&db), Arc::clone(&lifecycle), Arc::clone(&engine));
    reconciler.startup_recovery().await?;

    let config = Arc::new(config);
    let state = Arc::new(AppState {
        db: Arc::clone(&db),
        config: Arc::clone(&config),
        definitions,
        engine: Arc::clone(&engine),
        event_router,
        activity,
        start_time: Instant::now(),
        log_tx,
        log_ring,
        pipeline_event_tx,
    });

    // Tick loop: every active run gets one chance per cycle to advance.
    // Panics inside a single tick are caught so the loop never dies.
    {
        let db = Arc::clone(&db);
        let engine = Arc::clone(&engine);
        let tx = state.pipeline_event_tx.clone();
        tokio::spawn(async move {
            loop {
                if let Ok(runs) = db.list_active_runs() {
                    for run in runs {
                        let engine = Arc::clone(&engine);
                        let run_id = run.run_id.clone();
                        let tx = tx.clone();
                        let handle = tokio::spawn(async move {
                            match engine.tick(&run_id).await {
                                Ok(_) => {
                                    let _ = tx.send(serde_json::json!({"type": "pipeline_run", "run_id": run_id}).to_string());
                                }
                                Err(e) => tracing::error!(%run_id, error = %e, "tick failed"),
                            }
                        });
                        if let Err(join_err) = handle.await {
                            tracing::error!("tick task panicked: {join_err}");
                        }
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        });
    }

    // Periodic reconciliation sweep: watchdog + orphan detection.
    {
        let reconciler = Reconciler::new(Arc::clone(&db), Arc::clone(&lifecycle), Arc::clone(&engine));
        let interval = config.reconciliation_interval_secs;
        let watchdog_timeout = config.watchdog_heartbeat_timeout_secs;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
                if let Err(e) = reconciler.periodic_sweep(watchdog_timeout).await {
                    tracing::error!("periodic_sweep failed: {e}");
                }
            }
        });
    }

    let app = Router::new()
        .route("/api/health", get(routes::health))
        .route("/status", get(routes::get_status))
        .route("/pipelines", get(routes::list_pipelines))
        .route("/pipelines/runs", get(routes::list_runs))
        .route("/pipelines/runs/:id", get(routes::get_run))
        .route("/pipelines/runs/:id/cancel", post(routes::cancel_run))
        .route("/pipelines/stream", get(routes::stream_runs))
        .route("/agents", get(routes::list_agents))
        .route("/agents/:id/activity", get(routes::agent_activity))
        .route("/agents/:id/stats", get(routes::agent_stats))
        .route("/activity", get(routes::recent_activity))
        .route("/stream", get(routes::sse_activity))
        .route("/events", post(routes::post_event))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.dashboard_bind, config.dashboard_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
