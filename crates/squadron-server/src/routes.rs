use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use squadron_core::types::{NormalizedEvent, PipelineRun, StageRun};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;

use crate::AppState;

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Bearer-token check shared by every REST handler. A missing configured
/// token means the dashboard is open.
pub(crate) fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.config.dashboard_token else {
        return Ok(());
    };
    let supplied = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if supplied == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn authorize_query_token(state: &AppState, token: Option<&str>) -> Result<(), StatusCode> {
    let Some(expected) = &state.config.dashboard_token else {
        return Ok(());
    };
    if token == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn run_to_json(run: &PipelineRun, stage_runs: &[StageRun]) -> Value {
    json!({
        "run_id": run.run_id,
        "pipeline_name": run.pipeline_name,
        "status": run.status.as_str(),
        "current_stage_id": run.current_stage_id,
        "issue_number": run.issue_number,
        "primary_pr_number": run.primary_pr_number,
        "scope": run.scope,
        "parent_run_id": run.parent_run_id,
        "parent_stage_id": run.parent_stage_id,
        "nesting_depth": run.nesting_depth,
        "created_at": run.created_at.to_rfc3339(),
        "updated_at": run.updated_at.to_rfc3339(),
        "error_message": run.error_message,
        "error_stage_id": run.error_stage_id,
        "stage_runs": stage_runs,
    })
}

// ── health ────────────────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let active_runs = state.db.list_active_runs().map_err(internal)?;
    let active_agents = state.db.list_active_agents().map_err(internal)?;
    Ok(Json(json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "pipelines_loaded": state.definitions.by_name.len(),
        "active_runs": active_runs.len(),
        "active_agents": active_agents.len(),
    })))
}

// ── pipelines ─────────────────────────────────────────────────────────────

pub(crate) async fn list_pipelines(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let summaries: Vec<Value> = state
        .definitions
        .by_name
        .values()
        .map(|def| {
            json!({
                "name": def.name,
                "description": def.description,
                "scope": def.scope,
                "trigger": def.trigger,
                "stage_count": def.stages.len(),
                "is_sub_pipeline": def.is_sub_pipeline(),
            })
        })
        .collect();
    Ok(Json(json!(summaries)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub status: Option<String>,
    pub pipeline_name: Option<String>,
    pub pr_number: Option<i64>,
    pub issue_number: Option<i64>,
}

pub(crate) async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<RunsQuery>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let runs = state
        .db
        .list_runs_filtered(
            q.status.as_deref(),
            q.pipeline_name.as_deref(),
            q.pr_number,
            q.issue_number,
            q.limit.unwrap_or(50).min(200),
            q.offset.unwrap_or(0),
        )
        .map_err(internal)?;
    let out: Vec<Value> = runs.iter().map(|r| run_to_json(r, &[])).collect();
    Ok(Json(json!(out)))
}

pub(crate) async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let run = state
        .db
        .get_pipeline_run(&run_id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let stage_runs = state.db.list_stage_runs_for_run(&run_id).map_err(internal)?;
    Ok(Json(run_to_json(&run, &stage_runs)))
}

pub(crate) async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    authorize(&state, &headers)?;
    let run = state
        .db
        .get_pipeline_run(&run_id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if run.status.is_terminal() {
        return Err(StatusCode::CONFLICT);
    }
    state.engine.cancel_run(&run_id).await.map_err(internal)?;
    let _ = state.pipeline_event_tx.send(json!({
        "type": "pipeline_cancelled",
        "run_id": run_id,
    }).to_string());
    Ok(StatusCode::OK)
}

pub(crate) async fn stream_runs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<std::collections::HashMap<String, String>>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    authorize_query_token(&state, q.get("token").map(String::as_str))?;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let live_rx = state.pipeline_event_tx.subscribe();
    let db = Arc::clone(&state.db);

    tokio::spawn(async move {
        if tx.send(json!({"type": "connected"}).to_string()).is_err() {
            return;
        }
        if let Ok(active) = db.list_active_runs() {
            for run in &active {
                let payload = json!({"type": "pipeline_run", "run": run_to_json(run, &[])});
                if tx.send(payload.to_string()).is_err() {
                    return;
                }
            }
        }
        if tx.send(json!({"type": "hydrated"}).to_string()).is_err() {
            return;
        }

        let mut live_rx = BroadcastStream::new(live_rx);
        let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                item = live_rx.next() => {
                    match item {
                        Some(Ok(line)) => if tx.send(line).is_err() { return },
                        Some(Err(_)) => continue,
                        None => return,
                    }
                }
                _ = heartbeat.tick() => {
                    if tx.send(json!({"type": "heartbeat"}).to_string()).is_err() { return }
                }
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(|data| Ok::<_, Infallible>(Event::default().data(data)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping")))
}

// ── agents ────────────────────────────────────────────────────────────────

pub(crate) async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let agents = state.db.list_active_agents().map_err(internal)?;
    Ok(Json(json!(agents)))
}

pub(crate) async fn agent_activity(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let (history, _) = state.activity.subscribe(&agent_id);
    Ok(Json(json!({ "agent_id": agent_id, "history": history })))
}

pub(crate) async fn agent_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let agent = state
        .db
        .get_agent(&agent_id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "agent_id": agent.agent_id,
        "role": agent.role,
        "status": agent.status,
        "iteration_count": agent.iteration_count,
        "tool_call_count": agent.tool_call_count,
        "turn_count": agent.turn_count,
        "active_since": agent.active_since.map(|t| t.to_rfc3339()),
        "last_heartbeat": agent.last_heartbeat.map(|t| t.to_rfc3339()),
        "watchdog_escaped": agent.watchdog_escaped,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActivityQuery {
    pub agent_id: Option<String>,
    pub limit: Option<u32>,
}

pub(crate) async fn recent_activity(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ActivityQuery>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let events = state
        .db
        .list_recent_activity(q.agent_id.as_deref(), q.limit.unwrap_or(100).min(1000))
        .map_err(internal)?;
    Ok(Json(json!(events)))
}

pub(crate) async fn sse_activity(
    State(state): State<Arc<AppState>>,
    Query(q): Query<std::collections::HashMap<String, String>>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    authorize_query_token(&state, q.get("token").map(String::as_str))?;
    let owner = q.get("agent_id").cloned().unwrap_or_else(|| "global".to_string());

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let (history, live_rx) = state.activity.subscribe(&owner);
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let Some(mut live_rx) = live_rx else { return };
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx).map(|data| Ok::<_, Infallible>(Event::default().data(data)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping")))
}

// ── events ingestion ──────────────────────────────────────────────────────

pub(crate) async fn post_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<NormalizedEvent>,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let decisions = crate::dispatch_event(&state, &event).await.map_err(internal)?;
    Ok(Json(json!({ "decisions": decisions.iter().map(|d| format!("{d:?}")).collect::<Vec<_>>() })))
}
