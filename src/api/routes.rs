use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::ApiError;
use super::AppState;
use crate::client::{ResultsStore, RunGroup, Scenario};
use crate::orchestration::MetricsSnapshot;
use crate::transaction::Transaction;

pub async fn server_info(State(state): State<AppState>) -> Json<BTreeMap<&'static str, String>> {
    Json(state.client.connection().server_info())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub status: String,
    pub task_queue: String,
    pub metrics: MetricsSnapshot,
}

pub async fn worker_status(State(state): State<AppState>) -> Json<WorkerStatus> {
    let engine = state.client.engine();
    Json(WorkerStatus {
        status: if state.worker_running() { "running" } else { "stopped" }.to_string(),
        task_queue: engine.config().task_queue.clone(),
        metrics: engine.metrics(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<String>,
}

/// All run groups, or the newest `limit` of them. A limit that does not
/// parse is ignored.
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<RunGroup>> {
    let limit = query.limit.and_then(|raw| raw.trim().parse::<usize>().ok());
    match limit {
        Some(limit) => Json(state.results.recent(limit)),
        None => Json(state.results.all()),
    }
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunGroup>, ApiError> {
    match state.results.get(&id) {
        Some(group) => Ok(Json(group)),
        None => Err(ApiError::NotFound(format!("Workflow not found: {}", id))),
    }
}

pub async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.results.clear(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Workflow not found: {}", id)))
    }
}

pub async fn clear_runs(State(state): State<AppState>) -> StatusCode {
    state.results.clear_all();
    StatusCode::NO_CONTENT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParams {
    pub amount: i64,
    pub source_account: String,
    pub target_account: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    /// Groups the runs; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub params: TransactionParams,
    /// Scenario name, `update-with-start` when absent
    #[serde(default)]
    pub wf_type: Option<String>,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
}

fn default_iterations() -> usize {
    1
}

/// Run the requested scenario `iterations` times, one after the other, and
/// return the accumulated group.
pub async fn run_workflow(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunGroup>, ApiError> {
    if request.iterations == 0 {
        return Err(ApiError::BadRequest(
            "iterations must be at least 1".to_string(),
        ));
    }
    let scenario = match request.wf_type.as_deref() {
        None => Scenario::UpdateWithStartLocal,
        Some(name) => name.parse::<Scenario>().map_err(ApiError::BadRequest)?,
    };
    let request_id = request
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(ResultsStore::request_id);

    for iteration in 1..=request.iterations {
        let tx = Transaction::new(
            format!("{request_id}-iteration-{iteration}"),
            request.params.source_account.clone(),
            request.params.target_account.clone(),
            request.params.amount,
        );
        let report = state.client.run_scenario(scenario, tx).await?;
        state
            .results
            .add_run(&request_id, request.iterations, report);
    }

    state
        .results
        .get(&request_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Workflow not found: {}", request_id)))
}
