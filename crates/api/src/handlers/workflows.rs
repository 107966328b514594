use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine::{StatusSnapshot, WorkflowHandle, WorkflowSpec, WorkflowSummary};
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::error::ApiError;

pub async fn list(State(state): State<AppState>) -> Json<Vec<WorkflowSummary>> {
    Json(state.supervisor.list_workflows())
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    Ok(Json(state.supervisor.get_status(id)?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(spec): Json<WorkflowSpec>,
) -> Result<(StatusCode, Json<WorkflowHandle>), ApiError> {
    let handle = state.supervisor.create_workflow(spec)?;
    info!(workflow_id = %handle.workflow_id, name = %handle.name, "workflow submitted over HTTP");
    Ok((StatusCode::CREATED, Json(handle)))
}
