use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
    Json,
};
use serde::Serialize;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub workflow_id: Uuid,
    /// `false` when the workflow was already terminal or already cancelling.
    pub cancelled: bool,
}

/// Start the workflow and stream its events as server-sent events. The
/// response ends after the terminal workflow event.
pub async fn execute(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.supervisor.execute_workflow(id)?;
    let stream = events.map(|event| {
        let sse = Event::default().event(event.name());
        Ok(sse
            .json_data(&event)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
    });
    Ok(Sse::new(stream))
}

pub async fn cancel(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.supervisor.cancel_workflow(id)?;
    Ok(Json(CancelResponse {
        workflow_id: id,
        cancelled,
    }))
}
