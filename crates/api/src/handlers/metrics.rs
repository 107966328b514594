use axum::{extract::State, Json};
use engine::EngineMetrics;

use super::AppState;

pub async fn get(State(state): State<AppState>) -> Json<EngineMetrics> {
    Json(state.supervisor.get_metrics())
}
