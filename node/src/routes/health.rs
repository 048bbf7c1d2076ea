use crate::state::AppState;
use crate::sync::Connectivity;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    build_id: String,
    connectivity: Connectivity,
    checkpoint: i64,
    chats: usize,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        build_id: state.build_id().to_string(),
        connectivity: state.connectivity(),
        checkpoint: state.checkpoint(),
        chats: state.directory().len(),
    })
}
