use axum::{extract::State, routing::get, Json, Router};
use parley::backends::factory::ModelInfo;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelsResponse {
    models: Vec<ModelInfo>,
    default_model: String,
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.registry.models(),
        default_model: state.registry.default_model().to_string(),
    })
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/models", get(list_models))
        .with_state(state)
}
