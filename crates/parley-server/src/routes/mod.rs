pub mod chat;
pub mod models;

use axum::Router;

use crate::state::AppState;

pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(chat::routes(state.clone()))
        .merge(models::routes(state))
}
