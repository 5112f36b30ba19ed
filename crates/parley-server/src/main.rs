mod configuration;
mod routes;
mod state;

use configuration::ServerSettings;
use dotenv::dotenv;
use parley::config::Settings;
use state::AppState;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = ServerSettings::new()?;
    let settings = Settings::new()?;
    let state = AppState::from_settings(&settings)?;
    info!(
        models = state.registry.models().len(),
        default_model = state.registry.default_model(),
        "Backend registry ready"
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(server.socket_addr()?).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
