use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

use pdp_service::{app, load_startup_state, spawn_refresher, ApiDoc, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    let state = load_startup_state(&config)?;
    spawn_refresher(&config, &state);
    tokio::spawn(pdp_service::cache::run_cache_sweeper(
        std::sync::Arc::clone(state.service.cache()),
        std::time::Duration::from_secs(30),
    ));

    let app = app(state).route(
        "/openapi.json",
        axum::routing::get(|| async { axum::Json(ApiDoc::openapi()) }),
    );

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!("pdp-service listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
