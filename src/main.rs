use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use civitai_fleet::api::{self, AppState};
use civitai_fleet::{FleetConfig, FleetCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("civitai_fleet=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting civitai-fleet...");

    let config = FleetConfig::load().context("Failed to load fleet configuration")?;
    let coordinator = FleetCoordinator::from_config(&config).context("Invalid fleet configuration")?;

    for endpoint in coordinator.endpoints().await {
        tracing::info!("Endpoint {} -> {}", endpoint.name, endpoint.address);
    }

    let state = AppState {
        coordinator: Arc::new(coordinator),
    };

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3002".to_string());
    let addr = format!("0.0.0.0:{}", port);

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
