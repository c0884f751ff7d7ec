mod api;
mod app;
mod auth;
mod config;
mod db;
mod domain;
mod error;
mod logging;
mod middleware;
mod routes;
mod services;

use anyhow::Result;
use std::sync::Arc;

use services::{AnthropicVision, FileStore, RedisCache, VisionModel};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = config::Settings::from_env()?;

    // Initialize logging
    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        "Starting preconstruction bidding backend"
    );

    // Create database pool (runs migrations)
    let pool = db::create_pool(&settings).await?;

    // Create Redis cache
    let cache = RedisCache::new(&settings.redis_url, settings.redis_cache_ttl_seconds).await?;

    // Upload storage
    let store = FileStore::new(&settings.upload_dir).await?;

    // Vision model client
    let vision: Arc<dyn VisionModel> = Arc::new(AnthropicVision::new(
        &settings.anthropic_base_url,
        &settings.anthropic_api_key,
        &settings.vision_model,
        settings.vision_max_tokens,
        settings.vision_timeout_seconds,
        settings.vision_max_retries,
    )?);

    // Check the vision API in the background; a failure only degrades /health
    tokio::spawn({
        let vision = vision.clone();
        async move {
            match vision.health_check().await {
                Ok(()) => tracing::info!("Vision API is reachable"),
                Err(e) => tracing::warn!(error = %e, "Vision API health check failed - will retry on first request"),
            }
        }
    });

    // Create application state
    let state = app::AppState::new(pool, settings.clone(), cache, vision, store);

    // Build application
    let app = app::create_app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.server_addr).await?;
    tracing::info!("Listening on {}", settings.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
