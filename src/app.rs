use axum::{extract::DefaultBodyLimit, http::HeaderValue, middleware::from_fn, Router};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::auth::SessionTokens;
use crate::config::Settings;
use crate::middleware::{request_id_layer, scope_request_id};
use crate::routes;
use crate::services::{ExtractionJobs, ExtractionService, FileStore, RedisCache, VisionModel};

/// Multipart framing on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub settings: Settings,
    pub tokens: SessionTokens,
    pub cache: RedisCache,
    pub extraction: ExtractionService,
    pub jobs: ExtractionJobs,
    pub store: FileStore,
}

impl AppState {
    pub fn new(
        db: PgPool,
        settings: Settings,
        cache: RedisCache,
        vision: Arc<dyn VisionModel>,
        store: FileStore,
    ) -> Arc<Self> {
        let tokens = SessionTokens::new(&settings.session_secret, settings.session_ttl_hours);
        let jobs = ExtractionJobs::new(settings.extraction_job_ttl_seconds);

        Arc::new(Self {
            db,
            tokens,
            cache,
            extraction: ExtractionService::new(vision),
            jobs,
            store,
            settings,
        })
    }
}

/// Build the complete application with all middleware
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.settings);

    // Build trace layer (use DEBUG for spans to reduce overhead at INFO level)
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let (set_request_id, propagate_request_id) = request_id_layer();

    // Oversized uploads are rejected by the handler with 413; this limit
    // only has to let a maximal upload through
    let body_limit = DefaultBodyLimit::max(state.settings.max_upload_bytes + MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .merge(routes::root_router())
        .nest("/api", routes::api_router())
        // Middleware stack (applied bottom-up)
        .layer(body_limit)
        .layer(from_fn(scope_request_id))
        .layer(propagate_request_id)
        .layer(trace_layer)
        .layer(set_request_id)
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_allow_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    // Preflight caching: a day in dev, an hour elsewhere
    let max_age = if settings.env.is_dev() {
        std::time::Duration::from_secs(86400)
    } else {
        std::time::Duration::from_secs(3600)
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::list([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("x-request-id"),
        ]))
        .expose_headers([axum::http::HeaderName::from_static("x-request-id")])
        .allow_credentials(true)
        .max_age(max_age)
}
