use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::app::AppState;
use crate::db;

#[derive(Serialize)]
pub struct RootResponse {
    pub message: &'static str,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: ServiceHealth,
}

#[derive(Serialize)]
pub struct ServiceHealth {
    pub database: String,
    pub redis: String,
    pub vision_api: String,
}

/// GET /
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Preconstruction Bidding API",
        status: "running",
    })
}

/// Overall status from the individual checks. The database is the only
/// critical dependency.
fn overall_status(database: bool, redis: bool, vision: bool) -> (&'static str, StatusCode) {
    match (database, redis && vision) {
        (true, true) => ("healthy", StatusCode::OK),
        (true, false) => ("degraded", StatusCode::OK),
        (false, _) => ("unhealthy", StatusCode::SERVICE_UNAVAILABLE),
    }
}

fn label(ok: bool) -> String {
    if ok { "ok" } else { "error" }.to_string()
}

/// Health check endpoint - public
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (db_ok, redis_result, vision_result) = tokio::join!(
        db::health_check(&state.db),
        state.cache.health_check(),
        state.extraction.vision().health_check(),
    );

    if let Err(e) = &redis_result {
        tracing::warn!(error = %e, "Redis health check failed");
    }
    if let Err(e) = &vision_result {
        tracing::warn!(error = %e, "Vision API health check failed");
    }

    let (status, status_code) =
        overall_status(db_ok, redis_result.is_ok(), vision_result.is_ok());

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            services: ServiceHealth {
                database: label(db_ok),
                redis: label(redis_result.is_ok()),
                vision_api: label(vision_result.is_ok()),
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn root_reports_running() {
        let app: Router = Router::new().route("/", get(root));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "Preconstruction Bidding API");
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn database_outage_is_unavailable() {
        assert_eq!(overall_status(true, true, true), ("healthy", StatusCode::OK));
        assert_eq!(overall_status(true, false, true), ("degraded", StatusCode::OK));
        assert_eq!(overall_status(true, true, false), ("degraded", StatusCode::OK));
        assert_eq!(
            overall_status(false, true, true),
            ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
        );
    }
}
