use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::context::SessionRecord;
use super::AuthContext;
use crate::app::AppState;
use crate::error::ErrorResponse;

/// Extractor that requires a live session
///
/// Example:
/// ```ignore
/// async fn protected_route(auth: RequireAuth) -> impl IntoResponse {
///     format!("Hello, user {}", auth.user_id)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequireAuth(pub AuthContext);

impl std::ops::Deref for RequireAuth {
    type Target = AuthContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    InvalidToken(String),
    InactiveSession(&'static str),
    Unavailable,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidFormat => (StatusCode::UNAUTHORIZED, "Invalid authorization format"),
            AuthError::InvalidToken(_) => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InactiveSession(reason) => (StatusCode::UNAUTHORIZED, *reason),
            AuthError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Authentication temporarily unavailable",
            ),
        };

        let code = if status == StatusCode::UNAUTHORIZED {
            "UNAUTHORIZED"
        } else {
            "SERVICE_UNAVAILABLE"
        };

        let body = ErrorResponse {
            code: code.to_string(),
            message: message.to_string(),
            request_id: crate::middleware::current_request_id(),
        };

        (status, Json(body)).into_response()
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|rejection| {
                    if rejection.is_missing() {
                        AuthError::MissingToken
                    } else {
                        AuthError::InvalidFormat
                    }
                })?;

        let token = bearer.token();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let claims = state.tokens.verify(token).map_err(|e| {
            tracing::warn!(error = %e, "Session token verification failed");
            AuthError::InvalidToken(e.to_string())
        })?;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AuthError::InvalidToken("Invalid user ID in token".to_string()))?;
        let session_id = Uuid::parse_str(&claims.sid)
            .map_err(|_| AuthError::InvalidToken("Invalid session ID in token".to_string()))?;

        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT s.id AS session_id, u.id AS user_id, u.username, u.email, u.role,
                   u.is_active, u.deleted_at, s.expires_at, s.revoked_at
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&state.db)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "Session lookup failed");
            AuthError::Unavailable
        })?
        .ok_or(AuthError::InactiveSession("Session not found"))?;

        record.check(user_id, Utc::now()).map_err(|reason| {
            tracing::warn!(%user_id, %session_id, reason, "Rejected session");
            AuthError::InactiveSession(reason)
        })?;

        let context = record.into_context().map_err(|e| {
            tracing::warn!(error = %e, "Failed to build auth context");
            AuthError::InvalidToken(e.to_string())
        })?;

        Ok(RequireAuth(context))
    }
}
