//! Authentication routes
//!
//! Password login backed by server-side sessions. Each login creates a
//! session row and returns a signed token naming it; logging out or changing
//! the password revokes sessions so their tokens stop working.

use axum::{extract::State, response::IntoResponse};
use axum_extra::{headers::UserAgent, TypedHeader};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::users::{fetch_user, map_user_conflict, UserRow, USER_COLUMNS};
use crate::api::{Created, DataResponse, MessageResponse, ValidatedJson};
use crate::app::AppState;
use crate::auth::password::{hash_password, verify_password};
use crate::auth::RequireAuth;
use crate::domain::users::{
    ChangePasswordRequest, LoginRequest, LoginResponse, RegisterRequest, Role, UserResponse,
};
use crate::error::ApiError;

/// Serializes registrations so exactly one first user becomes admin
const REGISTRATION_LOCK_KEY: i64 = 0x5052_4543_4f4e; // "PRECON"

/// Role for a newly registered user given how many users already exist
pub fn role_for_new_user(existing_users: i64) -> Role {
    if existing_users == 0 {
        Role::Admin
    } else {
        Role::Estimator
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CredentialsRow {
    id: Uuid,
    role: String,
    password_hash: String,
    is_active: bool,
    deleted_at: Option<chrono::DateTime<Utc>>,
}

/// POST /api/auth/register
///
/// The first account ever created becomes an admin, later ones estimators.
pub async fn register(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let password_hash = hash_password(&req.password).await?;

    let mut tx = state.db.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(REGISTRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&mut *tx)
        .await?;
    let role = role_for_new_user(existing);

    let row = sqlx::query_as::<_, UserRow>(&format!(
        r#"
        INSERT INTO users (email, username, full_name, password_hash, role)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {}
        "#,
        USER_COLUMNS
    ))
    .bind(req.email.trim())
    .bind(req.username.trim())
    .bind(&req.full_name)
    .bind(&password_hash)
    .bind(role.as_str())
    .fetch_one(&mut *tx)
    .await
    .map_err(map_user_conflict)?;

    tx.commit().await?;

    tracing::info!(user_id = %row.id, role = role.as_str(), "User registered");

    let user: UserResponse = row.into();
    Ok(Created(user))
}

/// POST /api/auth/login
///
/// `login` may be the email or the username.
pub async fn login(
    State(state): State<Arc<AppState>>,
    user_agent: Option<TypedHeader<UserAgent>>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let login = req.login.trim();

    let credentials = sqlx::query_as::<_, CredentialsRow>(
        r#"
        SELECT id, role, password_hash, is_active, deleted_at
        FROM users
        WHERE LOWER(email) = LOWER($1) OR LOWER(username) = LOWER($1)
        LIMIT 1
        "#,
    )
    .bind(login)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    if !verify_password(&req.password, &credentials.password_hash).await? {
        tracing::warn!(user_id = %credentials.id, "Failed login attempt");
        return Err(ApiError::unauthorized("Invalid credentials"));
    }

    if !credentials.is_active || credentials.deleted_at.is_some() {
        return Err(ApiError::unauthorized("User account is deactivated"));
    }

    let role: Role = credentials
        .role
        .parse()
        .map_err(|e: String| ApiError::internal(e))?;

    let now = Utc::now();
    let expires_at = state.tokens.expires_at(now);
    let session_id = Uuid::new_v4();

    let mut tx = state.db.begin().await?;

    sqlx::query(
        "INSERT INTO sessions (id, user_id, user_agent, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(session_id)
    .bind(credentials.id)
    .bind(user_agent.map(|TypedHeader(ua)| ua.as_str().to_string()))
    .bind(expires_at)
    .execute(&mut *tx)
    .await?;

    let row = sqlx::query_as::<_, UserRow>(&format!(
        "UPDATE users SET last_login_at = $2 WHERE id = $1 RETURNING {}",
        USER_COLUMNS
    ))
    .bind(credentials.id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    let access_token = state
        .tokens
        .issue(credentials.id, session_id, role, now, expires_at)?;

    tracing::info!(user_id = %credentials.id, %session_id, "User logged in");

    Ok(DataResponse::new(LoginResponse {
        access_token,
        token_type: "Bearer",
        expires_at,
        user: row.into(),
    }))
}

/// POST /api/auth/logout
///
/// Revokes the session behind the presented token.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    sqlx::query("UPDATE sessions SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL")
        .bind(auth.session_id)
        .execute(&state.db)
        .await?;

    tracing::info!(user_id = %auth.user_id, session_id = %auth.session_id, "User logged out");

    Ok(MessageResponse::with_code("Logged out", "LOGGED_OUT"))
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<Arc<AppState>>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let user: UserResponse = fetch_user(&state, auth.user_id).await?.into();
    Ok(DataResponse::new(user))
}

/// POST /api/auth/change-password
///
/// Every other session of the user is revoked; the current one stays valid.
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let current_hash: String = sqlx::query_scalar("SELECT password_hash FROM users WHERE id = $1")
        .bind(auth.user_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    if !verify_password(&req.current_password, &current_hash).await? {
        return Err(ApiError::bad_request("Current password is incorrect"));
    }

    let new_hash = hash_password(&req.new_password).await?;

    let mut tx = state.db.begin().await?;

    sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
        .bind(auth.user_id)
        .bind(&new_hash)
        .execute(&mut *tx)
        .await?;

    let revoked = sqlx::query(
        r#"
        UPDATE sessions SET revoked_at = NOW()
        WHERE user_id = $1 AND id <> $2 AND revoked_at IS NULL
        "#,
    )
    .bind(auth.user_id)
    .bind(auth.session_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    tracing::info!(user_id = %auth.user_id, revoked_sessions = revoked, "Password changed");

    Ok(MessageResponse::with_code("Password changed", "PASSWORD_CHANGED"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_user_becomes_admin() {
        assert_eq!(role_for_new_user(0), Role::Admin);
        assert_eq!(role_for_new_user(1), Role::Estimator);
        assert_eq!(role_for_new_user(42), Role::Estimator);
    }
}
