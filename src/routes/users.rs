//! User administration routes
//!
//! Admin-only listing and management of user accounts. Deleting a user is a
//! soft delete that also revokes every session the user holds.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{DataResponse, MessageResponse, Paginated, PaginationParams, ValidatedJson};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::users::{Role, UpdateUserRequest, UserQuery, UserResponse};
use crate::error::ApiError;

pub(super) const USER_COLUMNS: &str =
    "id, email, username, full_name, role, is_active, last_login_at, created_at, updated_at";

/// Database row for user
#[derive(Debug, sqlx::FromRow)]
pub(super) struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserRow> for UserResponse {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            username: row.username,
            full_name: row.full_name,
            role: row.role.parse().unwrap_or(Role::Viewer),
            is_active: row.is_active,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Turn a unique violation on the users table into a readable 409
pub(super) fn map_user_conflict(err: sqlx::Error) -> ApiError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.constraint() {
            Some("users_email_key") => return ApiError::conflict("Email is already registered"),
            Some("users_username_key") => return ApiError::conflict("Username is already taken"),
            _ => {}
        }
    }
    err.into()
}

pub(super) async fn fetch_user(state: &AppState, user_id: Uuid) -> Result<UserRow, ApiError> {
    sqlx::query_as::<_, UserRow>(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
        .bind(user_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// `%term%` pattern for ILIKE searches, `None` for blank input
pub(super) fn search_pattern(search: Option<&str>) -> Option<String> {
    search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")))
}

/// GET /api/users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
    Query(pagination): Query<PaginationParams>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_user_admin()?;

    let role = query.role.map(|r| r.as_str());
    let search = search_pattern(query.search.as_deref());

    let filter = r#"
        WHERE ($1::text IS NULL OR role = $1)
          AND ($2::bool IS NULL OR is_active = $2)
          AND ($3::text IS NULL OR email ILIKE $3 OR username ILIKE $3 OR full_name ILIKE $3)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM users {}", filter))
        .bind(role)
        .bind(query.is_active)
        .bind(&search)
        .fetch_one(&state.db)
        .await?;

    let rows = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {} FROM users {} ORDER BY created_at DESC LIMIT $4 OFFSET $5",
        USER_COLUMNS, filter
    ))
    .bind(role)
    .bind(query.is_active)
    .bind(&search)
    .bind(pagination.limit())
    .bind(pagination.offset())
    .fetch_all(&state.db)
    .await?;

    let data: Vec<UserResponse> = rows.into_iter().map(Into::into).collect();
    Ok(Paginated::new(data, &pagination, total))
}

/// GET /api/users/:user_id
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    if auth.user_id != user_id {
        auth.require_user_admin()?;
    }

    let user: UserResponse = fetch_user(&state, user_id).await?.into();
    Ok(DataResponse::new(user))
}

/// PATCH /api/users/:user_id
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<UpdateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_user_admin()?;

    if user_id == auth.user_id {
        if req.is_active == Some(false) {
            return Err(ApiError::bad_request("Administrators cannot deactivate themselves"));
        }
        if req.role.is_some_and(|r| r != Role::Admin) {
            return Err(ApiError::bad_request("Administrators cannot remove their own admin role"));
        }
    }

    let mut tx = state.db.begin().await?;

    let row = sqlx::query_as::<_, UserRow>(&format!(
        r#"
        UPDATE users SET
            full_name = COALESCE($2, full_name),
            role = COALESCE($3, role),
            is_active = COALESCE($4, is_active),
            deleted_at = CASE
                WHEN $4 IS TRUE THEN NULL
                WHEN $4 IS FALSE THEN COALESCE(deleted_at, NOW())
                ELSE deleted_at
            END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        USER_COLUMNS
    ))
    .bind(user_id)
    .bind(&req.full_name)
    .bind(req.role.map(|r| r.as_str()))
    .bind(req.is_active)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::not_found("User not found"))?;

    if req.is_active == Some(false) {
        revoke_all_sessions(&mut tx, user_id).await?;
    }

    tx.commit().await?;

    tracing::info!(%user_id, admin_id = %auth.user_id, "User updated");

    let user: UserResponse = row.into();
    Ok(DataResponse::new(user))
}

/// DELETE /api/users/:user_id
///
/// Soft delete: the account is deactivated and all its sessions revoked.
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_user_admin()?;

    if user_id == auth.user_id {
        return Err(ApiError::bad_request("Administrators cannot deactivate themselves"));
    }

    let mut tx = state.db.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE users
        SET is_active = FALSE, deleted_at = COALESCE(deleted_at, NOW()), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("User not found"));
    }

    let revoked = revoke_all_sessions(&mut tx, user_id).await?;
    tx.commit().await?;

    tracing::info!(%user_id, admin_id = %auth.user_id, revoked_sessions = revoked, "User deactivated");

    Ok(MessageResponse::with_code("User deactivated", "USER_DEACTIVATED"))
}

async fn revoke_all_sessions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
) -> Result<u64, ApiError> {
    let result = sqlx::query(
        "UPDATE sessions SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL",
    )
    .bind(user_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_patterns_escape_wildcards() {
        assert_eq!(search_pattern(None), None);
        assert_eq!(search_pattern(Some("   ")), None);
        assert_eq!(search_pattern(Some(" sam ")).as_deref(), Some("%sam%"));
        assert_eq!(search_pattern(Some("50%_off")).as_deref(), Some("%50\\%\\_off%"));
    }

    #[test]
    fn unique_violations_name_the_conflicting_field() {
        use crate::error::test_support::db_error;
        use axum::http::StatusCode;

        let email = map_user_conflict(db_error("23505", Some("users_email_key")));
        assert_eq!(email.status_code(), StatusCode::CONFLICT);
        assert_eq!(email.public_message(), "Email is already registered");

        let username = map_user_conflict(db_error("23505", Some("users_username_key")));
        assert_eq!(username.status_code(), StatusCode::CONFLICT);
        assert_eq!(username.public_message(), "Username is already taken");

        let other = map_user_conflict(db_error("23505", Some("users_pkey")));
        assert_eq!(other.status_code(), StatusCode::CONFLICT);
        assert_ne!(other.public_message(), "Email is already registered");

        let not_a_conflict = map_user_conflict(sqlx::Error::RowNotFound);
        assert_ne!(not_a_conflict.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn unknown_roles_read_as_viewer() {
        let now = Utc::now();
        let row = UserRow {
            id: Uuid::new_v4(),
            email: "a@example.com".into(),
            username: "a".into(),
            full_name: None,
            role: "superuser".into(),
            is_active: true,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };
        let user: UserResponse = row.into();
        assert_eq!(user.role, Role::Viewer);
    }
}
