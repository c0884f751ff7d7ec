//! Project routes
//!
//! Projects are soft deleted; deleting one also soft deletes its diagrams
//! and removes their stored files.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::users::search_pattern;
use crate::api::{Created, DataResponse, MessageResponse, Paginated, PaginationParams, ValidatedJson};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::bid_packages::progress_percent;
use crate::domain::projects::{
    CreateProjectRequest, ProjectDetailResponse, ProjectQuery, ProjectResponse, ProjectStatus,
    UpdateProjectRequest,
};
use crate::error::ApiError;

const PROJECT_COLUMNS: &str = "id, name, description, location, client_name, bid_due_date, \
                               status, created_by, created_at, updated_at";

/// Database row for project
#[derive(Debug, sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    location: Option<String>,
    client_name: Option<String>,
    bid_due_date: Option<DateTime<Utc>>,
    status: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProjectRow> for ProjectResponse {
    fn from(row: ProjectRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            location: row.location,
            client_name: row.client_name,
            bid_due_date: row.bid_due_date,
            status: ProjectStatus::parse(&row.status),
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectCounts {
    diagram_count: i64,
    bid_package_count: i64,
    line_item_count: i64,
    approved_line_item_count: i64,
}

/// 404 unless the project exists and is not deleted
pub(super) async fn ensure_project_exists(state: &AppState, project_id: Uuid) -> Result<(), ApiError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM projects WHERE id = $1 AND deleted_at IS NULL)",
    )
    .bind(project_id)
    .fetch_one(&state.db)
    .await?;

    if exists {
        Ok(())
    } else {
        Err(ApiError::not_found("Project not found"))
    }
}

async fn fetch_project(state: &AppState, project_id: Uuid) -> Result<ProjectRow, ApiError> {
    sqlx::query_as::<_, ProjectRow>(&format!(
        "SELECT {} FROM projects WHERE id = $1 AND deleted_at IS NULL",
        PROJECT_COLUMNS
    ))
    .bind(project_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Project not found"))
}

/// POST /api/projects
pub async fn create_project(
    State(state): State<Arc<AppState>>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_manager()?;

    let row = sqlx::query_as::<_, ProjectRow>(&format!(
        r#"
        INSERT INTO projects (name, description, location, client_name, bid_due_date, created_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        PROJECT_COLUMNS
    ))
    .bind(req.name.trim())
    .bind(&req.description)
    .bind(&req.location)
    .bind(&req.client_name)
    .bind(req.bid_due_date)
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await?;

    tracing::info!(project_id = %row.id, user_id = %auth.user_id, "Project created");

    let project: ProjectResponse = row.into();
    Ok(Created(project))
}

/// GET /api/projects
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectQuery>,
    Query(pagination): Query<PaginationParams>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let search = search_pattern(query.search.as_deref());
    let status = query.status.map(|s| s.as_str());

    let filter = r#"
        WHERE deleted_at IS NULL
          AND ($1::text IS NULL OR name ILIKE $1)
          AND ($2::text IS NULL OR status = $2)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM projects {}", filter))
        .bind(&search)
        .bind(status)
        .fetch_one(&state.db)
        .await?;

    let rows = sqlx::query_as::<_, ProjectRow>(&format!(
        "SELECT {} FROM projects {} ORDER BY created_at DESC LIMIT $3 OFFSET $4",
        PROJECT_COLUMNS, filter
    ))
    .bind(&search)
    .bind(status)
    .bind(pagination.limit())
    .bind(pagination.offset())
    .fetch_all(&state.db)
    .await?;

    let data: Vec<ProjectResponse> = rows.into_iter().map(Into::into).collect();
    Ok(Paginated::new(data, &pagination, total))
}

/// GET /api/projects/:project_id
///
/// Includes diagram and bid package counts and the overall approval progress.
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let row = fetch_project(&state, project_id).await?;

    let counts = sqlx::query_as::<_, ProjectCounts>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM diagrams WHERE project_id = $1 AND deleted_at IS NULL) AS diagram_count,
            (SELECT COUNT(*) FROM bid_packages WHERE project_id = $1) AS bid_package_count,
            (SELECT COUNT(*) FROM line_items li
               JOIN bid_packages bp ON bp.id = li.bid_package_id
              WHERE bp.project_id = $1) AS line_item_count,
            (SELECT COUNT(*) FROM line_items li
               JOIN bid_packages bp ON bp.id = li.bid_package_id
              WHERE bp.project_id = $1 AND li.status = 'approved') AS approved_line_item_count
        "#,
    )
    .bind(project_id)
    .fetch_one(&state.db)
    .await?;

    Ok(DataResponse::new(ProjectDetailResponse {
        project: row.into(),
        diagram_count: counts.diagram_count,
        bid_package_count: counts.bid_package_count,
        line_item_count: counts.line_item_count,
        approved_line_item_count: counts.approved_line_item_count,
        progress: progress_percent(counts.approved_line_item_count, counts.line_item_count),
    }))
}

/// PATCH /api/projects/:project_id
pub async fn update_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_manager()?;

    let row = sqlx::query_as::<_, ProjectRow>(&format!(
        r#"
        UPDATE projects SET
            name = COALESCE($2, name),
            description = COALESCE($3, description),
            location = COALESCE($4, location),
            client_name = COALESCE($5, client_name),
            bid_due_date = COALESCE($6, bid_due_date),
            status = COALESCE($7, status),
            updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NULL
        RETURNING {}
        "#,
        PROJECT_COLUMNS
    ))
    .bind(project_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(&req.description)
    .bind(&req.location)
    .bind(&req.client_name)
    .bind(req.bid_due_date)
    .bind(req.status.map(|s| s.as_str()))
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Project not found"))?;

    let project: ProjectResponse = row.into();
    Ok(DataResponse::new(project))
}

/// DELETE /api/projects/:project_id
///
/// Soft deletes the project and its diagrams. Stored files are removed after
/// commit; failures there are logged and ignored.
pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_manager()?;

    let mut tx = state.db.begin().await?;

    let result = sqlx::query(
        "UPDATE projects SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(project_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Project not found"));
    }

    let stored_paths: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE diagrams SET deleted_at = NOW(), updated_at = NOW()
        WHERE project_id = $1 AND deleted_at IS NULL
        RETURNING stored_path
        "#,
    )
    .bind(project_id)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    for path in &stored_paths {
        state.store.remove_quietly(path).await;
    }

    tracing::info!(
        %project_id,
        user_id = %auth.user_id,
        diagrams = stored_paths.len(),
        "Project deleted"
    );

    Ok(MessageResponse::with_code("Project deleted", "PROJECT_DELETED"))
}
