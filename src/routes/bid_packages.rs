//! Bid package routes
//!
//! Package CRUD, the review workflow, user assignments and the package's
//! line items. Every change to the set or status of a package's line items
//! is followed by a progress recalculation.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::line_items::{
    apply_line_item_update, insert_line_item, line_item_counts, recalculate_progress, LineItemRow,
    NewLineItem, LINE_ITEM_COLUMNS,
};
use super::projects::ensure_project_exists;
use crate::api::{Created, DataResponse, MessageResponse, Paginated, PaginationParams, ValidatedJson};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::bid_packages::{
    check_entry_requirements, AssignUserRequest, AssignmentResponse, AssignmentRole,
    BidPackageDetailResponse, BidPackageQuery, BidPackageResponse, BidPackageStatus,
    CreateBidPackageRequest, TransitionRequest, UpdateBidPackageRequest,
};
use crate::domain::line_items::{
    AttachLineItemsRequest, BulkUpdateLineItemsRequest, CreateLineItemRequest, LineItemQuery,
    LineItemResponse,
};
use crate::error::ApiError;

pub(super) const PACKAGE_COLUMNS: &str = "id, project_id, name, description, trade, status, due_date, \
                                          progress, created_by, created_at, updated_at";

/// Restricts a `bid_packages` query to packages of live projects
pub(super) const LIVE_PACKAGE_FILTER: &str = "EXISTS (SELECT 1 FROM projects p \
     WHERE p.id = bid_packages.project_id AND p.deleted_at IS NULL)";

// ============================================================================
// Database Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(super) struct BidPackageRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trade: Option<String>,
    pub status: String,
    pub due_date: Option<DateTime<Utc>>,
    pub progress: i32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<BidPackageRow> for BidPackageResponse {
    fn from(row: BidPackageRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            description: row.description,
            trade: row.trade,
            status: BidPackageStatus::parse(&row.status),
            due_date: row.due_date,
            progress: row.progress,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AssignmentRow {
    id: Uuid,
    bid_package_id: Uuid,
    user_id: Uuid,
    username: String,
    full_name: Option<String>,
    assignment_role: String,
    assigned_by: Uuid,
    created_at: DateTime<Utc>,
}

impl From<AssignmentRow> for AssignmentResponse {
    fn from(row: AssignmentRow) -> Self {
        Self {
            id: row.id,
            bid_package_id: row.bid_package_id,
            user_id: row.user_id,
            username: row.username,
            full_name: row.full_name,
            assignment_role: AssignmentRole::parse(&row.assignment_role),
            assigned_by: row.assigned_by,
            created_at: row.created_at,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub(super) async fn fetch_package(state: &AppState, package_id: Uuid) -> Result<BidPackageRow, ApiError> {
    sqlx::query_as::<_, BidPackageRow>(&format!(
        "SELECT {} FROM bid_packages WHERE id = $1 AND {}",
        PACKAGE_COLUMNS, LIVE_PACKAGE_FILTER
    ))
    .bind(package_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Bid package not found"))
}

async fn is_assignee(state: &AppState, package_id: Uuid, user_id: Uuid) -> Result<bool, ApiError> {
    Ok(sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM user_assignments WHERE bid_package_id = $1 AND user_id = $2)",
    )
    .bind(package_id)
    .bind(user_id)
    .fetch_one(&state.db)
    .await?)
}

async fn list_assignment_rows(state: &AppState, package_id: Uuid) -> Result<Vec<AssignmentRow>, ApiError> {
    Ok(sqlx::query_as::<_, AssignmentRow>(
        r#"
        SELECT a.id, a.bid_package_id, a.user_id, u.username, u.full_name,
               a.assignment_role, a.assigned_by, a.created_at
        FROM user_assignments a
        JOIN users u ON u.id = a.user_id
        WHERE a.bid_package_id = $1
        ORDER BY a.created_at
        "#,
    )
    .bind(package_id)
    .fetch_all(&state.db)
    .await?)
}

/// Reject ids listed more than once in one request
fn ensure_unique_ids(ids: impl IntoIterator<Item = Uuid>) -> Result<(), ApiError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ApiError::bad_request(format!("Line item {} is listed more than once", id)));
        }
    }
    Ok(())
}

// ============================================================================
// Packages
// ============================================================================

/// POST /api/projects/:project_id/bid-packages
pub async fn create_bid_package(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<CreateBidPackageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_manager()?;
    ensure_project_exists(&state, project_id).await?;

    let row = sqlx::query_as::<_, BidPackageRow>(&format!(
        r#"
        INSERT INTO bid_packages (project_id, name, description, trade, due_date, created_by)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        PACKAGE_COLUMNS
    ))
    .bind(project_id)
    .bind(req.name.trim())
    .bind(&req.description)
    .bind(&req.trade)
    .bind(req.due_date)
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await?;

    tracing::info!(%project_id, package_id = %row.id, "Bid package created");

    let package: BidPackageResponse = row.into();
    Ok(Created(package))
}

/// GET /api/projects/:project_id/bid-packages
pub async fn list_bid_packages(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<BidPackageQuery>,
    Query(pagination): Query<PaginationParams>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    ensure_project_exists(&state, project_id).await?;

    let status = query.status.map(|s| s.as_str());

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bid_packages WHERE project_id = $1 AND ($2::text IS NULL OR status = $2)",
    )
    .bind(project_id)
    .bind(status)
    .fetch_one(&state.db)
    .await?;

    let rows = sqlx::query_as::<_, BidPackageRow>(&format!(
        r#"
        SELECT {} FROM bid_packages
        WHERE project_id = $1 AND ($2::text IS NULL OR status = $2)
        ORDER BY created_at DESC
        LIMIT $3 OFFSET $4
        "#,
        PACKAGE_COLUMNS
    ))
    .bind(project_id)
    .bind(status)
    .bind(pagination.limit())
    .bind(pagination.offset())
    .fetch_all(&state.db)
    .await?;

    let data: Vec<BidPackageResponse> = rows.into_iter().map(Into::into).collect();
    Ok(Paginated::new(data, &pagination, total))
}

/// GET /api/bid-packages/:package_id
///
/// Includes assignments and line-item tallies.
pub async fn get_bid_package(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let row = fetch_package(&state, package_id).await?;

    let (assignments, counts) = tokio::try_join!(
        list_assignment_rows(&state, package_id),
        line_item_counts(&state.db, package_id),
    )?;

    Ok(DataResponse::new(BidPackageDetailResponse {
        package: row.into(),
        assignments: assignments.into_iter().map(Into::into).collect(),
        line_item_counts: counts,
    }))
}

/// PATCH /api/bid-packages/:package_id
pub async fn update_bid_package(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<UpdateBidPackageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_manager()?;

    let row = sqlx::query_as::<_, BidPackageRow>(&format!(
        r#"
        UPDATE bid_packages SET
            name = COALESCE($2, name),
            description = COALESCE($3, description),
            trade = COALESCE($4, trade),
            due_date = COALESCE($5, due_date),
            updated_at = NOW()
        WHERE id = $1 AND {}
        RETURNING {}
        "#,
        LIVE_PACKAGE_FILTER, PACKAGE_COLUMNS
    ))
    .bind(package_id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(&req.description)
    .bind(&req.trade)
    .bind(req.due_date)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Bid package not found"))?;

    let package: BidPackageResponse = row.into();
    Ok(DataResponse::new(package))
}

/// DELETE /api/bid-packages/:package_id
///
/// Manually created items go with the package; items that came from a bid
/// form stay on the form.
pub async fn delete_bid_package(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_manager()?;
    fetch_package(&state, package_id).await?;

    let mut tx = state.db.begin().await?;

    let removed_items = sqlx::query(
        "DELETE FROM line_items WHERE bid_package_id = $1 AND bid_form_id IS NULL",
    )
    .bind(package_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let result = sqlx::query("DELETE FROM bid_packages WHERE id = $1")
        .bind(package_id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Bid package not found"));
    }

    tx.commit().await?;

    tracing::info!(%package_id, user_id = %auth.user_id, removed_items, "Bid package deleted");

    Ok(MessageResponse::with_code("Bid package deleted", "BID_PACKAGE_DELETED"))
}

/// POST /api/bid-packages/:package_id/status
pub async fn transition_bid_package(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    auth: RequireAuth,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let row = fetch_package(&state, package_id).await?;
    let current = BidPackageStatus::parse(&row.status);
    let next = req.status;

    if !current.can_transition_to(next) {
        return Err(ApiError::bad_request(format!(
            "Cannot move a bid package from {} to {}",
            current, next
        )));
    }

    let assigned = is_assignee(&state, package_id, auth.user_id).await?;
    if !BidPackageStatus::role_may_enter(next, auth.role, assigned) {
        return Err(ApiError::forbidden(format!(
            "Your role cannot move this bid package to {}",
            next
        )));
    }

    let counts = line_item_counts(&state.db, package_id).await?;
    check_entry_requirements(next, &counts).map_err(ApiError::bad_request)?;

    // Guard on the status we validated against
    let updated = sqlx::query_as::<_, BidPackageRow>(&format!(
        r#"
        UPDATE bid_packages SET status = $2, updated_at = NOW()
        WHERE id = $1 AND status = $3
        RETURNING {}
        "#,
        PACKAGE_COLUMNS
    ))
    .bind(package_id)
    .bind(next.as_str())
    .bind(current.as_str())
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::conflict("Bid package status changed concurrently, reload and retry"))?;

    tracing::info!(
        %package_id,
        user_id = %auth.user_id,
        from = current.as_str(),
        to = next.as_str(),
        comment = req.comment.as_deref().unwrap_or(""),
        "Bid package status changed"
    );

    let package: BidPackageResponse = updated.into();
    Ok(DataResponse::new(package))
}

/// POST /api/bid-packages/:package_id/recalculate
pub async fn recalculate_bid_package(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    fetch_package(&state, package_id).await?;
    recalculate_progress(&state.db, package_id).await?;

    let package: BidPackageResponse = fetch_package(&state, package_id).await?.into();
    Ok(DataResponse::new(package))
}

// ============================================================================
// Assignments
// ============================================================================

/// POST /api/bid-packages/:package_id/assignments
///
/// Assigning someone to a draft package moves it to `assigned`.
pub async fn assign_user(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    auth: RequireAuth,
    Json(req): Json<AssignUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_manager()?;
    fetch_package(&state, package_id).await?;

    let active: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_active AND deleted_at IS NULL)",
    )
    .bind(req.user_id)
    .fetch_one(&state.db)
    .await?;

    if !active {
        return Err(ApiError::not_found("User not found or inactive"));
    }

    let mut tx = state.db.begin().await?;

    let row = sqlx::query_as::<_, AssignmentRow>(
        r#"
        WITH inserted AS (
            INSERT INTO user_assignments (bid_package_id, user_id, assignment_role, assigned_by)
            VALUES ($1, $2, $3, $4)
            RETURNING id, bid_package_id, user_id, assignment_role, assigned_by, created_at
        )
        SELECT i.id, i.bid_package_id, i.user_id, u.username, u.full_name,
               i.assignment_role, i.assigned_by, i.created_at
        FROM inserted i
        JOIN users u ON u.id = i.user_id
        "#,
    )
    .bind(package_id)
    .bind(req.user_id)
    .bind(req.assignment_role.as_str())
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err)
            if db_err.constraint() == Some("user_assignments_package_user_key") =>
        {
            ApiError::conflict("User is already assigned to this bid package")
        }
        _ => e.into(),
    })?;

    sqlx::query(
        "UPDATE bid_packages SET status = 'assigned', updated_at = NOW() WHERE id = $1 AND status = 'draft'",
    )
    .bind(package_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        %package_id,
        assignee_id = %req.user_id,
        role = req.assignment_role.as_str(),
        "User assigned to bid package"
    );

    let assignment: AssignmentResponse = row.into();
    Ok(Created(assignment))
}

/// GET /api/bid-packages/:package_id/assignments
pub async fn list_assignments(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    fetch_package(&state, package_id).await?;

    let data: Vec<AssignmentResponse> = list_assignment_rows(&state, package_id)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(DataResponse::new(data))
}

/// DELETE /api/bid-packages/:package_id/assignments/:user_id
///
/// Removing the last assignee of an `assigned` package moves it back to draft.
pub async fn unassign_user(
    State(state): State<Arc<AppState>>,
    Path((package_id, user_id)): Path<(Uuid, Uuid)>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_manager()?;
    fetch_package(&state, package_id).await?;

    let mut tx = state.db.begin().await?;

    let result = sqlx::query("DELETE FROM user_assignments WHERE bid_package_id = $1 AND user_id = $2")
        .bind(package_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Assignment not found"));
    }

    sqlx::query(
        r#"
        UPDATE bid_packages SET status = 'draft', updated_at = NOW()
        WHERE id = $1 AND status = 'assigned'
          AND NOT EXISTS (SELECT 1 FROM user_assignments WHERE bid_package_id = $1)
        "#,
    )
    .bind(package_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(%package_id, assignee_id = %user_id, "User unassigned from bid package");

    Ok(MessageResponse::with_code("Assignment removed", "ASSIGNMENT_REMOVED"))
}

// ============================================================================
// Package line items
// ============================================================================

/// GET /api/bid-packages/:package_id/line-items
pub async fn list_package_line_items(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    Query(query): Query<LineItemQuery>,
    Query(pagination): Query<PaginationParams>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    fetch_package(&state, package_id).await?;

    let status = query.status.map(|s| s.as_str());
    let filter = r#"
        WHERE bid_package_id = $1
          AND ($2::text IS NULL OR status = $2)
          AND ($3::text IS NULL OR category = $3)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM line_items {}", filter))
        .bind(package_id)
        .bind(status)
        .bind(&query.category)
        .fetch_one(&state.db)
        .await?;

    let rows = sqlx::query_as::<_, LineItemRow>(&format!(
        "SELECT {} FROM line_items {} ORDER BY sort_order, created_at LIMIT $4 OFFSET $5",
        LINE_ITEM_COLUMNS, filter
    ))
    .bind(package_id)
    .bind(status)
    .bind(&query.category)
    .bind(pagination.limit())
    .bind(pagination.offset())
    .fetch_all(&state.db)
    .await?;

    let data: Vec<LineItemResponse> = rows.into_iter().map(Into::into).collect();
    Ok(Paginated::new(data, &pagination, total))
}

/// POST /api/bid-packages/:package_id/line-items
///
/// Manually entered item, appended after the existing ones.
pub async fn create_package_line_item(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<CreateLineItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;
    fetch_package(&state, package_id).await?;

    let next_order: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM line_items WHERE bid_package_id = $1",
    )
    .bind(package_id)
    .fetch_one(&state.db)
    .await?;

    let mut item = NewLineItem::from_request(req, next_order)?;
    item.bid_package_id = Some(package_id);

    let row = insert_line_item(&state.db, &item).await?;
    recalculate_progress(&state.db, package_id).await?;

    tracing::info!(%package_id, line_item_id = %row.id, "Line item created");

    let response: LineItemResponse = row.into();
    Ok(Created(response))
}

/// POST /api/bid-packages/:package_id/line-items/attach
///
/// Move existing items of the same project (typically from a bid form)
/// into the package. Packages they leave are recalculated as well.
pub async fn attach_line_items(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    auth: RequireAuth,
    Json(req): Json<AttachLineItemsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;

    if req.line_item_ids.is_empty() {
        return Err(ApiError::bad_request("line_item_ids must not be empty"));
    }
    ensure_unique_ids(req.line_item_ids.iter().copied())?;

    let package = fetch_package(&state, package_id).await?;

    let mut tx = state.db.begin().await?;

    let eligible: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM line_items li
        LEFT JOIN bid_forms bf ON bf.id = li.bid_form_id
        LEFT JOIN bid_packages bp ON bp.id = li.bid_package_id
        WHERE li.id = ANY($1) AND COALESCE(bf.project_id, bp.project_id) = $2
        "#,
    )
    .bind(&req.line_item_ids)
    .bind(package.project_id)
    .fetch_one(&mut *tx)
    .await?;

    if eligible != req.line_item_ids.len() as i64 {
        return Err(ApiError::bad_request(
            "Some line items do not exist or belong to another project",
        ));
    }

    let previous_packages: Vec<Option<Uuid>> = sqlx::query_scalar(
        r#"
        UPDATE line_items li SET bid_package_id = $2, updated_at = NOW()
        FROM (SELECT id, bid_package_id FROM line_items WHERE id = ANY($1) FOR UPDATE) old
        WHERE li.id = old.id
        RETURNING old.bid_package_id
        "#,
    )
    .bind(&req.line_item_ids)
    .bind(package_id)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    let mut affected: HashSet<Uuid> = previous_packages.into_iter().flatten().collect();
    affected.insert(package_id);
    try_join_all(affected.iter().map(|id| recalculate_progress(&state.db, *id))).await?;

    tracing::info!(
        %package_id,
        attached = req.line_item_ids.len(),
        user_id = %auth.user_id,
        "Line items attached to bid package"
    );

    let package: BidPackageResponse = fetch_package(&state, package_id).await?.into();
    Ok(DataResponse::new(package))
}

/// PATCH /api/bid-packages/:package_id/line-items
///
/// Bulk edit. Rows are independent updates run concurrently; any row that
/// is not in the package fails the request with 404.
pub async fn bulk_update_line_items(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<BulkUpdateLineItemsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;
    ensure_unique_ids(req.items.iter().map(|item| item.id))?;
    fetch_package(&state, package_id).await?;

    let rows = try_join_all(
        req.items
            .iter()
            .map(|item| apply_line_item_update(&state.db, item.id, Some(package_id), &item.changes)),
    )
    .await?;

    tracing::info!(%package_id, updated = rows.len(), "Bulk line item update");

    let data: Vec<LineItemResponse> = rows.into_iter().map(Into::into).collect();
    Ok(DataResponse::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_ids_are_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(ensure_unique_ids([a, b]).is_ok());
        let err = ensure_unique_ids([a, b, a]).unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn packages_of_deleted_projects_are_hidden() {
        assert!(LIVE_PACKAGE_FILTER.contains("p.id = bid_packages.project_id"));
        assert!(LIVE_PACKAGE_FILTER.contains("p.deleted_at IS NULL"));
    }
}
