//! Bid form routes
//!
//! A bid form is the stored result of one extraction run. Verifying a form
//! approves the line items the user checked.

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

use super::diagrams::DiagramRow;
use super::line_items::{insert_line_item, recalculate_progress, LineItemRow, NewLineItem, LINE_ITEM_COLUMNS};
use super::projects::ensure_project_exists;
use crate::api::{DataResponse, MessageResponse, Paginated, PaginationParams};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::bid_forms::{
    BidFormDetailResponse, BidFormResponse, BidFormStatus, VerificationRequest,
};
use crate::domain::extraction::{Confidence, ExtractionMode, ExtractionResult};
use crate::error::ApiError;

const BID_FORM_COLUMNS: &str = "id, project_id, diagram_id, bid_package_id, project_name, extraction_mode, \
                                extraction_confidence, raw_text, status, comments, created_by, \
                                verified_by, verified_at, created_at, updated_at";

/// Restricts a `bid_forms` query to forms of live projects
const LIVE_FORM_FILTER: &str = "EXISTS (SELECT 1 FROM projects p \
     WHERE p.id = bid_forms.project_id AND p.deleted_at IS NULL)";

#[derive(Debug, sqlx::FromRow)]
struct BidFormRow {
    id: Uuid,
    project_id: Uuid,
    diagram_id: Option<Uuid>,
    bid_package_id: Option<Uuid>,
    project_name: Option<String>,
    extraction_mode: String,
    extraction_confidence: String,
    raw_text: Option<String>,
    status: String,
    comments: Option<String>,
    created_by: Uuid,
    verified_by: Option<Uuid>,
    verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BidFormRow {
    fn into_parts(self) -> (BidFormResponse, Option<String>) {
        let form = BidFormResponse {
            id: self.id,
            project_id: self.project_id,
            diagram_id: self.diagram_id,
            bid_package_id: self.bid_package_id,
            project_name: self.project_name,
            extraction_mode: ExtractionMode::parse(&self.extraction_mode),
            extraction_confidence: Confidence::parse(&self.extraction_confidence),
            status: BidFormStatus::parse(&self.status),
            comments: self.comments,
            created_by: self.created_by,
            verified_by: self.verified_by,
            verified_at: self.verified_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        (form, self.raw_text)
    }

    fn into_detail(self, line_items: Vec<LineItemRow>) -> BidFormDetailResponse {
        let (form, raw_text) = self.into_parts();
        BidFormDetailResponse {
            form,
            raw_text,
            line_items: line_items.into_iter().map(Into::into).collect(),
        }
    }
}

async fn fetch_bid_form(state: &AppState, form_id: Uuid) -> Result<BidFormRow, ApiError> {
    sqlx::query_as::<_, BidFormRow>(&format!(
        "SELECT {} FROM bid_forms WHERE id = $1 AND {}",
        BID_FORM_COLUMNS, LIVE_FORM_FILTER
    ))
    .bind(form_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Bid form not found"))
}

async fn form_line_items(state: &AppState, form_id: Uuid) -> Result<Vec<LineItemRow>, ApiError> {
    Ok(sqlx::query_as::<_, LineItemRow>(&format!(
        "SELECT {} FROM line_items WHERE bid_form_id = $1 ORDER BY sort_order, created_at",
        LINE_ITEM_COLUMNS
    ))
    .bind(form_id)
    .fetch_all(&state.db)
    .await?)
}

/// Store an extraction result as a bid form with its line items. Items also
/// join `bid_package_id` when given; that package's progress is refreshed.
pub(super) async fn persist_extraction(
    state: &AppState,
    diagram: &DiagramRow,
    bid_package_id: Option<Uuid>,
    result: &ExtractionResult,
    mode: ExtractionMode,
    created_by: Uuid,
) -> Result<BidFormDetailResponse, ApiError> {
    let mut tx = state.db.begin().await?;

    let form = sqlx::query_as::<_, BidFormRow>(&format!(
        r#"
        INSERT INTO bid_forms (project_id, diagram_id, bid_package_id, project_name,
                               extraction_mode, extraction_confidence, raw_text, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        BID_FORM_COLUMNS
    ))
    .bind(diagram.project_id)
    .bind(diagram.id)
    .bind(bid_package_id)
    .bind(&result.project_name)
    .bind(mode.as_str())
    .bind(result.extraction_confidence.as_str())
    .bind(&result.raw_text)
    .bind(created_by)
    .fetch_one(&mut *tx)
    .await?;

    // Packages keep their own ordering; extracted items go after it
    let offset: i32 = match bid_package_id {
        Some(package_id) => {
            sqlx::query_scalar(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM line_items WHERE bid_package_id = $1",
            )
            .bind(package_id)
            .fetch_one(&mut *tx)
            .await?
        }
        None => 0,
    };

    let mut items = Vec::with_capacity(result.line_items.len());
    for (index, extracted) in result
        .line_items
        .iter()
        .filter(|item| !item.description.trim().is_empty())
        .enumerate()
    {
        let mut item = NewLineItem::from_extracted(extracted, offset + index as i32);
        item.bid_form_id = Some(form.id);
        item.bid_package_id = bid_package_id;
        items.push(insert_line_item(&mut *tx, &item).await?);
    }

    tx.commit().await?;

    if let Some(package_id) = bid_package_id {
        recalculate_progress(&state.db, package_id).await?;
    }

    tracing::info!(
        bid_form_id = %form.id,
        diagram_id = %diagram.id,
        line_items = items.len(),
        "Bid form stored"
    );

    Ok(form.into_detail(items))
}

/// GET /api/projects/:project_id/bid-forms
pub async fn list_bid_forms(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(pagination): Query<PaginationParams>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    ensure_project_exists(&state, project_id).await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bid_forms WHERE project_id = $1")
        .bind(project_id)
        .fetch_one(&state.db)
        .await?;

    let rows = sqlx::query_as::<_, BidFormRow>(&format!(
        "SELECT {} FROM bid_forms WHERE project_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        BID_FORM_COLUMNS
    ))
    .bind(project_id)
    .bind(pagination.limit())
    .bind(pagination.offset())
    .fetch_all(&state.db)
    .await?;

    let data: Vec<BidFormResponse> = rows.into_iter().map(|row| row.into_parts().0).collect();
    Ok(Paginated::new(data, &pagination, total))
}

/// GET /api/bid-forms/:form_id
pub async fn get_bid_form(
    State(state): State<Arc<AppState>>,
    Path(form_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let form = fetch_bid_form(&state, form_id).await?;
    let items = form_line_items(&state, form_id).await?;
    Ok(DataResponse::new(form.into_detail(items)))
}

/// Ids listed in a verification that are not items of the form
fn foreign_ids(requested: &[Uuid], form_items: &HashSet<Uuid>) -> Vec<Uuid> {
    requested
        .iter()
        .filter(|id| !form_items.contains(id))
        .copied()
        .collect()
}

/// POST /api/bid-forms/:form_id/verify
///
/// Approves `verified_items` and marks the form verified.
pub async fn verify_bid_form(
    State(state): State<Arc<AppState>>,
    Path(form_id): Path<Uuid>,
    auth: RequireAuth,
    Json(req): Json<VerificationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_reviewer()?;
    fetch_bid_form(&state, form_id).await?;

    let form_items: HashSet<Uuid> =
        sqlx::query_scalar::<_, Uuid>("SELECT id FROM line_items WHERE bid_form_id = $1")
            .bind(form_id)
            .fetch_all(&state.db)
            .await?
            .into_iter()
            .collect();

    let foreign = foreign_ids(&req.verified_items, &form_items);
    if !foreign.is_empty() {
        let ids: Vec<String> = foreign.iter().map(Uuid::to_string).collect();
        return Err(ApiError::bad_request(format!(
            "Line items do not belong to this bid form: {}",
            ids.join(", ")
        )));
    }

    let mut tx = state.db.begin().await?;

    let touched_packages: Vec<Option<Uuid>> = sqlx::query_scalar(
        r#"
        UPDATE line_items SET
            status = 'approved',
            reviewed_by = $3,
            reviewed_at = NOW(),
            updated_at = NOW()
        WHERE bid_form_id = $1 AND id = ANY($2)
        RETURNING bid_package_id
        "#,
    )
    .bind(form_id)
    .bind(&req.verified_items)
    .bind(auth.user_id)
    .fetch_all(&mut *tx)
    .await?;

    let form = sqlx::query_as::<_, BidFormRow>(&format!(
        r#"
        UPDATE bid_forms SET
            status = 'verified',
            verified_by = $2,
            verified_at = NOW(),
            comments = COALESCE($3, comments),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        BID_FORM_COLUMNS
    ))
    .bind(form_id)
    .bind(auth.user_id)
    .bind(&req.comments)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    let packages: HashSet<Uuid> = touched_packages.into_iter().flatten().collect();
    try_join_all(packages.iter().map(|id| recalculate_progress(&state.db, *id))).await?;

    tracing::info!(
        bid_form_id = %form_id,
        user_id = %auth.user_id,
        approved = req.verified_items.len(),
        "Bid form verified"
    );

    let items = form_line_items(&state, form_id).await?;
    Ok(DataResponse::new(form.into_detail(items)))
}

/// DELETE /api/bid-forms/:form_id
///
/// Items not yet moved into a bid package are deleted with the form; the
/// rest stay in their packages.
pub async fn delete_bid_form(
    State(state): State<Arc<AppState>>,
    Path(form_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;
    fetch_bid_form(&state, form_id).await?;

    let mut tx = state.db.begin().await?;

    let removed_items = sqlx::query(
        "DELETE FROM line_items WHERE bid_form_id = $1 AND bid_package_id IS NULL",
    )
    .bind(form_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let result = sqlx::query("DELETE FROM bid_forms WHERE id = $1")
        .bind(form_id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Bid form not found"));
    }

    tx.commit().await?;

    tracing::info!(bid_form_id = %form_id, user_id = %auth.user_id, removed_items, "Bid form deleted");

    Ok(MessageResponse::with_code("Bid form deleted", "BID_FORM_DELETED"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_flags_items_of_other_forms() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let form_items: HashSet<Uuid> = [a, b].into_iter().collect();

        assert!(foreign_ids(&[a, b], &form_items).is_empty());
        assert!(foreign_ids(&[], &form_items).is_empty());
        assert_eq!(foreign_ids(&[a, stranger], &form_items), vec![stranger]);
    }

    #[test]
    fn forms_of_deleted_projects_are_hidden() {
        assert!(LIVE_FORM_FILTER.contains("p.id = bid_forms.project_id"));
        assert!(LIVE_FORM_FILTER.contains("p.deleted_at IS NULL"));
    }

    #[test]
    fn row_maps_stored_enums() {
        let now = Utc::now();
        let row = BidFormRow {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            diagram_id: None,
            bid_package_id: None,
            project_name: Some("Clinic".into()),
            extraction_mode: "comprehensive".into(),
            extraction_confidence: "medium".into(),
            raw_text: Some("{}".into()),
            status: "verified".into(),
            comments: None,
            created_by: Uuid::new_v4(),
            verified_by: None,
            verified_at: None,
            created_at: now,
            updated_at: now,
        };

        let detail = row.into_detail(Vec::new());
        assert_eq!(detail.form.extraction_mode, ExtractionMode::Comprehensive);
        assert_eq!(detail.form.extraction_confidence, Confidence::Medium);
        assert_eq!(detail.form.status, BidFormStatus::Verified);
        assert_eq!(detail.raw_text.as_deref(), Some("{}"));
    }
}
