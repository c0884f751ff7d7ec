//! Line item routes
//!
//! Also home of the line item row mapping, inserts and the bid package
//! progress recalculation shared by the extraction and bid package routes.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{DataResponse, MessageResponse, ValidatedJson};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::bid_packages::{progress_percent, LineItemCounts};
use crate::domain::extraction::ExtractedLineItem;
use crate::domain::line_items::{
    amount_in_range, derive_total, CreateLineItemRequest, LineItemResponse, LineItemStatus, ReviewDecision,
    ReviewLineItemRequest, UpdateLineItemRequest,
};
use crate::error::ApiError;

pub(super) const LINE_ITEM_COLUMNS: &str = "id, bid_form_id, bid_package_id, item_number, description, \
                                            quantity, unit, unit_price, total_price, notes, category, \
                                            status, reviewed_by, reviewed_at, review_comment, sort_order, \
                                            created_at, updated_at";

// ============================================================================
// Database Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(super) struct LineItemRow {
    pub id: Uuid,
    pub bid_form_id: Option<Uuid>,
    pub bid_package_id: Option<Uuid>,
    pub item_number: Option<String>,
    pub description: String,
    pub quantity: Option<Decimal>,
    pub unit: Option<String>,
    pub unit_price: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub notes: Option<String>,
    pub category: Option<String>,
    pub status: String,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_comment: Option<String>,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<LineItemRow> for LineItemResponse {
    fn from(row: LineItemRow) -> Self {
        Self {
            id: row.id,
            bid_form_id: row.bid_form_id,
            bid_package_id: row.bid_package_id,
            item_number: row.item_number,
            description: row.description,
            quantity: from_decimal(row.quantity),
            unit: row.unit,
            unit_price: from_decimal(row.unit_price),
            total_price: from_decimal(row.total_price),
            notes: row.notes,
            category: row.category,
            status: LineItemStatus::parse(&row.status),
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            review_comment: row.review_comment,
            sort_order: row.sort_order,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Restricts a `line_items` query to items whose project is not deleted
pub(super) const LIVE_ITEM_FILTER: &str = "EXISTS (SELECT 1 FROM projects p \
     WHERE p.deleted_at IS NULL AND p.id IN (\
     (SELECT f.project_id FROM bid_forms f WHERE f.id = line_items.bid_form_id), \
     (SELECT b.project_id FROM bid_packages b WHERE b.id = line_items.bid_package_id)))";

/// NUMERIC(18,4) value for a float. NaN, infinities and magnitudes the
/// column cannot hold become NULL.
pub(super) fn to_decimal(value: Option<f64>) -> Option<Decimal> {
    value
        .filter(|v| amount_in_range(*v))
        .and_then(Decimal::from_f64)
        .map(|d| d.round_dp(4))
}

fn from_decimal(value: Option<Decimal>) -> Option<f64> {
    value.and_then(|d| d.to_f64())
}

/// Column values of a line item about to be inserted
#[derive(Debug, Clone, Default)]
pub(super) struct NewLineItem {
    pub bid_form_id: Option<Uuid>,
    pub bid_package_id: Option<Uuid>,
    pub item_number: Option<String>,
    pub description: String,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
    pub notes: Option<String>,
    pub category: Option<String>,
    pub sort_order: i32,
}

impl NewLineItem {
    pub fn from_extracted(item: &ExtractedLineItem, sort_order: i32) -> Self {
        Self {
            item_number: item.item_number.clone(),
            description: item.description.clone(),
            quantity: item.quantity,
            unit: item.unit.clone(),
            unit_price: item.unit_price,
            total_price: derive_total(item.quantity, item.unit_price, item.total_price),
            notes: item.notes.clone(),
            category: item.category.clone(),
            sort_order,
            ..Default::default()
        }
    }

    /// Fails when the derived total does not fit the amount column
    pub fn from_request(req: CreateLineItemRequest, sort_order: i32) -> Result<Self, ApiError> {
        let total_price = derive_total(req.quantity, req.unit_price, req.total_price);
        if total_price.is_some_and(|total| !amount_in_range(total)) {
            return Err(ApiError::bad_request("total_price: is out of range"));
        }

        Ok(Self {
            total_price,
            item_number: req.item_number,
            description: req.description.trim().to_string(),
            quantity: req.quantity,
            unit: req.unit,
            unit_price: req.unit_price,
            notes: req.notes,
            category: req.category,
            sort_order,
            ..Default::default()
        })
    }
}

pub(super) async fn insert_line_item<'e, E>(executor: E, item: &NewLineItem) -> Result<LineItemRow, ApiError>
where
    E: sqlx::PgExecutor<'e>,
{
    Ok(sqlx::query_as::<_, LineItemRow>(&format!(
        r#"
        INSERT INTO line_items (bid_form_id, bid_package_id, item_number, description, quantity,
                                unit, unit_price, total_price, notes, category, sort_order)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING {}
        "#,
        LINE_ITEM_COLUMNS
    ))
    .bind(item.bid_form_id)
    .bind(item.bid_package_id)
    .bind(&item.item_number)
    .bind(&item.description)
    .bind(to_decimal(item.quantity))
    .bind(&item.unit)
    .bind(to_decimal(item.unit_price))
    .bind(to_decimal(item.total_price))
    .bind(&item.notes)
    .bind(&item.category)
    .bind(item.sort_order)
    .fetch_one(executor)
    .await?)
}

/// Apply a partial update. When quantity or unit price change without an
/// explicit total, the total is recomputed from the new values.
/// `package_id` restricts the update to items of that package.
pub(super) async fn apply_line_item_update(
    db: &PgPool,
    line_item_id: Uuid,
    package_id: Option<Uuid>,
    changes: &UpdateLineItemRequest,
) -> Result<LineItemRow, ApiError> {
    sqlx::query_as::<_, LineItemRow>(&format!(
        r#"
        UPDATE line_items SET
            item_number = COALESCE($2, item_number),
            description = COALESCE($3, description),
            quantity = COALESCE($4, quantity),
            unit = COALESCE($5, unit),
            unit_price = COALESCE($6, unit_price),
            total_price = CASE
                WHEN $7::numeric IS NOT NULL THEN $7::numeric
                WHEN $4::numeric IS NOT NULL OR $6::numeric IS NOT NULL
                    THEN COALESCE(COALESCE($4::numeric, quantity) * COALESCE($6::numeric, unit_price), total_price)
                ELSE total_price
            END,
            notes = COALESCE($8, notes),
            category = COALESCE($9, category),
            sort_order = COALESCE($10, sort_order),
            updated_at = NOW()
        WHERE id = $1 AND ($11::uuid IS NULL OR bid_package_id = $11::uuid) AND {}
        RETURNING {}
        "#,
        LIVE_ITEM_FILTER, LINE_ITEM_COLUMNS
    ))
    .bind(line_item_id)
    .bind(&changes.item_number)
    .bind(changes.description.as_deref().map(str::trim))
    .bind(to_decimal(changes.quantity))
    .bind(&changes.unit)
    .bind(to_decimal(changes.unit_price))
    .bind(to_decimal(changes.total_price))
    .bind(&changes.notes)
    .bind(&changes.category)
    .bind(changes.sort_order)
    .bind(package_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ApiError::not_found(format!("Line item {} not found", line_item_id)))
}

pub(super) async fn fetch_line_item(db: &PgPool, line_item_id: Uuid) -> Result<LineItemRow, ApiError> {
    sqlx::query_as::<_, LineItemRow>(&format!(
        "SELECT {} FROM line_items WHERE id = $1 AND {}",
        LINE_ITEM_COLUMNS, LIVE_ITEM_FILTER
    ))
    .bind(line_item_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| ApiError::not_found("Line item not found"))
}

pub(super) async fn line_item_counts(db: &PgPool, package_id: Uuid) -> Result<LineItemCounts, ApiError> {
    let (total, pending, approved, rejected): (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COUNT(*) FILTER (WHERE status = 'pending'),
               COUNT(*) FILTER (WHERE status = 'approved'),
               COUNT(*) FILTER (WHERE status = 'rejected')
        FROM line_items
        WHERE bid_package_id = $1
        "#,
    )
    .bind(package_id)
    .fetch_one(db)
    .await?;

    Ok(LineItemCounts {
        total,
        pending,
        approved,
        rejected,
    })
}

/// Recompute and store a package's approval progress
pub(super) async fn recalculate_progress(db: &PgPool, package_id: Uuid) -> Result<i32, ApiError> {
    let counts = line_item_counts(db, package_id).await?;
    let progress = progress_percent(counts.approved, counts.total);

    sqlx::query("UPDATE bid_packages SET progress = $2, updated_at = NOW() WHERE id = $1")
        .bind(package_id)
        .bind(progress)
        .execute(db)
        .await?;

    tracing::debug!(
        %package_id,
        approved = counts.approved,
        total = counts.total,
        progress,
        "Bid package progress recalculated"
    );

    Ok(progress)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/line-items/:line_item_id
pub async fn get_line_item(
    State(state): State<Arc<AppState>>,
    Path(line_item_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let item: LineItemResponse = fetch_line_item(&state.db, line_item_id).await?.into();
    Ok(DataResponse::new(item))
}

/// PATCH /api/line-items/:line_item_id
pub async fn update_line_item(
    State(state): State<Arc<AppState>>,
    Path(line_item_id): Path<Uuid>,
    auth: RequireAuth,
    ValidatedJson(req): ValidatedJson<UpdateLineItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;

    let row = apply_line_item_update(&state.db, line_item_id, None, &req).await?;
    if let Some(package_id) = row.bid_package_id {
        recalculate_progress(&state.db, package_id).await?;
    }

    let item: LineItemResponse = row.into();
    Ok(DataResponse::new(item))
}

/// DELETE /api/line-items/:line_item_id
pub async fn delete_line_item(
    State(state): State<Arc<AppState>>,
    Path(line_item_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;

    let package_id: Option<Uuid> =
        sqlx::query_scalar(&format!(
            "DELETE FROM line_items WHERE id = $1 AND {} RETURNING bid_package_id",
            LIVE_ITEM_FILTER
        ))
        .bind(line_item_id)
            .fetch_optional(&state.db)
            .await?
            .ok_or_else(|| ApiError::not_found("Line item not found"))?;

    if let Some(package_id) = package_id {
        recalculate_progress(&state.db, package_id).await?;
    }

    tracing::info!(%line_item_id, user_id = %auth.user_id, "Line item deleted");

    Ok(MessageResponse::with_code("Line item deleted", "LINE_ITEM_DELETED"))
}

/// POST /api/line-items/:line_item_id/review
///
/// Approve, reject or reset an item. Resetting clears the review record.
pub async fn review_line_item(
    State(state): State<Arc<AppState>>,
    Path(line_item_id): Path<Uuid>,
    auth: RequireAuth,
    Json(req): Json<ReviewLineItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_reviewer()?;

    let status = req.decision.resulting_status();
    let (reviewer, comment) = match req.decision {
        ReviewDecision::Reset => (None, None),
        ReviewDecision::Approve | ReviewDecision::Reject => (Some(auth.user_id), req.comment),
    };

    let row = sqlx::query_as::<_, LineItemRow>(&format!(
        r#"
        UPDATE line_items SET
            status = $2,
            reviewed_by = $3,
            reviewed_at = CASE WHEN $3::uuid IS NULL THEN NULL ELSE NOW() END,
            review_comment = $4,
            updated_at = NOW()
        WHERE id = $1 AND {}
        RETURNING {}
        "#,
        LIVE_ITEM_FILTER, LINE_ITEM_COLUMNS
    ))
    .bind(line_item_id)
    .bind(status.as_str())
    .bind(reviewer)
    .bind(&comment)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Line item not found"))?;

    if let Some(package_id) = row.bid_package_id {
        recalculate_progress(&state.db, package_id).await?;
    }

    tracing::info!(
        %line_item_id,
        reviewer_id = %auth.user_id,
        status = status.as_str(),
        "Line item reviewed"
    );

    let item: LineItemResponse = row.into();
    Ok(DataResponse::new(item))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimals_round_to_column_scale() {
        assert_eq!(to_decimal(Some(1.23456)).unwrap().to_string(), "1.2346");
        assert_eq!(to_decimal(Some(f64::NAN)), None);
        assert_eq!(to_decimal(None), None);
        assert_eq!(to_decimal(Some(1.0e15)), None);
        assert_eq!(to_decimal(Some(-1.0e14)), None);
        assert!(to_decimal(Some(99_999_999_999.5)).is_some());
        assert_eq!(from_decimal(Decimal::from_f64(12.5)), Some(12.5));
    }

    #[test]
    fn extracted_items_get_a_derived_total() {
        let extracted = ExtractedLineItem {
            description: "Drywall".into(),
            quantity: Some(100.0),
            unit_price: Some(2.5),
            ..Default::default()
        };
        let item = NewLineItem::from_extracted(&extracted, 3);
        assert_eq!(item.total_price, Some(250.0));
        assert_eq!(item.sort_order, 3);
        assert!(item.bid_form_id.is_none());
    }

    #[test]
    fn explicit_totals_win() {
        let req = CreateLineItemRequest {
            item_number: None,
            description: "  Mobilization ".into(),
            quantity: Some(1.0),
            unit: Some("LS".into()),
            unit_price: Some(5000.0),
            total_price: Some(4500.0),
            notes: None,
            category: None,
        };
        let item = NewLineItem::from_request(req, 0).unwrap();
        assert_eq!(item.total_price, Some(4500.0));
        assert_eq!(item.description, "Mobilization");
    }

    #[test]
    fn oversized_derived_totals_are_rejected() {
        let req = CreateLineItemRequest {
            item_number: None,
            description: "Earthwork".into(),
            quantity: Some(1.0e10),
            unit: Some("CY".into()),
            unit_price: Some(1.0e10),
            total_price: None,
            notes: None,
            category: None,
        };
        let err = NewLineItem::from_request(req, 0).unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn extracted_amounts_outside_the_column_are_dropped() {
        let extracted = ExtractedLineItem {
            description: "Misread quantity".into(),
            quantity: Some(1.0e12),
            unit_price: Some(1.0e6),
            ..Default::default()
        };
        let item = NewLineItem::from_extracted(&extracted, 0);
        assert!(to_decimal(item.quantity).is_some());
        assert_eq!(to_decimal(item.total_price), None);
    }

    #[test]
    fn item_queries_skip_deleted_projects() {
        assert!(LIVE_ITEM_FILTER.contains("p.deleted_at IS NULL"));
        assert!(LIVE_ITEM_FILTER.contains("line_items.bid_form_id"));
        assert!(LIVE_ITEM_FILTER.contains("line_items.bid_package_id"));
    }
}
