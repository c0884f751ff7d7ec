use axum::{extract::State, response::IntoResponse};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::bid_packages::BidPackageRow;
use crate::api::DataResponse;
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::bid_packages::{AssignmentRole, MyAssignmentResponse};
use crate::error::ApiError;

#[derive(Debug, sqlx::FromRow)]
struct MyAssignmentRow {
    #[sqlx(flatten)]
    package: BidPackageRow,
    assignment_role: String,
    assigned_at: DateTime<Utc>,
}

/// GET /api/me/assignments
///
/// Packages the caller is assigned to, soonest due first.
pub async fn my_assignments(
    State(state): State<Arc<AppState>>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let rows = sqlx::query_as::<_, MyAssignmentRow>(
        r#"
        SELECT p.id, p.project_id, p.name, p.description, p.trade, p.status, p.due_date,
               p.progress, p.created_by, p.created_at, p.updated_at,
               a.assignment_role, a.created_at AS assigned_at
        FROM user_assignments a
        JOIN bid_packages p ON p.id = a.bid_package_id
        JOIN projects pr ON pr.id = p.project_id AND pr.deleted_at IS NULL
        WHERE a.user_id = $1
        ORDER BY p.due_date ASC NULLS LAST, a.created_at DESC
        "#,
    )
    .bind(auth.user_id)
    .fetch_all(&state.db)
    .await?;

    let data: Vec<MyAssignmentResponse> = rows
        .into_iter()
        .map(|row| MyAssignmentResponse {
            package: row.package.into(),
            assignment_role: AssignmentRole::parse(&row.assignment_role),
            assigned_at: row.assigned_at,
        })
        .collect();

    Ok(DataResponse::new(data))
}
