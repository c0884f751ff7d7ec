use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::users::Role;

/// Bid package workflow status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BidPackageStatus {
    #[default]
    Draft,
    Assigned,
    InProgress,
    Review,
    Completed,
}

impl BidPackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidPackageStatus::Draft => "draft",
            BidPackageStatus::Assigned => "assigned",
            BidPackageStatus::InProgress => "in_progress",
            BidPackageStatus::Review => "review",
            BidPackageStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assigned" => BidPackageStatus::Assigned,
            "in_progress" => BidPackageStatus::InProgress,
            "review" => BidPackageStatus::Review,
            "completed" => BidPackageStatus::Completed,
            _ => BidPackageStatus::Draft,
        }
    }

    /// Legal workflow edges
    pub fn can_transition_to(&self, next: BidPackageStatus) -> bool {
        use BidPackageStatus::*;
        matches!(
            (self, next),
            (Draft, Assigned)
                | (Assigned, Draft)
                | (Assigned, InProgress)
                | (InProgress, Review)
                | (Review, InProgress)
                | (Review, Completed)
        )
    }

    /// Whether `role` may perform the edge into `next`. Estimators need to be
    /// assigned to the package and cannot complete or un-assign it.
    pub fn role_may_enter(next: BidPackageStatus, role: Role, is_assignee: bool) -> bool {
        if role.can_manage_packages() {
            return true;
        }
        match next {
            BidPackageStatus::InProgress | BidPackageStatus::Review => {
                is_assignee && (role.can_edit_line_items() || role.can_review())
            }
            _ => false,
        }
    }
}

/// Line-item preconditions for entering `next`: review needs at least one
/// item, completion needs every item approved.
pub fn check_entry_requirements(
    next: BidPackageStatus,
    counts: &LineItemCounts,
) -> Result<(), &'static str> {
    match next {
        BidPackageStatus::Review if counts.total == 0 => {
            Err("A bid package needs at least one line item before review")
        }
        BidPackageStatus::Completed if counts.total == 0 || counts.approved < counts.total => {
            Err("Every line item must be approved before the bid package is completed")
        }
        _ => Ok(()),
    }
}

impl std::fmt::Display for BidPackageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rounded percentage of approved line items; an empty package is 0%.
pub fn progress_percent(approved: i64, total: i64) -> i32 {
    if total <= 0 {
        return 0;
    }
    let approved = approved.clamp(0, total);
    ((approved as f64 * 100.0) / total as f64).round() as i32
}

/// Role a user holds on a specific package
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentRole {
    #[default]
    Estimator,
    Reviewer,
}

impl AssignmentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentRole::Estimator => "estimator",
            AssignmentRole::Reviewer => "reviewer",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "reviewer" => AssignmentRole::Reviewer,
            _ => AssignmentRole::Estimator,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBidPackageRequest {
    #[validate(length(min = 1, max = 200, message = "must be between 1 and 200 characters"))]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trade: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateBidPackageRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 200, message = "must be between 1 and 200 characters"))]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trade: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionRequest {
    pub status: BidPackageStatus,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BidPackageQuery {
    pub status: Option<BidPackageStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignUserRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub assignment_role: AssignmentRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct BidPackageResponse {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trade: Option<String>,
    pub status: BidPackageStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub progress: i32,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentResponse {
    pub id: Uuid,
    pub bid_package_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub full_name: Option<String>,
    pub assignment_role: AssignmentRole,
    pub assigned_by: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Line-item tallies of a package
#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
pub struct LineItemCounts {
    pub total: i64,
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
}

/// A package the caller is assigned to
#[derive(Debug, Clone, Serialize)]
pub struct MyAssignmentResponse {
    #[serde(flatten)]
    pub package: BidPackageResponse,
    pub assignment_role: AssignmentRole,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BidPackageDetailResponse {
    #[serde(flatten)]
    pub package: BidPackageResponse,
    pub assignments: Vec<AssignmentResponse>,
    pub line_item_counts: LineItemCounts,
}

#[cfg(test)]
mod tests {
    use super::*;
    use BidPackageStatus::*;

    #[test]
    fn forward_workflow_is_allowed() {
        assert!(Draft.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Review));
        assert!(Review.can_transition_to(Completed));
    }

    #[test]
    fn send_back_edges_are_allowed() {
        assert!(Review.can_transition_to(InProgress));
        assert!(Assigned.can_transition_to(Draft));
    }

    #[test]
    fn skipping_and_reopening_are_rejected() {
        assert!(!Draft.can_transition_to(InProgress));
        assert!(!Draft.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Review));
        assert!(!Completed.can_transition_to(Draft));
        assert!(!Review.can_transition_to(Review));
    }

    #[test]
    fn only_managers_complete_packages() {
        assert!(BidPackageStatus::role_may_enter(Completed, Role::Manager, false));
        assert!(BidPackageStatus::role_may_enter(Completed, Role::Admin, false));
        assert!(!BidPackageStatus::role_may_enter(Completed, Role::Estimator, true));
        assert!(!BidPackageStatus::role_may_enter(Completed, Role::Reviewer, true));
    }

    #[test]
    fn assignees_move_work_along() {
        assert!(BidPackageStatus::role_may_enter(InProgress, Role::Estimator, true));
        assert!(BidPackageStatus::role_may_enter(Review, Role::Estimator, true));
        assert!(BidPackageStatus::role_may_enter(InProgress, Role::Reviewer, true));
        assert!(!BidPackageStatus::role_may_enter(Review, Role::Estimator, false));
        assert!(!BidPackageStatus::role_may_enter(Review, Role::Viewer, true));
        assert!(!BidPackageStatus::role_may_enter(Draft, Role::Estimator, true));
    }

    #[test]
    fn review_and_completion_preconditions() {
        let empty = LineItemCounts::default();
        let partly = LineItemCounts {
            total: 3,
            pending: 1,
            approved: 2,
            rejected: 0,
        };
        let done = LineItemCounts {
            total: 3,
            pending: 0,
            approved: 3,
            rejected: 0,
        };

        assert!(check_entry_requirements(Review, &empty).is_err());
        assert!(check_entry_requirements(Review, &partly).is_ok());
        assert!(check_entry_requirements(Completed, &empty).is_err());
        assert!(check_entry_requirements(Completed, &partly).is_err());
        assert!(check_entry_requirements(Completed, &done).is_ok());
        assert!(check_entry_requirements(InProgress, &empty).is_ok());
    }

    #[test]
    fn progress_is_rounded_ratio() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(0, 5), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(5, 5), 100);
        assert_eq!(progress_percent(7, 5), 100);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&InProgress).unwrap(),
            "\"in_progress\""
        );
        for status in [Draft, Assigned, InProgress, Review, Completed] {
            assert_eq!(BidPackageStatus::parse(status.as_str()), status);
        }
    }
}
