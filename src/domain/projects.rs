use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Project status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    OnHold,
    Awarded,
    Closed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::OnHold => "on_hold",
            ProjectStatus::Awarded => "awarded",
            ProjectStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "on_hold" => ProjectStatus::OnHold,
            "awarded" => ProjectStatus::Awarded,
            "closed" => ProjectStatus::Closed,
            _ => ProjectStatus::Active,
        }
    }
}

/// Request DTO for creating a project
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateProjectRequest {
    #[validate(length(min = 1, max = 200, message = "must be between 1 and 200 characters"))]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub bid_due_date: Option<DateTime<Utc>>,
}

/// Request DTO for updating a project
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 200, message = "must be between 1 and 200 characters"))]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub bid_due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectQuery {
    pub search: Option<String>,
    pub status: Option<ProjectStatus>,
}

/// Response DTO for project
#[derive(Debug, Clone, Serialize)]
pub struct ProjectResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub client_name: Option<String>,
    pub bid_due_date: Option<DateTime<Utc>>,
    pub status: ProjectStatus,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Project with rollup counts
#[derive(Debug, Clone, Serialize)]
pub struct ProjectDetailResponse {
    #[serde(flatten)]
    pub project: ProjectResponse,
    pub diagram_count: i64,
    pub bid_package_count: i64,
    pub line_item_count: i64,
    pub approved_line_item_count: i64,
    /// Approved/total ratio across all packages of the project
    pub progress: i32,
}
