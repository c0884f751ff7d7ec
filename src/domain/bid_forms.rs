use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extraction::{Confidence, ExtractionMode};
use super::line_items::LineItemResponse;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BidFormStatus {
    #[default]
    Extracted,
    Verified,
}

impl BidFormStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "verified" => BidFormStatus::Verified,
            _ => BidFormStatus::Extracted,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BidFormResponse {
    pub id: Uuid,
    pub project_id: Uuid,
    pub diagram_id: Option<Uuid>,
    pub bid_package_id: Option<Uuid>,
    pub project_name: Option<String>,
    pub extraction_mode: ExtractionMode,
    pub extraction_confidence: Confidence,
    pub status: BidFormStatus,
    pub comments: Option<String>,
    pub created_by: Uuid,
    pub verified_by: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BidFormDetailResponse {
    #[serde(flatten)]
    pub form: BidFormResponse,
    pub raw_text: Option<String>,
    pub line_items: Vec<LineItemResponse>,
}

/// Approve the listed line items of a form and mark it verified
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationRequest {
    pub verified_items: Vec<Uuid>,
    #[serde(default)]
    pub comments: Option<String>,
}
