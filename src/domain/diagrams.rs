use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing state of an uploaded diagram
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiagramStatus {
    #[default]
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl DiagramStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagramStatus::Uploaded => "uploaded",
            DiagramStatus::Processing => "processing",
            DiagramStatus::Processed => "processed",
            DiagramStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => DiagramStatus::Processing,
            "processed" => DiagramStatus::Processed,
            "failed" => DiagramStatus::Failed,
            _ => DiagramStatus::Uploaded,
        }
    }
}

/// Drawing discipline assigned by the categorization pass
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagramCategory {
    FloorPlan,
    SitePlan,
    Elevation,
    Section,
    Detail,
    Electrical,
    Plumbing,
    Mechanical,
    Structural,
    Specification,
    Schedule,
    Other,
}

impl DiagramCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagramCategory::FloorPlan => "floor_plan",
            DiagramCategory::SitePlan => "site_plan",
            DiagramCategory::Elevation => "elevation",
            DiagramCategory::Section => "section",
            DiagramCategory::Detail => "detail",
            DiagramCategory::Electrical => "electrical",
            DiagramCategory::Plumbing => "plumbing",
            DiagramCategory::Mechanical => "mechanical",
            DiagramCategory::Structural => "structural",
            DiagramCategory::Specification => "specification",
            DiagramCategory::Schedule => "schedule",
            DiagramCategory::Other => "other",
        }
    }

    /// Lenient parse of model output: case, spaces and hyphens are ignored,
    /// unknown labels become `Other`.
    pub fn parse_lenient(s: &str) -> Self {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "floor_plan" | "floorplan" => DiagramCategory::FloorPlan,
            "site_plan" | "siteplan" => DiagramCategory::SitePlan,
            "elevation" => DiagramCategory::Elevation,
            "section" => DiagramCategory::Section,
            "detail" => DiagramCategory::Detail,
            "electrical" => DiagramCategory::Electrical,
            "plumbing" => DiagramCategory::Plumbing,
            "mechanical" | "hvac" => DiagramCategory::Mechanical,
            "structural" => DiagramCategory::Structural,
            "specification" | "spec" | "specs" => DiagramCategory::Specification,
            "schedule" => DiagramCategory::Schedule,
            _ => DiagramCategory::Other,
        }
    }
}

/// Media types the vision model accepts
pub const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "application/pdf",
];

/// Media type from a file name's extension, `None` when the extension is unknown
pub fn media_type_from_extension(filename: &str) -> Option<&'static str> {
    let lower = filename.to_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, ext)| ext)?;
    match ext {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

/// Media type sent to the vision model; unknown extensions are treated as JPEG.
pub fn media_type_for_filename(filename: &str) -> &'static str {
    media_type_from_extension(filename).unwrap_or("image/jpeg")
}

/// Resolve the media type of an upload. The extension wins, the part's
/// declared content type is the fallback. Returns `None` for unsupported files.
pub fn resolve_upload_media_type(
    filename: &str,
    declared: Option<&str>,
) -> Option<&'static str> {
    media_type_from_extension(filename).or_else(|| {
        let declared = declared?.split(';').next()?.trim().to_lowercase();
        ACCEPTED_MEDIA_TYPES
            .iter()
            .copied()
            .find(|accepted| *accepted == declared)
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagramResponse {
    pub id: Uuid,
    pub project_id: Uuid,
    pub uploaded_by: Uuid,
    pub original_name: String,
    pub description: Option<String>,
    pub mime_type: String,
    pub file_size: i64,
    pub content_hash: String,
    pub category: Option<DiagramCategory>,
    pub category_confidence: Option<f64>,
    pub category_summary: Option<String>,
    pub status: DiagramStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upload result; `duplicate` is set when identical bytes already existed
#[derive(Debug, Clone, Serialize)]
pub struct DiagramUploadResponse {
    #[serde(flatten)]
    pub diagram: DiagramResponse,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiagramQuery {
    pub category: Option<DiagramCategory>,
    pub status: Option<DiagramStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_detection_by_extension() {
        assert_eq!(media_type_for_filename("plan.PNG"), "image/png");
        assert_eq!(media_type_for_filename("plan.jpg"), "image/jpeg");
        assert_eq!(media_type_for_filename("plan.jpeg"), "image/jpeg");
        assert_eq!(media_type_for_filename("plan.webp"), "image/webp");
        assert_eq!(media_type_for_filename("plan.gif"), "image/gif");
        assert_eq!(media_type_for_filename("specs.pdf"), "application/pdf");
        assert_eq!(media_type_for_filename("scan.tiff"), "image/jpeg");
        assert_eq!(media_type_for_filename("no_extension"), "image/jpeg");
    }

    #[test]
    fn upload_media_type_falls_back_to_declared_type() {
        assert_eq!(
            resolve_upload_media_type("blob", Some("image/png")),
            Some("image/png")
        );
        assert_eq!(
            resolve_upload_media_type("blob", Some("application/pdf; charset=binary")),
            Some("application/pdf")
        );
        assert_eq!(
            resolve_upload_media_type("drawing.gif", Some("text/plain")),
            Some("image/gif")
        );
        assert_eq!(resolve_upload_media_type("notes.txt", Some("text/plain")), None);
        assert_eq!(resolve_upload_media_type("notes.txt", None), None);
    }

    #[test]
    fn category_parsing_is_lenient() {
        assert_eq!(
            DiagramCategory::parse_lenient("Floor Plan"),
            DiagramCategory::FloorPlan
        );
        assert_eq!(
            DiagramCategory::parse_lenient("site-plan"),
            DiagramCategory::SitePlan
        );
        assert_eq!(
            DiagramCategory::parse_lenient("HVAC"),
            DiagramCategory::Mechanical
        );
        assert_eq!(
            DiagramCategory::parse_lenient("landscape"),
            DiagramCategory::Other
        );
    }
}
