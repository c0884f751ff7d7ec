//! Extraction domain types
//!
//! Line items as the vision model reports them, extraction results, and the
//! background job records the UI polls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::diagrams::{DiagramCategory, DiagramResponse};

/// Model-reported confidence in an extraction
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    /// Unknown values normalize to `Low`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|s| Confidence::parse(&s)).unwrap_or_default())
    }
}

/// Extraction pipeline variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Single pass over the whole drawing
    #[default]
    Standard,
    /// Overview pass followed by one focused pass per section
    Comprehensive,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMode::Standard => "standard",
            ExtractionMode::Comprehensive => "comprehensive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "comprehensive" => ExtractionMode::Comprehensive,
            _ => ExtractionMode::Standard,
        }
    }
}

/// Numbers sometimes come back as strings ("1,200") or with units attached.
fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    })
}

/// Item numbers are sometimes emitted as bare numbers
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A line item as parsed from the model's response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedLineItem {
    #[serde(default, deserialize_with = "lenient_string")]
    pub item_number: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub quantity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub unit: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub unit_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub total_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub notes: Option<String>,
    /// Section or trade the item was found under (comprehensive mode)
    #[serde(default, deserialize_with = "lenient_string")]
    pub category: Option<String>,
}

impl ExtractedLineItem {
    /// Key used to detect the same item reported by two passes
    pub fn dedup_key(&self) -> (String, String) {
        let normalize = |s: &str| {
            s.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        };
        (
            normalize(self.item_number.as_deref().unwrap_or("")),
            normalize(&self.description),
        )
    }

    /// Fill fields missing here from another report of the same item
    pub fn fill_missing_from(&mut self, other: &ExtractedLineItem) {
        fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(other);
            }
        }
        fill(&mut self.item_number, &other.item_number);
        fill(&mut self.quantity, &other.quantity);
        fill(&mut self.unit, &other.unit);
        fill(&mut self.unit_price, &other.unit_price);
        fill(&mut self.total_price, &other.total_price);
        fill(&mut self.notes, &other.notes);
        fill(&mut self.category, &other.category);
    }
}

/// Parsed extraction output for one drawing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractionResult {
    #[serde(default, deserialize_with = "lenient_string")]
    pub project_name: Option<String>,
    #[serde(default)]
    pub line_items: Vec<ExtractedLineItem>,
    #[serde(default)]
    pub extraction_confidence: Confidence,
    #[serde(default)]
    pub raw_text: Option<String>,
}

/// Result of the categorization prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorizationResult {
    pub category: DiagramCategory,
    pub confidence: f64,
    pub summary: Option<String>,
    pub trades: Vec<String>,
}

/// Categorized diagram together with what the model reported
#[derive(Debug, Clone, Serialize)]
pub struct CategorizeResponse {
    pub diagram: DiagramResponse,
    pub categorization: CategorizationResult,
}

/// Query of the stateless extraction endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractBidQuery {
    /// `standard` or `comprehensive`; anything else runs standard
    #[serde(default)]
    pub mode: Option<String>,
}

/// Body of the extraction endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractRequest {
    #[serde(default)]
    pub mode: ExtractionMode,
    /// Attach the extracted line items to this bid package
    #[serde(default)]
    pub bid_package_id: Option<Uuid>,
}

/// Background extraction job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Snapshot of a background extraction job
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub diagram_id: Uuid,
    pub project_id: Uuid,
    pub requested_by: Uuid,
    pub mode: ExtractionMode,
    pub status: JobStatus,
    /// 0-100
    pub progress: u8,
    pub stage: String,
    pub bid_form_id: Option<Uuid>,
    pub line_item_count: Option<usize>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_normalizes_unknown_values() {
        assert_eq!(Confidence::parse("HIGH"), Confidence::High);
        assert_eq!(Confidence::parse(" medium "), Confidence::Medium);
        assert_eq!(Confidence::parse("very high"), Confidence::Low);

        let parsed: ExtractionResult =
            serde_json::from_str(r#"{"line_items": [], "extraction_confidence": null}"#).unwrap();
        assert_eq!(parsed.extraction_confidence, Confidence::Low);
    }

    #[test]
    fn confidence_orders_low_to_high() {
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
    }

    #[test]
    fn line_items_accept_loose_numbers() {
        let item: ExtractedLineItem = serde_json::from_str(
            r#"{"item_number": 3, "description": "Concrete slab", "quantity": "1,200",
                "unit": "SF", "unit_price": "$4.50", "total_price": null}"#,
        )
        .unwrap();
        assert_eq!(item.item_number.as_deref(), Some("3"));
        assert_eq!(item.quantity, Some(1200.0));
        assert_eq!(item.unit_price, Some(4.5));
        assert_eq!(item.total_price, None);
    }

    #[test]
    fn dedup_key_ignores_case_and_spacing() {
        let a = ExtractedLineItem {
            item_number: Some("A-1".into()),
            description: "Install  GWB   partitions".into(),
            ..Default::default()
        };
        let b = ExtractedLineItem {
            item_number: Some("a-1".into()),
            description: "install gwb partitions".into(),
            ..Default::default()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn fill_missing_keeps_existing_values() {
        let mut first = ExtractedLineItem {
            description: "Paint".into(),
            quantity: Some(10.0),
            ..Default::default()
        };
        let second = ExtractedLineItem {
            description: "Paint".into(),
            quantity: Some(99.0),
            unit: Some("GAL".into()),
            ..Default::default()
        };
        first.fill_missing_from(&second);
        assert_eq!(first.quantity, Some(10.0));
        assert_eq!(first.unit.as_deref(), Some("GAL"));
    }
}
