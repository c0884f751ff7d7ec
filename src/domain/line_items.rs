use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Amounts must stay strictly below this magnitude to fit NUMERIC(18,4)
pub const MAX_AMOUNT: f64 = 100_000_000_000_000.0;

/// Whether `value` fits a stored amount column
pub fn amount_in_range(value: f64) -> bool {
    value.is_finite() && value.abs() < MAX_AMOUNT
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some(Cow::Borrowed("must not be blank"));
        return Err(err);
    }
    Ok(())
}

/// Review state of a line item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LineItemStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl LineItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemStatus::Pending => "pending",
            LineItemStatus::Approved => "approved",
            LineItemStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => LineItemStatus::Approved,
            "rejected" => LineItemStatus::Rejected,
            _ => LineItemStatus::Pending,
        }
    }
}

/// Reviewer decision on a line item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    Reset,
}

impl ReviewDecision {
    pub fn resulting_status(&self) -> LineItemStatus {
        match self {
            ReviewDecision::Approve => LineItemStatus::Approved,
            ReviewDecision::Reject => LineItemStatus::Rejected,
            ReviewDecision::Reset => LineItemStatus::Pending,
        }
    }
}

/// Total price when the caller did not give one
pub fn derive_total(
    quantity: Option<f64>,
    unit_price: Option<f64>,
    total_price: Option<f64>,
) -> Option<f64> {
    total_price.or_else(|| quantity.zip(unit_price).map(|(q, p)| q * p))
}

#[derive(Debug, Clone, Serialize)]
pub struct LineItemResponse {
    pub id: Uuid,
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
    pub status: LineItemStatus,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_comment: Option<String>,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateLineItemRequest {
    #[serde(default)]
    pub item_number: Option<String>,
    #[validate(custom(function = "not_blank"))]
    pub description: String,
    #[serde(default)]
    #[validate(range(
        exclusive_min = -100_000_000_000_000.0,
        exclusive_max = 100_000_000_000_000.0,
        message = "is out of range"
    ))]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    #[validate(range(
        exclusive_min = -100_000_000_000_000.0,
        exclusive_max = 100_000_000_000_000.0,
        message = "is out of range"
    ))]
    pub unit_price: Option<f64>,
    #[serde(default)]
    #[validate(range(
        exclusive_min = -100_000_000_000_000.0,
        exclusive_max = 100_000_000_000_000.0,
        message = "is out of range"
    ))]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateLineItemRequest {
    #[serde(default)]
    pub item_number: Option<String>,
    #[serde(default)]
    #[validate(custom(function = "not_blank"))]
    pub description: Option<String>,
    #[serde(default)]
    #[validate(range(
        exclusive_min = -100_000_000_000_000.0,
        exclusive_max = 100_000_000_000_000.0,
        message = "is out of range"
    ))]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    #[validate(range(
        exclusive_min = -100_000_000_000_000.0,
        exclusive_max = 100_000_000_000_000.0,
        message = "is out of range"
    ))]
    pub unit_price: Option<f64>,
    #[serde(default)]
    #[validate(range(
        exclusive_min = -100_000_000_000_000.0,
        exclusive_max = 100_000_000_000_000.0,
        message = "is out of range"
    ))]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i32>,
}

/// One row of a bulk update
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BulkLineItemUpdate {
    pub id: Uuid,
    #[serde(flatten)]
    #[validate(nested)]
    pub changes: UpdateLineItemRequest,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BulkUpdateLineItemsRequest {
    #[validate(length(min = 1, max = 500, message = "must contain between 1 and 500 items"), nested)]
    pub items: Vec<BulkLineItemUpdate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachLineItemsRequest {
    pub line_item_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewLineItemRequest {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineItemQuery {
    pub status: Option<LineItemStatus>,
    pub category: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_derived_only_when_missing() {
        assert_eq!(derive_total(Some(4.0), Some(2.5), None), Some(10.0));
        assert_eq!(derive_total(Some(4.0), Some(2.5), Some(11.0)), Some(11.0));
        assert_eq!(derive_total(None, Some(2.5), None), None);
        assert_eq!(derive_total(Some(4.0), None, None), None);
    }

    #[test]
    fn review_decisions_map_to_statuses() {
        assert_eq!(
            ReviewDecision::Approve.resulting_status(),
            LineItemStatus::Approved
        );
        assert_eq!(
            ReviewDecision::Reject.resulting_status(),
            LineItemStatus::Rejected
        );
        assert_eq!(
            ReviewDecision::Reset.resulting_status(),
            LineItemStatus::Pending
        );
    }

    #[test]
    fn blank_descriptions_are_rejected() {
        let create: CreateLineItemRequest =
            serde_json::from_value(serde_json::json!({ "description": "   " })).unwrap();
        assert!(create.validate().is_err());

        let create: CreateLineItemRequest =
            serde_json::from_value(serde_json::json!({ "description": " Rebar #4 " })).unwrap();
        assert!(create.validate().is_ok());

        let update = UpdateLineItemRequest {
            description: Some("\t \n".into()),
            ..Default::default()
        };
        assert!(update.validate().is_err());

        let untouched = UpdateLineItemRequest::default();
        assert!(untouched.validate().is_ok());
    }

    #[test]
    fn amounts_must_fit_the_numeric_column() {
        let huge: CreateLineItemRequest = serde_json::from_value(serde_json::json!({
            "description": "Site work",
            "quantity": 1.0e14
        }))
        .unwrap();
        assert!(huge.validate().is_err());

        let update = UpdateLineItemRequest {
            unit_price: Some(-2.0e15),
            ..Default::default()
        };
        assert!(update.validate().is_err());

        let fine = UpdateLineItemRequest {
            total_price: Some(99_999_999_999_999.0),
            ..Default::default()
        };
        assert!(fine.validate().is_ok());

        assert!(amount_in_range(12.5));
        assert!(!amount_in_range(MAX_AMOUNT));
        assert!(!amount_in_range(f64::NAN));
        assert!(!amount_in_range(f64::INFINITY));
    }

    #[test]
    fn bulk_update_rejects_empty_description() {
        let req: BulkUpdateLineItemsRequest = serde_json::from_value(serde_json::json!({
            "items": [{ "id": Uuid::new_v4(), "description": "" }]
        }))
        .unwrap();
        assert!(req.validate().is_err());

        let blank: BulkUpdateLineItemsRequest = serde_json::from_value(serde_json::json!({
            "items": [{ "id": Uuid::new_v4(), "description": "  " }]
        }))
        .unwrap();
        assert!(blank.validate().is_err());

        let empty: BulkUpdateLineItemsRequest =
            serde_json::from_value(serde_json::json!({ "items": [] })).unwrap();
        assert!(empty.validate().is_err());
    }
}
