use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

use crate::entities::line_item::DeliveryState;
use crate::entities::process_instance::InstanceStatus;
use crate::entities::Stage;

/// One line of an advancement: how much of a line item leaves the source stage.
#[derive(Debug, Clone, Deserialize, Validate, Serialize)]
pub struct AdvanceItem {
    #[validate(range(min = 1))]
    pub line_item_id: i32,
    #[validate(range(min = 1))]
    pub quantity: i32,
    /// Manufacturer that takes the quantity; also the preferred source key.
    pub manufacturer_id: Option<i32>,
    /// Pins the source to one specific allocation row.
    pub allocation_id: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InvoiceData {
    pub number: String,
    /// Reference to the previously uploaded proof-of-invoice document.
    pub document_url: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, Serialize)]
pub struct AdvanceRequest {
    #[validate(range(min = 1))]
    pub order_id: i32,
    pub source_stage: Stage,
    pub destination_stage: Option<Stage>,
    #[validate(length(min = 1, max = 100))]
    pub employee_id: String,
    #[validate]
    pub items: Vec<AdvanceItem>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Per line item destination, required when the source stage bifurcates.
    #[serde(default)]
    pub bifurcation: Option<HashMap<i32, Stage>>,
    #[serde(default)]
    pub invoice: Option<InvoiceData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    pub source_instance_id: i32,
    /// Destination instances in first-use order, one per distinct target stage.
    pub destination_instance_ids: Vec<i32>,
    pub invoice_id: Option<i32>,
    pub source_closed: bool,
    pub participation_recorded: bool,
}

#[derive(Debug, Clone, Deserialize, Validate, Serialize)]
pub struct CompleteOrderRequest {
    #[validate(range(min = 1))]
    pub order_id: i32,
    #[serde(default = "default_delivery_stage")]
    pub delivery_stage: Stage,
    #[validate(length(min = 1, max = 100))]
    pub employee_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_delivery_stage() -> Stage {
    Stage::Delivery
}

#[derive(Debug, Clone, Deserialize, Validate, Serialize)]
pub struct NewLineItem {
    #[validate(range(min = 1))]
    pub product_id: i32,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Validate, Serialize)]
pub struct NewOrder {
    #[validate(length(min = 1, max = 100))]
    pub responsible_employee: String,
    #[validate(length(min = 1, max = 50))]
    pub payment_type: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[validate]
    pub line_items: Vec<NewLineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedOrder {
    pub order_id: i32,
    pub intake_instance_id: i32,
    pub line_item_ids: Vec<i32>,
}

/// Frozen JSON body of an employee participation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationSnapshot {
    pub source_stage: String,
    pub employee_id: String,
    pub items: Vec<SnapshotItem>,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub line_item_id: i32,
    pub product_name: String,
    pub quantity: i32,
    pub destination_stage: String,
    pub manufacturer_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipationView {
    pub employee_id: String,
    pub recorded_at: DateTime<Utc>,
    /// Decoded snapshot; records that fail to decode are returned as a raw string.
    pub snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageHistoryEntry {
    pub process_instance_id: i32,
    pub stage: Stage,
    pub stage_name: String,
    pub status: InstanceStatus,
    pub responsible_employee: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub participations: Vec<ParticipationView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    InstanceOpened,
    InstanceCompleted,
    InstanceCancelled,
    Participation,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub at: DateTime<Utc>,
    pub kind: AuditEventKind,
    pub process_instance_id: i32,
    pub stage: Stage,
    pub stage_name: String,
    pub employee_id: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageQuantity {
    pub stage: Stage,
    pub stage_name: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineItemView {
    pub line_item_id: i32,
    pub product_id: i32,
    pub product_name: String,
    pub total_quantity: i32,
    pub delivered_quantity: i32,
    pub delivery_state: DeliveryState,
    pub distribution: Vec<StageQuantity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageItemView {
    pub allocation_id: i32,
    pub line_item_id: i32,
    pub product_name: String,
    pub quantity: i32,
    pub manufacturer_id: Option<i32>,
    pub manufacturer_name: Option<String>,
    pub quantity_cut: i32,
    pub received_at: Option<NaiveDate>,
    pub delivered_at: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerSummary {
    pub id: i32,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(items: Vec<AdvanceItem>) -> AdvanceRequest {
        AdvanceRequest {
            order_id: 1,
            source_stage: Stage::Cutting,
            destination_stage: Some(Stage::Confection),
            employee_id: "emp1".into(),
            items,
            notes: None,
            bifurcation: None,
            invoice: None,
        }
    }

    #[test]
    fn non_positive_quantities_fail_validation() {
        let bad = request(vec![AdvanceItem {
            line_item_id: 3,
            quantity: 0,
            manufacturer_id: None,
            allocation_id: None,
        }]);
        assert!(bad.validate().is_err());

        let good = request(vec![AdvanceItem {
            line_item_id: 3,
            quantity: 4,
            manufacturer_id: Some(7),
            allocation_id: None,
        }]);
        assert!(good.validate().is_ok());
    }

    #[test]
    fn advance_request_deserializes_bifurcation_map() {
        let json = r#"{
            "order_id": 5,
            "source_stage": "confection",
            "destination_stage": null,
            "employee_id": "emp2",
            "items": [{"line_item_id": 1, "quantity": 2, "manufacturer_id": null, "allocation_id": null}],
            "bifurcation": {"1": "embroidery"}
        }"#;
        let parsed: AdvanceRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed.bifurcation.unwrap().get(&1),
            Some(&Stage::Embroidery)
        );
        assert!(parsed.invoice.is_none());
    }

    #[test]
    fn completion_defaults_to_delivery_stage() {
        let parsed: CompleteOrderRequest =
            serde_json::from_str(r#"{"order_id": 2, "employee_id": "emp1"}"#).unwrap();
        assert_eq!(parsed.delivery_stage, Stage::Delivery);
    }
}
