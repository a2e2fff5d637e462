use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::{Grn, GrnLine, InventoryBatch, ParsedInvoice, ParsedInvoiceLine};

/// 领域事件类型
pub mod event_types {
    pub const INVOICE_PARSED: &str = "invoice.parsed";
    pub const INVOICE_PARSE_FAILED: &str = "invoice.parse_failed";
    pub const INVOICE_LINE_RESOLVED: &str = "invoice.line.resolved";
    pub const RECEIPT_DRAFTED: &str = "purchase.receipt.drafted";
    pub const RECEIPT_CREATED: &str = "purchase.receipt.created";
    pub const RECEIPT_POSTED: &str = "purchase.receipt.posted";
    pub const INVENTORY_BATCHES_UPDATED: &str = "inventory.batches.updated";
}

/// 已落库的 outbox 事件
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub seq: i64,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// 与业务写入同一事务写入的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_type: &'static str,
    pub aggregate_id: Uuid,
    pub event_type: &'static str,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: &'static str,
        aggregate_id: Uuid,
        event_type: &'static str,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type,
            aggregate_id,
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn invoice_parsed(invoice: &ParsedInvoice, lines: &[ParsedInvoiceLine]) -> Self {
        let matched = lines.iter().filter(|l| l.matched_product_id.is_some()).count();
        Self::new(
            "parsed_invoice",
            invoice.id,
            event_types::INVOICE_PARSED,
            json!({
                "parsed_invoice_id": invoice.id,
                "vendor_id": invoice.vendor_id,
                "shop_id": invoice.shop_id,
                "line_count": lines.len(),
                "auto_matched": matched,
            }),
        )
    }

    pub fn invoice_parse_failed(invoice_id: Uuid, error: &str) -> Self {
        Self::new(
            "parsed_invoice",
            invoice_id,
            event_types::INVOICE_PARSE_FAILED,
            json!({ "parsed_invoice_id": invoice_id, "error": error }),
        )
    }

    pub fn line_resolved(
        invoice_id: Uuid,
        line_id: Uuid,
        action: &str,
        product_id: Option<Uuid>,
    ) -> Self {
        Self::new(
            "parsed_invoice",
            invoice_id,
            event_types::INVOICE_LINE_RESOLVED,
            json!({
                "parsed_invoice_id": invoice_id,
                "line_id": line_id,
                "action": action,
                "product_id": product_id,
            }),
        )
    }

    pub fn receipt_event(event_type: &'static str, grn: &Grn, lines: &[GrnLine]) -> Self {
        let lines: Vec<Value> = lines
            .iter()
            .filter(|l| !l.excluded)
            .map(|l| {
                json!({
                    "product_id": l.product_id,
                    "batch_no": l.batch_no,
                    "expiry_date": l.expiry_date,
                    "qty": l.qty,
                    "landed_unit_cost": l.landed_unit_cost,
                })
            })
            .collect();
        Self::new(
            "purchase_receipt",
            grn.id,
            event_type,
            json!({
                "receipt_id": grn.id,
                "receipt_number": grn.receipt_number,
                "parsed_invoice_id": grn.parsed_invoice_id,
                "vendor_id": grn.vendor_id,
                "shop_id": grn.shop_id,
                "grand_total": grn.grand_total,
                "lines": lines,
            }),
        )
    }

    pub fn batches_updated(request_id: Uuid, idempotency_key: &str, batches: &[InventoryBatch]) -> Self {
        Self::new(
            "inventory_update",
            request_id,
            event_types::INVENTORY_BATCHES_UPDATED,
            json!({
                "idempotency_key": idempotency_key,
                "batches": batches.iter().map(|b| json!({
                    "batch_id": b.id,
                    "shop_id": b.shop_id,
                    "product_id": b.product_id,
                    "batch_no": b.batch_no,
                    "quantity": b.quantity,
                    "available": b.available,
                })).collect::<Vec<_>>(),
            }),
        )
    }

    pub fn into_event(self, seq: i64) -> OutboxEvent {
        OutboxEvent {
            id: self.id,
            seq,
            aggregate_type: self.aggregate_type.to_string(),
            aggregate_id: self.aggregate_id,
            event_type: self.event_type.to_string(),
            payload: self.payload,
            created_at: self.created_at,
            published: false,
            published_at: None,
            attempts: 0,
            last_error: None,
        }
    }
}
