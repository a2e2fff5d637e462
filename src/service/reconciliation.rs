//! 人工对账: 处理未自动匹配的发票行，并把人工结果沉淀为供应商映射

use std::sync::Arc;

use bigdecimal::{BigDecimal, Zero};
use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{CatalogRepository, InvoiceRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    normalize_text, InvoiceStatus, LineResolution, LineStatus, MatchType, NewOutboxEvent,
    NewProduct, ParsedInvoiceLine, ReconciliationFilter, ReconciliationRow, ResolvedAction,
};

pub const MAX_QUEUE_LIMIT: i64 = 200;

/// 行间合计与发票合计允许的差额
fn total_tolerance() -> BigDecimal {
    BigDecimal::from(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineAction {
    Match,
    Create,
    Ignore,
}

/// POST /invoices/:id/lines/:lineId/match
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveLineRequest {
    pub action: LineAction,
    pub product_id: Option<Uuid>,
    pub new_product: Option<NewProduct>,
    pub batch_no: Option<String>,
    pub expiry_date: Option<NaiveDate>,
}

/// 对账队列中按发票分组的一组待处理行
#[derive(Debug, Serialize)]
pub struct QueueGroup {
    pub parsed_invoice_id: Uuid,
    pub vendor_id: Uuid,
    pub shop_id: Uuid,
    pub invoice_number: Option<String>,
    pub line_count: usize,
    pub lines: Vec<ReconciliationRow>,
}

#[derive(Debug, Default, Serialize)]
pub struct ValidationSummary {
    pub total_lines: usize,
    pub matched: usize,
    pub pending: usize,
    pub ignored: usize,
    pub lines_total: BigDecimal,
    pub invoice_total: Option<BigDecimal>,
}

/// 确认收货前的校验报告
#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub parsed_invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub summary: ValidationSummary,
}

pub struct ReconciliationService {
    invoices: Arc<dyn InvoiceRepository>,
    catalog: Arc<dyn CatalogRepository>,
}

impl ReconciliationService {
    pub fn new(invoices: Arc<dyn InvoiceRepository>, catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { invoices, catalog }
    }

    /// match / create / ignore 三选一；已处理过的行返回 Conflict
    pub async fn resolve(
        &self,
        invoice_id: Uuid,
        line_id: Uuid,
        req: ResolveLineRequest,
    ) -> AppResult<ParsedInvoiceLine> {
        let line = self
            .invoices
            .list_lines(invoice_id)
            .await?
            .into_iter()
            .find(|l| l.id == line_id)
            .ok_or_else(|| AppError::not_found(format!("invoice line {}", line_id)))?;

        let action = match req.action {
            LineAction::Match => {
                let product_id = req
                    .product_id
                    .ok_or_else(|| AppError::validation("product_id is required for match"))?;
                let product = self
                    .catalog
                    .get_product(product_id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("product {}", product_id)))?;
                if !product.is_active {
                    return Err(AppError::validation(format!("product {} is inactive", product_id)));
                }
                ResolvedAction::Matched {
                    product_id,
                    match_type: MatchType::Manual,
                    new_product: None,
                }
            }
            LineAction::Create => {
                let product = req
                    .new_product
                    .ok_or_else(|| AppError::validation("new_product is required for create"))?
                    .into_product()?;
                ResolvedAction::Matched {
                    product_id: product.id,
                    match_type: MatchType::Created,
                    new_product: Some(product),
                }
            }
            LineAction::Ignore => ResolvedAction::Ignored,
        };

        let product_id = match &action {
            ResolvedAction::Matched { product_id, .. } => Some(*product_id),
            ResolvedAction::Ignored => None,
        };
        let resolution = LineResolution {
            invoice_id,
            line_id,
            action,
            normalized_description: normalize_text(&line.description),
            batch_no: req.batch_no.filter(|b| !b.trim().is_empty()),
            expiry_date: req.expiry_date,
            resolved_at: Utc::now(),
        };
        let label = match req.action {
            LineAction::Match => "match",
            LineAction::Create => "create",
            LineAction::Ignore => "ignore",
        };
        let event = NewOutboxEvent::line_resolved(invoice_id, line_id, label, product_id);

        let resolved = self.invoices.resolve_line(&resolution, &event).await?;
        tracing::info!(
            invoice_id = %invoice_id,
            line_id = %line_id,
            action = label,
            "发票行已处理"
        );
        Ok(resolved)
    }

    /// 对账队列，按发票分组 (保持查询顺序)
    pub async fn queue(&self, mut filter: ReconciliationFilter) -> AppResult<Vec<QueueGroup>> {
        filter.limit = filter.limit.clamp(1, MAX_QUEUE_LIMIT);
        filter.offset = filter.offset.max(0);
        let rows = self.invoices.reconciliation_rows(&filter).await?;

        let mut groups: IndexMap<Uuid, QueueGroup> = IndexMap::new();
        for row in rows {
            let group = groups.entry(row.parsed_invoice_id).or_insert_with(|| QueueGroup {
                parsed_invoice_id: row.parsed_invoice_id,
                vendor_id: row.vendor_id,
                shop_id: row.shop_id,
                invoice_number: row.invoice_number.clone(),
                line_count: 0,
                lines: Vec::new(),
            });
            group.line_count += 1;
            group.lines.push(row);
        }
        Ok(groups.into_values().collect())
    }

    /// 确认前校验: 未处理行、非法数量单价 (错误)；合计差异、重复发票号 (警告)
    pub async fn validate(&self, invoice_id: Uuid) -> AppResult<ValidationReport> {
        let (invoice, lines) = futures::try_join!(
            self.invoices.get_invoice(invoice_id),
            self.invoices.list_lines(invoice_id)
        )?;
        let invoice =
            invoice.ok_or_else(|| AppError::not_found(format!("parsed invoice {}", invoice_id)))?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut summary = ValidationSummary {
            total_lines: lines.len(),
            lines_total: BigDecimal::zero(),
            invoice_total: invoice.total_amount.clone(),
            ..Default::default()
        };

        if invoice.status == InvoiceStatus::Processing || invoice.status == InvoiceStatus::Failed {
            errors.push(format!("invoice is {}", invoice.status));
        }
        if lines.is_empty() {
            errors.push("invoice has no lines".to_string());
        }

        for line in &lines {
            match line.status {
                LineStatus::Pending => {
                    summary.pending += 1;
                    errors.push(format!("line {} ({}) is not resolved", line.line_no, line.description));
                }
                LineStatus::Ignored => summary.ignored += 1,
                LineStatus::Matched => {
                    summary.matched += 1;
                    if line.qty <= BigDecimal::zero() {
                        errors.push(format!("line {} has invalid quantity {}", line.line_no, line.qty));
                    }
                    if line.unit_price <= BigDecimal::zero() {
                        errors.push(format!(
                            "line {} has invalid unit price {}",
                            line.line_no, line.unit_price
                        ));
                    }
                    summary.lines_total += line.line_total();
                }
            }
        }

        if let Some(total) = &invoice.total_amount {
            let diff = (&summary.lines_total - total).abs();
            if diff > total_tolerance() {
                warnings.push(format!(
                    "line total {} differs from invoice total {} by {}",
                    summary.lines_total, total, diff
                ));
            }
        }
        if let Some(number) = &invoice.invoice_number {
            if let Some(dup) = self
                .invoices
                .find_duplicate(invoice.vendor_id, number, invoice.id)
                .await?
            {
                warnings.push(format!(
                    "invoice number {} already used by invoice {} from the same vendor",
                    number, dup.id
                ));
            }
        }

        Ok(ValidationReport {
            parsed_invoice_id: invoice.id,
            status: invoice.status,
            valid: errors.is_empty(),
            errors,
            warnings,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_deserializes_lowercase() {
        let req: ResolveLineRequest =
            serde_json::from_str(r#"{"action":"ignore"}"#).unwrap();
        assert_eq!(req.action, LineAction::Ignore);
        assert!(serde_json::from_str::<ResolveLineRequest>(r#"{"action":"merge"}"#).is_err());
    }
}
