//! 收货单 (GRN) 服务: draft -> confirmed -> posted
//!
//! 确认时批次入库、发票状态、outbox 事件在同一事务内提交；
//! 只有草稿可以编辑或删除。

use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::{BigDecimal, Zero};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AccountingConfig;
use crate::db::{GrnRepository, InvoiceRepository};
use crate::error::{AppError, AppResult};
use crate::models::grn::{accounting_entries, build_lines};
use crate::models::{
    event_types, AccountingEntry, Grn, GrnLineInput, GrnStatus, GrnTotals, GrnWithLines,
    InvoiceStatus, LineStatus, NewOutboxEvent, ParsedInvoiceLine,
};

pub const MAX_LIST_LIMIT: i64 = 200;

/// POST /purchases/grn
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGrnRequest {
    pub parsed_invoice_id: Option<Uuid>,
    pub vendor_id: Option<Uuid>,
    pub shop_id: Option<Uuid>,
    pub receipt_date: Option<NaiveDate>,
    pub freight: Option<BigDecimal>,
    #[serde(default)]
    pub lines: Vec<GrnLineInput>,
}

/// PUT /purchases/grn/:id
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateGrnRequest {
    pub receipt_date: Option<NaiveDate>,
    pub freight: Option<BigDecimal>,
    pub lines: Vec<GrnLineInput>,
}

#[derive(Debug, Serialize)]
pub struct PostedGrn {
    #[serde(flatten)]
    pub receipt: GrnWithLines,
    pub entries: Vec<AccountingEntry>,
}

/// 由已对账的发票行生成收货明细: matched 入库，ignored 作为 excluded 保留
fn derive_lines(lines: &[ParsedInvoiceLine]) -> AppResult<Vec<GrnLineInput>> {
    let pending: Vec<String> = lines
        .iter()
        .filter(|l| l.status == LineStatus::Pending)
        .map(|l| l.line_no.to_string())
        .collect();
    if !pending.is_empty() {
        return Err(AppError::validation(format!(
            "invoice lines {} are not reconciled",
            pending.join(", ")
        )));
    }
    Ok(lines
        .iter()
        .map(|l| {
            let excluded = l.status == LineStatus::Ignored;
            GrnLineInput {
                parsed_line_id: Some(l.id),
                product_id: if excluded { None } else { l.matched_product_id },
                batch_no: l.batch_no.clone(),
                expiry_date: l.expiry_date,
                qty: l.qty.clone(),
                unit_cost: l.unit_price.clone(),
                discount: None,
                tax_rate: Some(l.tax_rate.clone()),
                excluded,
            }
        })
        .collect())
}

/// 显式提交的明细若引用了被忽略的发票行，强制标记为 excluded
fn exclude_ignored(inputs: &mut [GrnLineInput], invoice_lines: &[ParsedInvoiceLine]) -> AppResult<()> {
    let by_id: HashMap<Uuid, &ParsedInvoiceLine> = invoice_lines.iter().map(|l| (l.id, l)).collect();
    for input in inputs.iter_mut() {
        let Some(line_id) = input.parsed_line_id else {
            continue;
        };
        let line = by_id.get(&line_id).ok_or_else(|| {
            AppError::validation(format!("parsed line {} does not belong to the invoice", line_id))
        })?;
        if line.status == LineStatus::Ignored {
            input.excluded = true;
        }
    }
    Ok(())
}

fn csv_error(e: impl std::fmt::Display) -> AppError {
    AppError::Persistence(format!("csv: {}", e))
}

pub struct GrnService {
    grns: Arc<dyn GrnRepository>,
    invoices: Arc<dyn InvoiceRepository>,
    accounting: AccountingConfig,
}

impl GrnService {
    pub fn new(
        grns: Arc<dyn GrnRepository>,
        invoices: Arc<dyn InvoiceRepository>,
        accounting: AccountingConfig,
    ) -> Self {
        Self {
            grns,
            invoices,
            accounting,
        }
    }

    /// 创建草稿收货单；未给明细时由发票行推导
    pub async fn create(&self, req: CreateGrnRequest) -> AppResult<GrnWithLines> {
        let receipt_date = req.receipt_date.unwrap_or_else(|| Utc::now().date_naive());
        let freight = req.freight.unwrap_or_else(BigDecimal::zero);
        let mut inputs = req.lines;

        let (vendor_id, shop_id) = match req.parsed_invoice_id {
            Some(invoice_id) => {
                let invoice = self
                    .invoices
                    .get_invoice(invoice_id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("parsed invoice {}", invoice_id)))?;
                if invoice.status != InvoiceStatus::Parsed {
                    return Err(AppError::conflict(format!(
                        "invoice {} is {}; receipts can only be created from a parsed invoice",
                        invoice_id, invoice.status
                    )));
                }
                if req.vendor_id.is_some_and(|v| v != invoice.vendor_id)
                    || req.shop_id.is_some_and(|s| s != invoice.shop_id)
                {
                    return Err(AppError::validation(
                        "vendor_id / shop_id do not match the parsed invoice",
                    ));
                }
                let invoice_lines = self.invoices.list_lines(invoice_id).await?;
                if inputs.is_empty() {
                    inputs = derive_lines(&invoice_lines)?;
                } else {
                    exclude_ignored(&mut inputs, &invoice_lines)?;
                }
                (invoice.vendor_id, invoice.shop_id)
            }
            None => (
                req.vendor_id
                    .ok_or_else(|| AppError::validation("vendor_id is required"))?,
                req.shop_id
                    .ok_or_else(|| AppError::validation("shop_id is required"))?,
            ),
        };

        let mut grn = Grn::new_draft(
            req.parsed_invoice_id,
            vendor_id,
            shop_id,
            receipt_date,
            GrnTotals::zero(),
        );
        let (lines, totals) = build_lines(grn.id, receipt_date, &inputs, &freight)?;
        grn.set_totals(totals);

        let event = NewOutboxEvent::receipt_event(event_types::RECEIPT_DRAFTED, &grn, &lines);
        self.grns.insert_draft(&grn, &lines, &event).await?;
        tracing::info!(
            grn_id = %grn.id,
            receipt_number = %grn.receipt_number,
            lines = lines.len(),
            grand_total = %grn.grand_total,
            "收货单草稿已创建"
        );
        Ok(GrnWithLines { grn, lines })
    }

    pub async fn get(&self, id: Uuid) -> AppResult<GrnWithLines> {
        let (grn, lines) = futures::try_join!(self.grns.get(id), self.grns.lines(id))?;
        let grn = grn.ok_or_else(|| AppError::not_found(format!("grn {}", id)))?;
        Ok(GrnWithLines { grn, lines })
    }

    pub async fn list(&self, status: Option<GrnStatus>, limit: i64, offset: i64) -> AppResult<Vec<Grn>> {
        self.grns
            .list(status, limit.clamp(1, MAX_LIST_LIMIT), offset.max(0))
            .await
    }

    /// 替换草稿明细并重算合计
    pub async fn update(&self, id: Uuid, req: UpdateGrnRequest) -> AppResult<GrnWithLines> {
        let current = self.get(id).await?;
        current.grn.status.ensure_editable()?;

        let mut inputs = req.lines;
        if let Some(invoice_id) = current.grn.parsed_invoice_id {
            let invoice_lines = self.invoices.list_lines(invoice_id).await?;
            exclude_ignored(&mut inputs, &invoice_lines)?;
        }
        let receipt_date = req.receipt_date.unwrap_or(current.grn.receipt_date);
        let freight = req.freight.unwrap_or_else(|| current.grn.freight.clone());

        let mut grn = current.grn;
        grn.receipt_date = receipt_date;
        let (lines, totals) = build_lines(grn.id, receipt_date, &inputs, &freight)?;
        grn.set_totals(totals);

        let grn = self.grns.replace_draft(&grn, &lines).await?;
        tracing::info!(grn_id = %id, lines = lines.len(), "收货单草稿已更新");
        Ok(GrnWithLines { grn, lines })
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        self.grns.delete_draft(id).await?;
        tracing::info!(grn_id = %id, "收货单草稿已删除");
        Ok(())
    }

    /// draft -> confirmed: 批次原子递增 + 发票 confirmed + purchase.receipt.created
    ///
    /// 入库数量以事务内锁定后读到的明细为准，与并发的草稿修改互斥。
    pub async fn confirm(&self, id: Uuid, approved_by: &str) -> AppResult<GrnWithLines> {
        let approved_by = approved_by.trim();
        if approved_by.is_empty() {
            return Err(AppError::validation("approved_by is required"));
        }
        let confirmed = self.grns.confirm(id, approved_by, Utc::now()).await?;
        tracing::info!(
            grn_id = %id,
            approved_by = %approved_by,
            lines = confirmed.lines.len(),
            "收货单已确认，库存已更新"
        );
        Ok(confirmed)
    }

    /// confirmed -> posted: 生成借贷分录
    pub async fn post(&self, id: Uuid) -> AppResult<PostedGrn> {
        let current = self.get(id).await?;
        current.grn.status.ensure_transition(GrnStatus::Posted)?;

        let now = Utc::now();
        let entries = accounting_entries(&current.grn, &self.accounting, now);
        let event =
            NewOutboxEvent::receipt_event(event_types::RECEIPT_POSTED, &current.grn, &current.lines);
        let grn = self.grns.post(id, now, &entries, &event).await?;
        tracing::info!(grn_id = %id, entries = entries.len(), "收货单已过账");

        Ok(PostedGrn {
            receipt: GrnWithLines {
                grn,
                lines: current.lines,
            },
            entries,
        })
    }

    pub async fn entries(&self, id: Uuid) -> AppResult<Vec<AccountingEntry>> {
        self.grns.entries(id).await
    }

    /// 明细导出为 CSV
    pub async fn export_csv(&self, id: Uuid) -> AppResult<String> {
        let receipt = self.get(id).await?;
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record([
                "receipt_number",
                "line_no",
                "product_id",
                "batch_no",
                "expiry_date",
                "qty",
                "unit_cost",
                "discount",
                "tax_rate",
                "tax",
                "landed_unit_cost",
                "line_total",
                "excluded",
            ])
            .map_err(csv_error)?;
        for line in &receipt.lines {
            writer
                .write_record(&[
                    receipt.grn.receipt_number.clone(),
                    line.line_no.to_string(),
                    line.product_id.map(|p| p.to_string()).unwrap_or_default(),
                    line.batch_no.clone(),
                    line.expiry_date.map(|d| d.to_string()).unwrap_or_default(),
                    line.qty.to_string(),
                    line.unit_cost.to_string(),
                    line.discount.to_string(),
                    line.tax_rate.to_string(),
                    line.tax.to_string(),
                    line.landed_unit_cost.to_string(),
                    line.line_total.to_string(),
                    line.excluded.to_string(),
                ])
                .map_err(csv_error)?;
        }
        let bytes = writer.into_inner().map_err(csv_error)?;
        String::from_utf8(bytes).map_err(csv_error)
    }
}
