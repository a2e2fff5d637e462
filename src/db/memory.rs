//! 内存仓储实现
//!
//! 所有表放在一把 `tokio::sync::Mutex` 后面，每个方法持锁期间先校验再写入，
//! 与 PostgreSQL 事务的 "全部生效或全部不生效" 语义一致。用于 `memory://` 配置与测试。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::repository::{
    CatalogRepository, GrnRepository, InventoryRepository, InvoiceRepository, OutboxRepository,
    ParseJobQueue,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    event_types, normalize_text, AccountingEntry, BatchReceipt, Grn, GrnLine, GrnStatus,
    GrnWithLines, InventoryBatch, InvoiceHeader, InvoiceStatus, LineResolution, LineStatus,
    NewOutboxEvent, OutboxEvent, ParseJob, ParseJobStatus, ParsedInvoice, ParsedInvoiceLine,
    Product, ProductQuery, ReconciliationFilter, ReconciliationRow, ResolvedAction,
    VendorProductMapping,
};

type BatchKey = (Uuid, Uuid, String);

#[derive(Default)]
struct State {
    products: IndexMap<Uuid, Product>,
    invoices: IndexMap<Uuid, ParsedInvoice>,
    lines: IndexMap<Uuid, ParsedInvoiceLine>,
    jobs: IndexMap<Uuid, ParseJob>,
    mappings: HashMap<(Uuid, String), VendorProductMapping>,
    grns: IndexMap<Uuid, Grn>,
    grn_lines: HashMap<Uuid, Vec<GrnLine>>,
    batches: IndexMap<BatchKey, InventoryBatch>,
    update_requests: HashMap<String, Uuid>,
    entries: Vec<AccountingEntry>,
    outbox: Vec<OutboxEvent>,
    next_seq: i64,
}

impl State {
    fn push_event(&mut self, event: &NewOutboxEvent) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.outbox.push(event.clone().into_event(seq));
    }

    fn invoice(&self, id: Uuid) -> AppResult<&ParsedInvoice> {
        self.invoices
            .get(&id)
            .ok_or_else(|| AppError::not_found(format!("parsed invoice {}", id)))
    }

    fn grn(&self, id: Uuid) -> AppResult<&Grn> {
        self.grns
            .get(&id)
            .ok_or_else(|| AppError::not_found(format!("grn {}", id)))
    }

    fn upsert_batch(&mut self, receipt: &BatchReceipt, at: DateTime<Utc>) -> InventoryBatch {
        let batch = self
            .batches
            .entry(receipt.key())
            .and_modify(|b| b.apply_receipt(receipt, at))
            .or_insert_with(|| InventoryBatch::from_receipt(receipt, at));
        batch.clone()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部 outbox 事件 (含已发布)，按写入顺序
    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.outbox.clone()
    }

    pub async fn mappings(&self) -> Vec<VendorProductMapping> {
        self.state.lock().await.mappings.values().cloned().collect()
    }

    pub async fn product_count(&self) -> usize {
        self.state.lock().await.products.len()
    }

    /// 调整发票创建时间 (超时清理测试用)
    pub async fn backdate_invoice(&self, id: Uuid, created_at: DateTime<Utc>) {
        if let Some(invoice) = self.state.lock().await.invoices.get_mut(&id) {
            invoice.created_at = created_at;
        }
    }

    /// 调整发票对应任务的领取时间 (超时清理测试用)
    pub async fn backdate_claim(&self, invoice_id: Uuid, locked_at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        for job in state.jobs.values_mut() {
            if job.parsed_invoice_id == invoice_id {
                job.locked_at = Some(locked_at);
            }
        }
    }

    /// 发票对应的解析任务
    pub async fn jobs_for(&self, invoice_id: Uuid) -> Vec<ParseJob> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .filter(|j| j.parsed_invoice_id == invoice_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InvoiceRepository for MemoryStore {
    async fn create_invoice(&self, invoice: &ParsedInvoice, job: &ParseJob) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.invoices.contains_key(&invoice.id) {
            return Err(AppError::conflict(format!("parsed invoice {} exists", invoice.id)));
        }
        state.invoices.insert(invoice.id, invoice.clone());
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_invoice(&self, id: Uuid) -> AppResult<Option<ParsedInvoice>> {
        Ok(self.state.lock().await.invoices.get(&id).cloned())
    }

    async fn list_lines(&self, invoice_id: Uuid) -> AppResult<Vec<ParsedInvoiceLine>> {
        let state = self.state.lock().await;
        let mut lines: Vec<_> = state
            .lines
            .values()
            .filter(|l| l.parsed_invoice_id == invoice_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.line_no);
        Ok(lines)
    }

    async fn save_parsed(
        &self,
        invoice_id: Uuid,
        header: &InvoiceHeader,
        lines: &[ParsedInvoiceLine],
        event: &NewOutboxEvent,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state
            .invoice(invoice_id)?
            .status
            .ensure_transition(InvoiceStatus::Parsed)?;

        for line in lines {
            let mut line = line.clone();
            line.parsed_invoice_id = invoice_id;
            state.lines.insert(line.id, line);
        }
        let now = Utc::now();
        if let Some(invoice) = state.invoices.get_mut(&invoice_id) {
            invoice.status = InvoiceStatus::Parsed;
            invoice.invoice_number = header.invoice_number.clone();
            invoice.invoice_date = header.invoice_date;
            invoice.total_amount = header.total_amount.clone();
            invoice.parsed_at = Some(now);
            invoice.updated_at = now;
        }
        state.push_event(event);
        Ok(())
    }

    async fn mark_failed(
        &self,
        invoice_id: Uuid,
        message: &str,
        event: &NewOutboxEvent,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state
            .invoice(invoice_id)?
            .status
            .ensure_transition(InvoiceStatus::Failed)?;
        if let Some(invoice) = state.invoices.get_mut(&invoice_id) {
            invoice.status = InvoiceStatus::Failed;
            invoice.error_message = Some(message.to_string());
            invoice.updated_at = Utc::now();
        }
        state.push_event(event);
        Ok(())
    }

    async fn resolve_line(
        &self,
        resolution: &LineResolution,
        event: &NewOutboxEvent,
    ) -> AppResult<ParsedInvoiceLine> {
        let mut state = self.state.lock().await;
        let invoice = state.invoice(resolution.invoice_id)?;
        if invoice.status != InvoiceStatus::Parsed {
            return Err(AppError::conflict(format!(
                "invoice {} is {}; lines can only be resolved while parsed",
                invoice.id, invoice.status
            )));
        }
        let vendor_id = invoice.vendor_id;

        let mut line = state
            .lines
            .get(&resolution.line_id)
            .filter(|l| l.parsed_invoice_id == resolution.invoice_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("invoice line {}", resolution.line_id)))?;
        resolution.apply_to(&mut line)?;

        if let ResolvedAction::Matched {
            product_id,
            new_product,
            ..
        } = &resolution.action
        {
            if let Some(product) = new_product {
                if state.products.contains_key(&product.id) {
                    return Err(AppError::conflict(format!("product {} exists", product.id)));
                }
                state.products.insert(product.id, product.clone());
            }
            if !resolution.normalized_description.is_empty() {
                let key = (vendor_id, resolution.normalized_description.clone());
                state
                    .mappings
                    .entry(key)
                    .and_modify(|m| {
                        m.product_id = *product_id;
                        m.confidence = 1.0;
                        m.usage_count += 1;
                        m.last_used_at = resolution.resolved_at;
                    })
                    .or_insert_with(|| VendorProductMapping {
                        vendor_id,
                        normalized_description: resolution.normalized_description.clone(),
                        product_id: *product_id,
                        confidence: 1.0,
                        usage_count: 1,
                        last_used_at: resolution.resolved_at,
                    });
            }
        }

        state.lines.insert(line.id, line.clone());
        state.push_event(event);
        Ok(line)
    }

    async fn reconciliation_rows(
        &self,
        filter: &ReconciliationFilter,
    ) -> AppResult<Vec<ReconciliationRow>> {
        let state = self.state.lock().await;
        let mut rows: Vec<(DateTime<Utc>, ReconciliationRow)> = state
            .lines
            .values()
            .filter(|l| l.status == filter.status)
            .filter_map(|l| {
                let invoice = state.invoices.get(&l.parsed_invoice_id)?;
                if filter.status == LineStatus::Pending && invoice.status != InvoiceStatus::Parsed {
                    return None;
                }
                if filter.vendor_id.is_some_and(|v| v != invoice.vendor_id) {
                    return None;
                }
                Some((
                    invoice.created_at,
                    ReconciliationRow {
                        parsed_invoice_id: invoice.id,
                        vendor_id: invoice.vendor_id,
                        shop_id: invoice.shop_id,
                        invoice_number: invoice.invoice_number.clone(),
                        line_id: l.id,
                        line_no: l.line_no,
                        description: l.description.clone(),
                        qty: l.qty.clone(),
                        unit_price: l.unit_price.clone(),
                        match_type: l.match_type,
                        match_confidence: l.match_confidence,
                        suggested_product_id: l.suggested_product_id,
                        status: l.status,
                    },
                ))
            })
            .collect();
        rows.sort_by(|(a_at, a), (b_at, b)| {
            a_at.cmp(b_at)
                .then(a.parsed_invoice_id.cmp(&b.parsed_invoice_id))
                .then(a.line_no.cmp(&b.line_no))
        });
        Ok(rows
            .into_iter()
            .map(|(_, row)| row)
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn find_duplicate(
        &self,
        vendor_id: Uuid,
        invoice_number: &str,
        exclude_id: Uuid,
    ) -> AppResult<Option<ParsedInvoice>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .values()
            .find(|i| {
                i.id != exclude_id
                    && i.vendor_id == vendor_id
                    && i.invoice_number.as_deref() == Some(invoice_number)
            })
            .cloned())
    }
}

#[async_trait]
impl ParseJobQueue for MemoryStore {
    async fn claim_next(&self, _worker_id: &str, lease_secs: i64) -> AppResult<Option<ParseJob>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let next = state
            .jobs
            .values_mut()
            .filter(|j| match j.status {
                ParseJobStatus::Queued => true,
                ParseJobStatus::Running => j.lease_until.is_some_and(|l| l < now),
                _ => false,
            })
            .min_by_key(|j| j.created_at);
        Ok(next.map(|job| {
            job.status = ParseJobStatus::Running;
            job.attempts += 1;
            job.locked_at = Some(now);
            job.lease_until = Some(now + Duration::seconds(lease_secs));
            job.clone()
        }))
    }

    async fn complete(&self, job_id: Uuid) -> AppResult<()> {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.status = ParseJobStatus::Done;
            job.lease_until = None;
        }
        Ok(())
    }

    async fn release(&self, job_id: Uuid, error: &str) -> AppResult<()> {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.status = ParseJobStatus::Queued;
            job.lease_until = None;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> AppResult<()> {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.status = ParseJobStatus::Failed;
            job.lease_until = None;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn stale_jobs(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<ParseJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == ParseJobStatus::Running && j.locked_at.is_some_and(|t| t < cutoff))
            .filter(|j| {
                state
                    .invoices
                    .get(&j.parsed_invoice_id)
                    .is_some_and(|i| i.status == InvoiceStatus::Processing)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn find_containing(&self, normalized_description: &str) -> AppResult<Option<Product>> {
        let state = self.state.lock().await;
        Ok(state
            .products
            .values()
            .filter(|p| p.is_active && normalize_text(&p.name).contains(normalized_description))
            .min_by(|a, b| a.name.len().cmp(&b.name.len()).then(a.name.cmp(&b.name)))
            .cloned())
    }

    async fn fuzzy_candidates(
        &self,
        query: &ProductQuery,
        min_similarity: f64,
        limit: i64,
    ) -> AppResult<Vec<Product>> {
        let q = normalize_text(&query.q);
        let q_tokens: Vec<&str> = q.split_whitespace().collect();
        let brand = query.brand.as_deref().map(|b| b.trim().to_lowercase());
        let potency = query.potency.as_deref().map(|p| p.trim().to_lowercase());

        let state = self.state.lock().await;
        let mut scored: Vec<(f64, &Product)> = state
            .products
            .values()
            .filter(|p| p.is_active)
            .filter(|p| match &brand {
                Some(b) if !b.is_empty() => p
                    .brand
                    .as_deref()
                    .is_some_and(|pb| pb.to_lowercase().contains(b.as_str())),
                _ => true,
            })
            .filter(|p| match &potency {
                Some(pt) if !pt.is_empty() => {
                    p.potency.as_deref().is_some_and(|pp| pp.to_lowercase() == *pt)
                }
                _ => true,
            })
            .filter_map(|p| {
                let name = normalize_text(&p.name);
                let score = strsim::jaro_winkler(&name, &q);
                let shares_token = name.split_whitespace().any(|t| q_tokens.contains(&t));
                (score >= min_similarity || shares_token).then_some((score, p))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.name.cmp(&b.1.name)));
        Ok(scored
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn find_mapping(
        &self,
        vendor_id: Uuid,
        normalized_description: &str,
    ) -> AppResult<Option<VendorProductMapping>> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .get(&(vendor_id, normalized_description.to_string()))
            .filter(|m| state.products.get(&m.product_id).is_some_and(|p| p.is_active))
            .cloned())
    }

    async fn touch_mapping(&self, vendor_id: Uuid, normalized_description: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(m) = state
            .mappings
            .get_mut(&(vendor_id, normalized_description.to_string()))
        {
            m.usage_count += 1;
            m.last_used_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_product(&self, product: &Product) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.products.contains_key(&product.id) {
            return Err(AppError::conflict(format!("product {} exists", product.id)));
        }
        state.products.insert(product.id, product.clone());
        Ok(())
    }
}

#[async_trait]
impl GrnRepository for MemoryStore {
    async fn insert_draft(
        &self,
        grn: &Grn,
        lines: &[GrnLine],
        event: &NewOutboxEvent,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state
            .grns
            .values()
            .any(|g| g.receipt_number == grn.receipt_number)
        {
            return Err(AppError::conflict(format!(
                "receipt number {} exists",
                grn.receipt_number
            )));
        }
        state.grns.insert(grn.id, grn.clone());
        state.grn_lines.insert(grn.id, lines.to_vec());
        state.push_event(event);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Grn>> {
        Ok(self.state.lock().await.grns.get(&id).cloned())
    }

    async fn lines(&self, id: Uuid) -> AppResult<Vec<GrnLine>> {
        let state = self.state.lock().await;
        let mut lines = state.grn_lines.get(&id).cloned().unwrap_or_default();
        lines.sort_by_key(|l| l.line_no);
        Ok(lines)
    }

    async fn list(&self, status: Option<GrnStatus>, limit: i64, offset: i64) -> AppResult<Vec<Grn>> {
        let state = self.state.lock().await;
        let mut grns: Vec<Grn> = state
            .grns
            .values()
            .filter(|g| status.map_or(true, |s| g.status == s))
            .cloned()
            .collect();
        grns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(grns
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn replace_draft(&self, grn: &Grn, lines: &[GrnLine]) -> AppResult<Grn> {
        let mut state = self.state.lock().await;
        state.grn(grn.id)?.status.ensure_editable()?;
        let stored = match state.grns.get_mut(&grn.id) {
            Some(stored) => stored,
            None => return Err(AppError::not_found(format!("grn {}", grn.id))),
        };
        stored.receipt_date = grn.receipt_date;
        stored.subtotal = grn.subtotal.clone();
        stored.tax_total = grn.tax_total.clone();
        stored.freight = grn.freight.clone();
        stored.grand_total = grn.grand_total.clone();
        stored.updated_at = Utc::now();
        let updated = stored.clone();
        state.grn_lines.insert(grn.id, lines.to_vec());
        Ok(updated)
    }

    async fn delete_draft(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.grn(id)?.status.ensure_editable()?;
        state.grns.shift_remove(&id);
        state.grn_lines.remove(&id);
        Ok(())
    }

    async fn confirm(
        &self,
        id: Uuid,
        approved_by: &str,
        at: DateTime<Utc>,
    ) -> AppResult<GrnWithLines> {
        let mut state = self.state.lock().await;
        let grn = state.grn(id)?.clone();
        grn.status.ensure_transition(GrnStatus::Confirmed)?;

        if let Some(invoice_id) = grn.parsed_invoice_id {
            let invoice_status = state.invoice(invoice_id)?.status;
            let taken = state.grns.values().any(|g| {
                g.id != id && g.parsed_invoice_id == Some(invoice_id) && g.status != GrnStatus::Draft
            });
            if taken {
                return Err(AppError::conflict(format!(
                    "invoice {} already has a confirmed receipt",
                    invoice_id
                )));
            }
            invoice_status.ensure_transition(InvoiceStatus::Confirmed)?;
        }

        let mut lines = state.grn_lines.get(&id).cloned().unwrap_or_default();
        lines.sort_by_key(|l| l.line_no);
        let receipt = GrnWithLines { grn, lines };
        let receipts = receipt.batch_receipts();
        for batch in &receipts {
            batch.validate()?;
        }

        if let Some(invoice) = receipt
            .grn
            .parsed_invoice_id
            .and_then(|invoice_id| state.invoices.get_mut(&invoice_id))
        {
            invoice.status = InvoiceStatus::Confirmed;
            invoice.confirmed_at = Some(at);
            invoice.updated_at = at;
        }
        for batch in &receipts {
            state.upsert_batch(batch, at);
        }
        let confirmed = match state.grns.get_mut(&id) {
            Some(stored) => {
                stored.status = GrnStatus::Confirmed;
                stored.approved_by = Some(approved_by.to_string());
                stored.approved_at = Some(at);
                stored.updated_at = at;
                stored.clone()
            }
            None => return Err(AppError::not_found(format!("grn {}", id))),
        };
        let event =
            NewOutboxEvent::receipt_event(event_types::RECEIPT_CREATED, &confirmed, &receipt.lines);
        state.push_event(&event);
        Ok(GrnWithLines {
            grn: confirmed,
            lines: receipt.lines,
        })
    }

    async fn post(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        entries: &[AccountingEntry],
        event: &NewOutboxEvent,
    ) -> AppResult<Grn> {
        let mut state = self.state.lock().await;
        state.grn(id)?.status.ensure_transition(GrnStatus::Posted)?;
        state.entries.extend_from_slice(entries);
        let posted = match state.grns.get_mut(&id) {
            Some(stored) => {
                stored.status = GrnStatus::Posted;
                stored.posted_at = Some(at);
                stored.updated_at = at;
                stored.clone()
            }
            None => return Err(AppError::not_found(format!("grn {}", id))),
        };
        state.push_event(event);
        Ok(posted)
    }

    async fn entries(&self, id: Uuid) -> AppResult<Vec<AccountingEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .entries
            .iter()
            .filter(|e| e.receipt_id == id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.side.as_str().cmp(a.side.as_str()).then(a.account.cmp(&b.account)));
        Ok(entries)
    }
}

#[async_trait]
impl InventoryRepository for MemoryStore {
    async fn apply_bulk(
        &self,
        idempotency_key: &str,
        receipts: &[BatchReceipt],
    ) -> AppResult<(bool, Vec<InventoryBatch>)> {
        let mut state = self.state.lock().await;
        if state.update_requests.contains_key(idempotency_key) {
            let current = receipts
                .iter()
                .filter_map(|r| state.batches.get(&r.key()).cloned())
                .collect();
            return Ok((false, current));
        }
        for receipt in receipts {
            receipt.validate()?;
        }

        let request_id = Uuid::new_v4();
        state
            .update_requests
            .insert(idempotency_key.to_string(), request_id);
        let at = Utc::now();
        let batches: Vec<InventoryBatch> = receipts
            .iter()
            .map(|r| state.upsert_batch(r, at))
            .collect();
        let event = NewOutboxEvent::batches_updated(request_id, idempotency_key, &batches);
        state.push_event(&event);
        Ok((true, batches))
    }

    async fn list_batches(
        &self,
        shop_id: Option<Uuid>,
        product_id: Option<Uuid>,
    ) -> AppResult<Vec<InventoryBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .batches
            .values()
            .filter(|b| shop_id.map_or(true, |s| b.shop_id == s))
            .filter(|b| product_id.map_or(true, |p| b.product_id == p))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboxRepository for MemoryStore {
    async fn fetch_unpublished(&self, limit: i64) -> AppResult<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| !e.published)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: Uuid) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.outbox.iter_mut().find(|e| e.id == id && !e.published) {
            event.published = true;
            event.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.outbox.iter_mut().find(|e| e.id == id) {
            event.attempts += 1;
            event.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
