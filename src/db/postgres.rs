//! PostgreSQL 仓储实现
//!
//! 多表写入统一走 `pool.begin()` 事务；状态迁移用 `SELECT ... FOR UPDATE` 锁行后校验，
//! 再以 `WHERE status = ...` 条件更新，保证并发下同一迁移只会成功一次。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::db::repository::{
    CatalogRepository, GrnRepository, InventoryRepository, InvoiceRepository, OutboxRepository,
    ParseJobQueue,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    event_types, AccountingEntry, BatchReceipt, Grn, GrnLine, GrnStatus, GrnWithLines,
    InventoryBatch, InvoiceHeader, InvoiceStatus, LineResolution, LineStatus, NewOutboxEvent,
    OutboxEvent, ParseJob, ParsedInvoice, ParsedInvoiceLine, Product, ProductQuery,
    ReconciliationFilter, ReconciliationRow, ResolvedAction, VendorProductMapping,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_outbox(tx: &mut Transaction<'_, Postgres>, event: &NewOutboxEvent) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (id, aggregate_type, aggregate_id, event_type, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(event.id)
    .bind(event.aggregate_type)
    .bind(event.aggregate_id)
    .bind(event.event_type)
    .bind(&event.payload)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn lock_invoice_status(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: Uuid,
) -> AppResult<InvoiceStatus> {
    sqlx::query_scalar::<_, InvoiceStatus>(
        "SELECT status FROM parsed_invoices WHERE id = $1 FOR UPDATE",
    )
    .bind(invoice_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| AppError::not_found(format!("parsed invoice {}", invoice_id)))
}

async fn lock_grn(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> AppResult<Grn> {
    sqlx::query_as::<_, Grn>("SELECT * FROM purchase_receipts WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::not_found(format!("grn {}", id)))
}

async fn insert_grn_lines(tx: &mut Transaction<'_, Postgres>, lines: &[GrnLine]) -> AppResult<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut query_builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO purchase_receipt_lines (
            id, receipt_id, line_no, parsed_line_id, product_id, batch_no, expiry_date,
            qty, unit_cost, discount, tax_rate, tax, landed_unit_cost, line_total, excluded
        ) ",
    );
    query_builder.push_values(lines, |mut b, line| {
        b.push_bind(line.id)
            .push_bind(line.receipt_id)
            .push_bind(line.line_no)
            .push_bind(line.parsed_line_id)
            .push_bind(line.product_id)
            .push_bind(&line.batch_no)
            .push_bind(line.expiry_date)
            .push_bind(&line.qty)
            .push_bind(&line.unit_cost)
            .push_bind(&line.discount)
            .push_bind(&line.tax_rate)
            .push_bind(&line.tax)
            .push_bind(&line.landed_unit_cost)
            .push_bind(&line.line_total)
            .push_bind(line.excluded);
    });
    query_builder.build().execute(&mut **tx).await?;
    Ok(())
}

/// 批次原子递增: 已存在则 quantity += qty，available 随之重算
async fn upsert_batch(
    tx: &mut Transaction<'_, Postgres>,
    receipt: &BatchReceipt,
    at: DateTime<Utc>,
) -> AppResult<InventoryBatch> {
    let batch = sqlx::query_as::<_, InventoryBatch>(
        r#"
        INSERT INTO inventory_batches (
            id, shop_id, product_id, batch_no, quantity, reserved, available,
            landed_cost, expiry_date, last_restocked, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, 0, $5, $6, $7, $8, $8, $8)
        ON CONFLICT (shop_id, product_id, batch_no) DO UPDATE SET
            quantity = inventory_batches.quantity + EXCLUDED.quantity,
            available = inventory_batches.quantity + EXCLUDED.quantity - inventory_batches.reserved,
            landed_cost = EXCLUDED.landed_cost,
            expiry_date = COALESCE(EXCLUDED.expiry_date, inventory_batches.expiry_date),
            last_restocked = EXCLUDED.last_restocked,
            updated_at = EXCLUDED.updated_at
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(receipt.shop_id)
    .bind(receipt.product_id)
    .bind(&receipt.batch_no)
    .bind(&receipt.qty)
    .bind(&receipt.landed_cost)
    .bind(receipt.expiry_date)
    .bind(at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(batch)
}

#[async_trait]
impl InvoiceRepository for PgStore {
    async fn create_invoice(&self, invoice: &ParsedInvoice, job: &ParseJob) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO parsed_invoices (
                id, vendor_id, shop_id, source_type, raw_doc_ref, status, invoice_number,
                invoice_date, currency, total_amount, error_message, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL, $7, NULL, NULL, $8, $8)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.vendor_id)
        .bind(invoice.shop_id)
        .bind(invoice.source_type)
        .bind(&invoice.raw_doc_ref)
        .bind(invoice.status)
        .bind(&invoice.currency)
        .bind(invoice.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO parse_jobs (id, parsed_invoice_id, status, attempts, created_at)
            VALUES ($1, $2, $3, 0, $4)
            "#,
        )
        .bind(job.id)
        .bind(job.parsed_invoice_id)
        .bind(job.status)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_invoice(&self, id: Uuid) -> AppResult<Option<ParsedInvoice>> {
        let invoice = sqlx::query_as::<_, ParsedInvoice>("SELECT * FROM parsed_invoices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(invoice)
    }

    async fn list_lines(&self, invoice_id: Uuid) -> AppResult<Vec<ParsedInvoiceLine>> {
        let lines = sqlx::query_as::<_, ParsedInvoiceLine>(
            "SELECT * FROM parsed_invoice_lines WHERE parsed_invoice_id = $1 ORDER BY line_no",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(lines)
    }

    async fn save_parsed(
        &self,
        invoice_id: Uuid,
        header: &InvoiceHeader,
        lines: &[ParsedInvoiceLine],
        event: &NewOutboxEvent,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_invoice_status(&mut tx, invoice_id)
            .await?
            .ensure_transition(InvoiceStatus::Parsed)?;

        if !lines.is_empty() {
            let mut query_builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO parsed_invoice_lines (
                    id, parsed_invoice_id, line_no, raw_text, description, qty, unit_price,
                    tax_rate, batch_no, expiry_date, suggested_product_id, matched_product_id,
                    match_type, match_confidence, status, resolved_at, created_at
                ) ",
            );
            query_builder.push_values(lines, |mut b, line| {
                b.push_bind(line.id)
                    .push_bind(invoice_id)
                    .push_bind(line.line_no)
                    .push_bind(&line.raw_text)
                    .push_bind(&line.description)
                    .push_bind(&line.qty)
                    .push_bind(&line.unit_price)
                    .push_bind(&line.tax_rate)
                    .push_bind(&line.batch_no)
                    .push_bind(line.expiry_date)
                    .push_bind(line.suggested_product_id)
                    .push_bind(line.matched_product_id)
                    .push_bind(line.match_type)
                    .push_bind(line.match_confidence)
                    .push_bind(line.status)
                    .push_bind(line.resolved_at)
                    .push_bind(line.created_at);
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        sqlx::query(
            r#"
            UPDATE parsed_invoices
            SET status = $2, invoice_number = $3, invoice_date = $4, total_amount = $5,
                parsed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(InvoiceStatus::Parsed)
        .bind(&header.invoice_number)
        .bind(header.invoice_date)
        .bind(&header.total_amount)
        .execute(&mut *tx)
        .await?;

        insert_outbox(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        invoice_id: Uuid,
        message: &str,
        event: &NewOutboxEvent,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_invoice_status(&mut tx, invoice_id)
            .await?
            .ensure_transition(InvoiceStatus::Failed)?;
        sqlx::query(
            "UPDATE parsed_invoices SET status = $2, error_message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(invoice_id)
        .bind(InvoiceStatus::Failed)
        .bind(message)
        .execute(&mut *tx)
        .await?;
        insert_outbox(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn resolve_line(
        &self,
        resolution: &LineResolution,
        event: &NewOutboxEvent,
    ) -> AppResult<ParsedInvoiceLine> {
        let mut tx = self.pool.begin().await?;
        let invoice = sqlx::query_as::<_, ParsedInvoice>(
            "SELECT * FROM parsed_invoices WHERE id = $1 FOR UPDATE",
        )
        .bind(resolution.invoice_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found(format!("parsed invoice {}", resolution.invoice_id)))?;
        if invoice.status != InvoiceStatus::Parsed {
            return Err(AppError::conflict(format!(
                "invoice {} is {}; lines can only be resolved while parsed",
                invoice.id, invoice.status
            )));
        }

        let mut line = sqlx::query_as::<_, ParsedInvoiceLine>(
            "SELECT * FROM parsed_invoice_lines WHERE id = $1 AND parsed_invoice_id = $2 FOR UPDATE",
        )
        .bind(resolution.line_id)
        .bind(resolution.invoice_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found(format!("invoice line {}", resolution.line_id)))?;
        resolution.apply_to(&mut line)?;

        if let ResolvedAction::Matched {
            product_id,
            new_product,
            ..
        } = &resolution.action
        {
            if let Some(product) = new_product {
                sqlx::query(
                    r#"
                    INSERT INTO products (id, name, brand, potency, pack_size, sku, is_active, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(product.id)
                .bind(&product.name)
                .bind(&product.brand)
                .bind(&product.potency)
                .bind(&product.pack_size)
                .bind(&product.sku)
                .bind(product.is_active)
                .bind(product.created_at)
                .execute(&mut *tx)
                .await?;
            }

            if !resolution.normalized_description.is_empty() {
                sqlx::query(
                    r#"
                    INSERT INTO vendor_product_mappings (
                        vendor_id, normalized_description, product_id, confidence, usage_count, last_used_at
                    )
                    VALUES ($1, $2, $3, 1.0, 1, $4)
                    ON CONFLICT (vendor_id, normalized_description) DO UPDATE SET
                        product_id = EXCLUDED.product_id,
                        confidence = EXCLUDED.confidence,
                        usage_count = vendor_product_mappings.usage_count + 1,
                        last_used_at = EXCLUDED.last_used_at
                    "#,
                )
                .bind(invoice.vendor_id)
                .bind(&resolution.normalized_description)
                .bind(product_id)
                .bind(resolution.resolved_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            r#"
            UPDATE parsed_invoice_lines
            SET matched_product_id = $2, suggested_product_id = $3, match_type = $4,
                match_confidence = $5, status = $6, batch_no = $7, expiry_date = $8, resolved_at = $9
            WHERE id = $1
            "#,
        )
        .bind(line.id)
        .bind(line.matched_product_id)
        .bind(line.suggested_product_id)
        .bind(line.match_type)
        .bind(line.match_confidence)
        .bind(line.status)
        .bind(&line.batch_no)
        .bind(line.expiry_date)
        .bind(line.resolved_at)
        .execute(&mut *tx)
        .await?;

        insert_outbox(&mut tx, event).await?;
        tx.commit().await?;
        Ok(line)
    }

    async fn reconciliation_rows(
        &self,
        filter: &ReconciliationFilter,
    ) -> AppResult<Vec<ReconciliationRow>> {
        let mut query_builder = QueryBuilder::<Postgres>::new(
            r#"
            SELECT i.id AS parsed_invoice_id, i.vendor_id, i.shop_id, i.invoice_number,
                   l.id AS line_id, l.line_no, l.description, l.qty, l.unit_price,
                   l.match_type, l.match_confidence, l.suggested_product_id, l.status
            FROM parsed_invoice_lines l
            JOIN parsed_invoices i ON i.id = l.parsed_invoice_id
            WHERE l.status = "#,
        );
        query_builder.push_bind(filter.status);
        if filter.status == LineStatus::Pending {
            query_builder.push(" AND i.status = ");
            query_builder.push_bind(InvoiceStatus::Parsed);
        }
        if let Some(vendor_id) = filter.vendor_id {
            query_builder.push(" AND i.vendor_id = ");
            query_builder.push_bind(vendor_id);
        }
        query_builder.push(" ORDER BY i.created_at, i.id, l.line_no LIMIT ");
        query_builder.push_bind(filter.limit);
        query_builder.push(" OFFSET ");
        query_builder.push_bind(filter.offset);

        let rows = query_builder
            .build_query_as::<ReconciliationRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn find_duplicate(
        &self,
        vendor_id: Uuid,
        invoice_number: &str,
        exclude_id: Uuid,
    ) -> AppResult<Option<ParsedInvoice>> {
        let invoice = sqlx::query_as::<_, ParsedInvoice>(
            r#"
            SELECT * FROM parsed_invoices
            WHERE vendor_id = $1 AND invoice_number = $2 AND id <> $3
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(vendor_id)
        .bind(invoice_number)
        .bind(exclude_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }
}

#[async_trait]
impl ParseJobQueue for PgStore {
    async fn claim_next(&self, worker_id: &str, lease_secs: i64) -> AppResult<Option<ParseJob>> {
        let job = sqlx::query_as::<_, ParseJob>(
            r#"
            WITH next AS (
                SELECT id FROM parse_jobs
                WHERE status = 'queued' OR (status = 'running' AND lease_until < now())
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE parse_jobs j
            SET status = 'running', attempts = j.attempts + 1, claimed_by = $1, locked_at = now(),
                lease_until = now() + make_interval(secs => $2), updated_at = now()
            FROM next
            WHERE j.id = next.id
            RETURNING j.id, j.parsed_invoice_id, j.status, j.attempts, j.last_error,
                      j.locked_at, j.lease_until, j.created_at
            "#,
        )
        .bind(worker_id)
        .bind(lease_secs as f64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn complete(&self, job_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE parse_jobs SET status = 'done', lease_until = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, job_id: Uuid, error: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE parse_jobs
            SET status = 'queued', lease_until = NULL, claimed_by = NULL, last_error = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE parse_jobs
            SET status = 'failed', lease_until = NULL, last_error = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stale_jobs(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<ParseJob>> {
        let jobs = sqlx::query_as::<_, ParseJob>(
            r#"
            SELECT j.id, j.parsed_invoice_id, j.status, j.attempts, j.last_error,
                   j.locked_at, j.lease_until, j.created_at
            FROM parse_jobs j
            JOIN parsed_invoices i ON i.id = j.parsed_invoice_id
            WHERE j.status = 'running' AND j.locked_at < $1 AND i.status = 'processing'
            ORDER BY j.locked_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}

#[async_trait]
impl CatalogRepository for PgStore {
    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(product)
    }

    async fn find_containing(&self, normalized_description: &str) -> AppResult<Option<Product>> {
        // 与 service::matcher::normalize 保持一致的 SQL 规范化
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT * FROM products
            WHERE is_active
              AND position($1 IN trim(regexp_replace(lower(name), '[^a-z0-9]+', ' ', 'g'))) > 0
            ORDER BY length(name), name
            LIMIT 1
            "#,
        )
        .bind(normalized_description)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    async fn fuzzy_candidates(
        &self,
        query: &ProductQuery,
        min_similarity: f64,
        limit: i64,
    ) -> AppResult<Vec<Product>> {
        let q = query.q.to_lowercase();
        let mut query_builder = QueryBuilder::<Postgres>::new(
            "SELECT p.* FROM products p WHERE p.is_active AND GREATEST(similarity(lower(p.name), ",
        );
        query_builder.push_bind(q.clone());
        query_builder.push("), word_similarity(lower(p.name), ");
        query_builder.push_bind(q.clone());
        query_builder.push(")) >= ");
        query_builder.push_bind(min_similarity as f32);
        if let Some(brand) = query.brand.as_deref().filter(|b| !b.trim().is_empty()) {
            query_builder.push(" AND p.brand ILIKE ");
            query_builder.push_bind(format!("%{}%", brand.trim()));
        }
        if let Some(potency) = query.potency.as_deref().filter(|p| !p.trim().is_empty()) {
            query_builder.push(" AND p.potency ILIKE ");
            query_builder.push_bind(potency.trim().to_string());
        }
        query_builder.push(" ORDER BY similarity(lower(p.name), ");
        query_builder.push_bind(q);
        query_builder.push(") DESC, p.name LIMIT ");
        query_builder.push_bind(limit);

        let products = query_builder
            .build_query_as::<Product>()
            .fetch_all(&self.pool)
            .await?;
        Ok(products)
    }

    async fn find_mapping(
        &self,
        vendor_id: Uuid,
        normalized_description: &str,
    ) -> AppResult<Option<VendorProductMapping>> {
        let mapping = sqlx::query_as::<_, VendorProductMapping>(
            r#"
            SELECT m.* FROM vendor_product_mappings m
            JOIN products p ON p.id = m.product_id AND p.is_active
            WHERE m.vendor_id = $1 AND m.normalized_description = $2
            "#,
        )
        .bind(vendor_id)
        .bind(normalized_description)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }

    async fn touch_mapping(&self, vendor_id: Uuid, normalized_description: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE vendor_product_mappings
            SET usage_count = usage_count + 1, last_used_at = now()
            WHERE vendor_id = $1 AND normalized_description = $2
            "#,
        )
        .bind(vendor_id)
        .bind(normalized_description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_product(&self, product: &Product) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, brand, potency, pack_size, sku, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.brand)
        .bind(&product.potency)
        .bind(&product.pack_size)
        .bind(&product.sku)
        .bind(product.is_active)
        .bind(product.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GrnRepository for PgStore {
    async fn insert_draft(
        &self,
        grn: &Grn,
        lines: &[GrnLine],
        event: &NewOutboxEvent,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO purchase_receipts (
                id, receipt_number, parsed_invoice_id, vendor_id, shop_id, status, receipt_date,
                subtotal, tax_total, freight, grand_total, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(grn.id)
        .bind(&grn.receipt_number)
        .bind(grn.parsed_invoice_id)
        .bind(grn.vendor_id)
        .bind(grn.shop_id)
        .bind(grn.status)
        .bind(grn.receipt_date)
        .bind(&grn.subtotal)
        .bind(&grn.tax_total)
        .bind(&grn.freight)
        .bind(&grn.grand_total)
        .bind(grn.created_at)
        .bind(grn.updated_at)
        .execute(&mut *tx)
        .await?;
        insert_grn_lines(&mut tx, lines).await?;
        insert_outbox(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Grn>> {
        let grn = sqlx::query_as::<_, Grn>("SELECT * FROM purchase_receipts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(grn)
    }

    async fn lines(&self, id: Uuid) -> AppResult<Vec<GrnLine>> {
        let lines = sqlx::query_as::<_, GrnLine>(
            "SELECT * FROM purchase_receipt_lines WHERE receipt_id = $1 ORDER BY line_no",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(lines)
    }

    async fn list(&self, status: Option<GrnStatus>, limit: i64, offset: i64) -> AppResult<Vec<Grn>> {
        let mut query_builder = QueryBuilder::<Postgres>::new("SELECT * FROM purchase_receipts");
        if let Some(status) = status {
            query_builder.push(" WHERE status = ");
            query_builder.push_bind(status);
        }
        query_builder.push(" ORDER BY created_at DESC LIMIT ");
        query_builder.push_bind(limit);
        query_builder.push(" OFFSET ");
        query_builder.push_bind(offset);
        let grns = query_builder
            .build_query_as::<Grn>()
            .fetch_all(&self.pool)
            .await?;
        Ok(grns)
    }

    async fn replace_draft(&self, grn: &Grn, lines: &[GrnLine]) -> AppResult<Grn> {
        let mut tx = self.pool.begin().await?;
        lock_grn(&mut tx, grn.id).await?.status.ensure_editable()?;

        sqlx::query("DELETE FROM purchase_receipt_lines WHERE receipt_id = $1")
            .bind(grn.id)
            .execute(&mut *tx)
            .await?;
        insert_grn_lines(&mut tx, lines).await?;

        let updated = sqlx::query_as::<_, Grn>(
            r#"
            UPDATE purchase_receipts
            SET receipt_date = $2, subtotal = $3, tax_total = $4, freight = $5, grand_total = $6,
                updated_at = now()
            WHERE id = $1 AND status = 'draft'
            RETURNING *
            "#,
        )
        .bind(grn.id)
        .bind(grn.receipt_date)
        .bind(&grn.subtotal)
        .bind(&grn.tax_total)
        .bind(&grn.freight)
        .bind(&grn.grand_total)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_draft(&self, id: Uuid) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_grn(&mut tx, id).await?.status.ensure_editable()?;
        sqlx::query("DELETE FROM purchase_receipts WHERE id = $1 AND status = 'draft'")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn confirm(
        &self,
        id: Uuid,
        approved_by: &str,
        at: DateTime<Utc>,
    ) -> AppResult<GrnWithLines> {
        let mut tx = self.pool.begin().await?;
        let grn = lock_grn(&mut tx, id).await?;
        grn.status.ensure_transition(GrnStatus::Confirmed)?;

        if let Some(invoice_id) = grn.parsed_invoice_id {
            let invoice_status = lock_invoice_status(&mut tx, invoice_id).await?;
            let taken = sqlx::query_scalar::<_, bool>(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM purchase_receipts
                    WHERE parsed_invoice_id = $1 AND id <> $2 AND status <> 'draft'
                )
                "#,
            )
            .bind(invoice_id)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            if taken {
                return Err(AppError::conflict(format!(
                    "invoice {} already has a confirmed receipt",
                    invoice_id
                )));
            }
            invoice_status.ensure_transition(InvoiceStatus::Confirmed)?;
            sqlx::query(
                "UPDATE parsed_invoices SET status = $2, confirmed_at = $3, updated_at = $3 WHERE id = $1",
            )
            .bind(invoice_id)
            .bind(InvoiceStatus::Confirmed)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        // 收货单行已被 FOR UPDATE 锁住，此处读到的明细即入库依据
        let lines = sqlx::query_as::<_, GrnLine>(
            "SELECT * FROM purchase_receipt_lines WHERE receipt_id = $1 ORDER BY line_no",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        let receipt = GrnWithLines { grn, lines };
        let receipts = receipt.batch_receipts();
        for batch in &receipts {
            batch.validate()?;
            upsert_batch(&mut tx, batch, at).await?;
        }

        let confirmed = sqlx::query_as::<_, Grn>(
            r#"
            UPDATE purchase_receipts
            SET status = 'confirmed', approved_by = $2, approved_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'draft'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(approved_by)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::transition("grn", receipt.grn.status, GrnStatus::Confirmed))?;

        let event =
            NewOutboxEvent::receipt_event(event_types::RECEIPT_CREATED, &confirmed, &receipt.lines);
        insert_outbox(&mut tx, &event).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let grn = lock_grn(&mut tx, id).await?;
        grn.status.ensure_transition(GrnStatus::Posted)?;

        if !entries.is_empty() {
            let mut query_builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO accounting_entries (id, receipt_id, account, side, amount, memo, created_at) ",
            );
            query_builder.push_values(entries, |mut b, entry| {
                b.push_bind(entry.id)
                    .push_bind(entry.receipt_id)
                    .push_bind(&entry.account)
                    .push_bind(entry.side)
                    .push_bind(&entry.amount)
                    .push_bind(&entry.memo)
                    .push_bind(entry.created_at);
            });
            query_builder.build().execute(&mut *tx).await?;
        }

        let posted = sqlx::query_as::<_, Grn>(
            r#"
            UPDATE purchase_receipts
            SET status = 'posted', posted_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'confirmed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::transition("grn", grn.status, GrnStatus::Posted))?;

        insert_outbox(&mut tx, event).await?;
        tx.commit().await?;
        Ok(posted)
    }

    async fn entries(&self, id: Uuid) -> AppResult<Vec<AccountingEntry>> {
        let entries = sqlx::query_as::<_, AccountingEntry>(
            "SELECT * FROM accounting_entries WHERE receipt_id = $1 ORDER BY side DESC, account",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[async_trait]
impl InventoryRepository for PgStore {
    async fn apply_bulk(
        &self,
        idempotency_key: &str,
        receipts: &[BatchReceipt],
    ) -> AppResult<(bool, Vec<InventoryBatch>)> {
        let mut tx = self.pool.begin().await?;
        let request_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO inventory_update_requests (idempotency_key, request_id)
            VALUES ($1, $2)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING request_id
            "#,
        )
        .bind(idempotency_key)
        .bind(Uuid::new_v4())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(request_id) = request_id else {
            tx.rollback().await?;
            let mut current = Vec::with_capacity(receipts.len());
            for receipt in receipts {
                let batch = sqlx::query_as::<_, InventoryBatch>(
                    r#"
                    SELECT * FROM inventory_batches
                    WHERE shop_id = $1 AND product_id = $2 AND batch_no = $3
                    "#,
                )
                .bind(receipt.shop_id)
                .bind(receipt.product_id)
                .bind(&receipt.batch_no)
                .fetch_optional(&self.pool)
                .await?;
                current.extend(batch);
            }
            return Ok((false, current));
        };

        let at = Utc::now();
        let mut batches = Vec::with_capacity(receipts.len());
        for receipt in receipts {
            batches.push(upsert_batch(&mut tx, receipt, at).await?);
        }
        let event = NewOutboxEvent::batches_updated(request_id, idempotency_key, &batches);
        insert_outbox(&mut tx, &event).await?;
        tx.commit().await?;
        Ok((true, batches))
    }

    async fn list_batches(
        &self,
        shop_id: Option<Uuid>,
        product_id: Option<Uuid>,
    ) -> AppResult<Vec<InventoryBatch>> {
        let mut query_builder = QueryBuilder::<Postgres>::new("SELECT * FROM inventory_batches WHERE TRUE");
        if let Some(shop_id) = shop_id {
            query_builder.push(" AND shop_id = ");
            query_builder.push_bind(shop_id);
        }
        if let Some(product_id) = product_id {
            query_builder.push(" AND product_id = ");
            query_builder.push_bind(product_id);
        }
        query_builder.push(" ORDER BY shop_id, product_id, expiry_date NULLS LAST, batch_no");
        let batches = query_builder
            .build_query_as::<InventoryBatch>()
            .fetch_all(&self.pool)
            .await?;
        Ok(batches)
    }
}

#[async_trait]
impl OutboxRepository for PgStore {
    async fn fetch_unpublished(&self, limit: i64) -> AppResult<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(
            "SELECT * FROM outbox_events WHERE NOT published ORDER BY seq LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn mark_published(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE outbox_events SET published = TRUE, published_at = now() WHERE id = $1 AND NOT published",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> AppResult<()> {
        sqlx::query("UPDATE outbox_events SET attempts = attempts + 1, last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
