//! 按聚合划分的仓储接口
//!
//! 每个方法是一个完整的持久化步骤: 需要多表写入的 (确认收货、对账、解析完成)
//! 由实现方放在同一个事务里完成，服务层不感知事务。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    AccountingEntry, BatchReceipt, Grn, GrnLine, GrnStatus, GrnWithLines, InventoryBatch,
    InvoiceHeader, LineResolution, NewOutboxEvent, OutboxEvent, ParseJob, ParsedInvoice,
    ParsedInvoiceLine, Product, ProductQuery, ReconciliationFilter, ReconciliationRow,
    VendorProductMapping,
};

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// 写入 processing 状态的发票，并在同一事务中登记解析任务
    async fn create_invoice(&self, invoice: &ParsedInvoice, job: &ParseJob) -> AppResult<()>;

    async fn get_invoice(&self, id: Uuid) -> AppResult<Option<ParsedInvoice>>;

    async fn list_lines(&self, invoice_id: Uuid) -> AppResult<Vec<ParsedInvoiceLine>>;

    /// 写入明细行 + 抬头，状态 processing -> parsed，并记录 invoice.parsed 事件
    async fn save_parsed(
        &self,
        invoice_id: Uuid,
        header: &InvoiceHeader,
        lines: &[ParsedInvoiceLine],
        event: &NewOutboxEvent,
    ) -> AppResult<()>;

    /// processing -> failed，记录错误信息
    async fn mark_failed(
        &self,
        invoice_id: Uuid,
        message: &str,
        event: &NewOutboxEvent,
    ) -> AppResult<()>;

    /// 对账动作: 行状态、(新商品)、供应商映射 upsert、事件，同一事务内完成
    async fn resolve_line(
        &self,
        resolution: &LineResolution,
        event: &NewOutboxEvent,
    ) -> AppResult<ParsedInvoiceLine>;

    async fn reconciliation_rows(
        &self,
        filter: &ReconciliationFilter,
    ) -> AppResult<Vec<ReconciliationRow>>;

    /// 同供应商、同发票号的其他发票
    async fn find_duplicate(
        &self,
        vendor_id: Uuid,
        invoice_number: &str,
        exclude_id: Uuid,
    ) -> AppResult<Option<ParsedInvoice>>;
}

/// 持久化解析任务队列
#[async_trait]
pub trait ParseJobQueue: Send + Sync {
    /// 领取下一个可执行任务 (queued，或租约已过期的 running)，attempts + 1
    async fn claim_next(&self, worker_id: &str, lease_secs: i64) -> AppResult<Option<ParseJob>>;

    async fn complete(&self, job_id: Uuid) -> AppResult<()>;

    /// 可重试失败: 释放租约，保留错误
    async fn release(&self, job_id: Uuid, error: &str) -> AppResult<()>;

    /// 终止失败
    async fn fail(&self, job_id: Uuid, error: &str) -> AppResult<()>;

    /// 领取时间早于 cutoff 仍在运行、且发票仍为 processing 的任务
    async fn stale_jobs(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<ParseJob>>;
}

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_product(&self, id: Uuid) -> AppResult<Option<Product>>;

    /// 规范化描述包含在规范化商品名中的在售商品 (名字最短者优先)
    async fn find_containing(&self, normalized_description: &str) -> AppResult<Option<Product>>;

    /// 模糊检索候选 (粗筛，精排在服务层)
    async fn fuzzy_candidates(
        &self,
        query: &ProductQuery,
        min_similarity: f64,
        limit: i64,
    ) -> AppResult<Vec<Product>>;

    async fn find_mapping(
        &self,
        vendor_id: Uuid,
        normalized_description: &str,
    ) -> AppResult<Option<VendorProductMapping>>;

    async fn touch_mapping(&self, vendor_id: Uuid, normalized_description: &str) -> AppResult<()>;

    async fn insert_product(&self, product: &Product) -> AppResult<()>;
}

#[async_trait]
pub trait GrnRepository: Send + Sync {
    async fn insert_draft(
        &self,
        grn: &Grn,
        lines: &[GrnLine],
        event: &NewOutboxEvent,
    ) -> AppResult<()>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Grn>>;

    async fn lines(&self, id: Uuid) -> AppResult<Vec<GrnLine>>;

    async fn list(&self, status: Option<GrnStatus>, limit: i64, offset: i64) -> AppResult<Vec<Grn>>;

    /// 替换草稿明细与合计；非草稿返回 Conflict
    async fn replace_draft(&self, grn: &Grn, lines: &[GrnLine]) -> AppResult<Grn>;

    async fn delete_draft(&self, id: Uuid) -> AppResult<()>;

    /// draft -> confirmed: 锁定收货单后重新读取明细，据此递增批次、发票置 confirmed、
    /// 写 purchase.receipt.created 事件，同一事务内完成。
    ///
    /// 发票已有其他非草稿收货单时返回 Conflict。
    async fn confirm(
        &self,
        id: Uuid,
        approved_by: &str,
        at: DateTime<Utc>,
    ) -> AppResult<GrnWithLines>;

    /// confirmed -> posted: 记账分录 + 事件，同一事务内完成
    async fn post(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        entries: &[AccountingEntry],
        event: &NewOutboxEvent,
    ) -> AppResult<Grn>;

    async fn entries(&self, id: Uuid) -> AppResult<Vec<AccountingEntry>>;
}

#[async_trait]
pub trait InventoryRepository: Send + Sync {
    /// 批量递增；同一 idempotency_key 只生效一次，重复请求返回当前批次
    async fn apply_bulk(
        &self,
        idempotency_key: &str,
        receipts: &[BatchReceipt],
    ) -> AppResult<(bool, Vec<InventoryBatch>)>;

    async fn list_batches(
        &self,
        shop_id: Option<Uuid>,
        product_id: Option<Uuid>,
    ) -> AppResult<Vec<InventoryBatch>>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// 未发布事件，按写入顺序
    async fn fetch_unpublished(&self, limit: i64) -> AppResult<Vec<OutboxEvent>>;

    async fn mark_published(&self, id: Uuid) -> AppResult<()>;

    async fn record_failure(&self, id: Uuid, error: &str) -> AppResult<()>;
}
