//! 发票上传与后台解析
//!
//! 上传只落库 processing 状态的发票和一条 parse_jobs 记录，立即返回；
//! [`ParseWorker`] 轮询任务表完成 提取 -> 解析 -> 匹配 -> 落库。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ParsingConfig;
use crate::db::{InvoiceRepository, ParseJobQueue};
use crate::error::{AppError, AppResult};
use crate::models::{
    InvoiceStatus, NewOutboxEvent, ParseJob, ParsedInvoice, ParsedInvoiceLine, SourceType,
};
use crate::service::extraction::TextExtractor;
use crate::service::matcher::ProductMatcher;
use crate::service::parser::InvoiceParser;
use crate::service::storage::DocumentStore;

/// 上传表单 (multipart 字段原样收集，校验在服务层)
#[derive(Debug, Default)]
pub struct UploadRequest {
    pub vendor_id: Option<String>,
    pub shop_id: Option<String>,
    pub source: Option<String>,
    pub file_name: Option<String>,
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceWithLines {
    pub invoice: ParsedInvoice,
    pub lines: Vec<ParsedInvoiceLine>,
}

fn required_uuid(field: &str, value: Option<&str>) -> AppResult<Uuid> {
    let raw = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::validation(format!("{} is required", field)))?;
    Uuid::parse_str(raw).map_err(|_| AppError::validation(format!("{} must be a UUID", field)))
}

pub struct IngestionService {
    invoices: Arc<dyn InvoiceRepository>,
    documents: Arc<dyn DocumentStore>,
    max_upload_bytes: usize,
    default_currency: String,
}

impl IngestionService {
    pub fn new(
        invoices: Arc<dyn InvoiceRepository>,
        documents: Arc<dyn DocumentStore>,
        max_upload_bytes: usize,
        default_currency: String,
    ) -> Self {
        Self {
            invoices,
            documents,
            max_upload_bytes,
            default_currency,
        }
    }

    /// 校验上传 -> 保存原件 -> 创建 processing 发票 + 解析任务
    pub async fn upload(&self, req: UploadRequest) -> AppResult<ParsedInvoice> {
        let content = req
            .content
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::validation("file is required"))?;
        if content.len() > self.max_upload_bytes {
            return Err(AppError::validation(format!(
                "file exceeds {} bytes",
                self.max_upload_bytes
            )));
        }
        let vendor_id = required_uuid("vendor_id", req.vendor_id.as_deref())?;
        let shop_id = required_uuid("shop_id", req.shop_id.as_deref())?;
        let source = match req.source.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.parse::<SourceType>()?,
            None => SourceType::Manual,
        };
        let file_name = req.file_name.unwrap_or_else(|| "invoice".to_string());

        let mut invoice = ParsedInvoice::new_processing(
            vendor_id,
            shop_id,
            source,
            String::new(),
            &self.default_currency,
        );
        invoice.raw_doc_ref = self
            .documents
            .put(&format!("{}-{}", invoice.id, file_name), &content)
            .await?;

        if let Err(e) = self
            .invoices
            .create_invoice(&invoice, &ParseJob::queued(invoice.id))
            .await
        {
            if let Err(cleanup) = self.documents.delete(&invoice.raw_doc_ref).await {
                tracing::warn!(doc_ref = %invoice.raw_doc_ref, "原件清理失败: {}", cleanup);
            }
            return Err(e);
        }
        tracing::info!(
            invoice_id = %invoice.id,
            vendor_id = %vendor_id,
            bytes = content.len(),
            "发票已接收，等待解析"
        );
        Ok(invoice)
    }

    pub async fn get_parsed(&self, id: Uuid) -> AppResult<InvoiceWithLines> {
        let invoice = self
            .invoices
            .get_invoice(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("parsed invoice {}", id)))?;
        let lines = self.invoices.list_lines(id).await?;
        Ok(InvoiceWithLines { invoice, lines })
    }
}

/// 可重试: 外部服务失败或超时；其余错误直接判定失败
fn is_retryable(err: &AppError) -> bool {
    matches!(err, AppError::ExternalService(_) | AppError::Persistence(_))
}

/// 后台解析 worker
pub struct ParseWorker {
    invoices: Arc<dyn InvoiceRepository>,
    jobs: Arc<dyn ParseJobQueue>,
    documents: Arc<dyn DocumentStore>,
    extractor: Arc<dyn TextExtractor>,
    parser: Arc<InvoiceParser>,
    matcher: Arc<ProductMatcher>,
    config: ParsingConfig,
    worker_id: String,
}

impl ParseWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoices: Arc<dyn InvoiceRepository>,
        jobs: Arc<dyn ParseJobQueue>,
        documents: Arc<dyn DocumentStore>,
        extractor: Arc<dyn TextExtractor>,
        parser: Arc<InvoiceParser>,
        matcher: Arc<ProductMatcher>,
        config: ParsingConfig,
    ) -> Self {
        Self {
            invoices,
            jobs,
            documents,
            extractor,
            parser,
            matcher,
            config,
            worker_id: format!("parse-worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    /// 常驻循环，由 `tokio::spawn` 启动
    pub async fn run(&self) {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(
            worker_id = %self.worker_id,
            "ParseWorker started (poll interval={:?}, max_attempts={})",
            interval,
            self.config.max_attempts
        );
        loop {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = self.sweep_stale().await {
                        tracing::error!("超时发票清理失败: {}", e);
                    }
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    tracing::error!("解析任务领取失败: {}", e);
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    /// 领取并处理一个任务；没有可领取任务时返回 false
    pub async fn process_next(&self) -> AppResult<bool> {
        let Some(job) = self
            .jobs
            .claim_next(&self.worker_id, self.config.lease_secs)
            .await?
        else {
            return Ok(false);
        };
        self.process_job(job).await?;
        Ok(true)
    }

    async fn process_job(&self, job: ParseJob) -> AppResult<()> {
        let invoice = match self.invoices.get_invoice(job.parsed_invoice_id).await? {
            Some(invoice) => invoice,
            None => {
                self.jobs.fail(job.id, "parsed invoice no longer exists").await?;
                return Ok(());
            }
        };
        if invoice.status != InvoiceStatus::Processing {
            // 已被超时清理或其他 worker 处理完
            self.jobs.complete(job.id).await?;
            return Ok(());
        }
        if job.attempts > self.config.max_attempts {
            return self
                .give_up(&job, &invoice, "exceeded maximum parse attempts")
                .await;
        }

        let timeout = Duration::from_secs(self.config.processing_timeout_secs);
        let outcome = match tokio::time::timeout(timeout, self.parse_invoice(&invoice)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::ExternalService(format!(
                "processing exceeded {}s",
                self.config.processing_timeout_secs
            ))),
        };

        match outcome {
            Ok(line_count) => {
                self.jobs.complete(job.id).await?;
                tracing::info!(
                    invoice_id = %invoice.id,
                    lines = line_count,
                    attempt = job.attempts,
                    "发票解析完成"
                );
            }
            Err(e) if is_retryable(&e) && job.attempts < self.config.max_attempts => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    attempt = job.attempts,
                    "发票解析失败，稍后重试: {}",
                    e
                );
                self.jobs.release(job.id, &e.to_string()).await?;
            }
            Err(e) => {
                self.give_up(&job, &invoice, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn give_up(&self, job: &ParseJob, invoice: &ParsedInvoice, message: &str) -> AppResult<()> {
        tracing::error!(invoice_id = %invoice.id, attempt = job.attempts, "发票解析失败: {}", message);
        let event = NewOutboxEvent::invoice_parse_failed(invoice.id, message);
        match self.invoices.mark_failed(invoice.id, message, &event).await {
            Ok(()) | Err(AppError::InvalidStateTransition { .. }) => {}
            Err(e) => return Err(e),
        }
        self.jobs.fail(job.id, message).await
    }

    async fn parse_invoice(&self, invoice: &ParsedInvoice) -> AppResult<usize> {
        let content = self.documents.get(&invoice.raw_doc_ref).await?;
        let file_name = invoice
            .raw_doc_ref
            .rsplit('/')
            .next()
            .unwrap_or(&invoice.raw_doc_ref);
        let text = self.extractor.extract(file_name, &content).await?;

        let doc = self.parser.parse(&text);
        if doc.lines.is_empty() {
            return Err(AppError::validation("no line items found in document"));
        }
        let lines = self
            .matcher
            .match_candidates(invoice.vendor_id, invoice.id, doc.lines)
            .await?;

        let event = NewOutboxEvent::invoice_parsed(invoice, &lines);
        self.invoices
            .save_parsed(invoice.id, &doc.header, &lines, &event)
            .await?;
        Ok(lines.len())
    }

    /// 领取后超过两倍处理超时仍未结束的任务: 发票置为 failed，任务终止
    ///
    /// 仍在排队或等待重试的任务不受影响，无论发票创建了多久。
    pub async fn sweep_stale(&self) -> AppResult<usize> {
        let max_age = chrono::Duration::seconds(2 * self.config.processing_timeout_secs as i64);
        let stale = self.jobs.stale_jobs(Utc::now() - max_age).await?;
        let mut failed = 0;
        for job in stale {
            let id = job.parsed_invoice_id;
            let message = "processing timed out";
            let event = NewOutboxEvent::invoice_parse_failed(id, message);
            match self.invoices.mark_failed(id, message, &event).await {
                Ok(()) => {
                    failed += 1;
                    tracing::warn!(invoice_id = %id, job_id = %job.id, "发票处理超时，已置为 failed");
                }
                Err(AppError::InvalidStateTransition { .. }) => {}
                Err(e) => return Err(e),
            }
            self.jobs.fail(job.id, message).await?;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceHeader, LineResolution, ReconciliationFilter, ReconciliationRow};
    use crate::service::storage::MemoryDocumentStore;
    use async_trait::async_trait;

    /// 写发票时总是失败的仓储
    struct RejectingInvoices;

    #[async_trait]
    impl InvoiceRepository for RejectingInvoices {
        async fn create_invoice(&self, _: &ParsedInvoice, _: &ParseJob) -> AppResult<()> {
            Err(AppError::Persistence("connection reset".into()))
        }

        async fn get_invoice(&self, _: Uuid) -> AppResult<Option<ParsedInvoice>> {
            Ok(None)
        }

        async fn list_lines(&self, _: Uuid) -> AppResult<Vec<ParsedInvoiceLine>> {
            Ok(Vec::new())
        }

        async fn save_parsed(
            &self,
            _: Uuid,
            _: &InvoiceHeader,
            _: &[ParsedInvoiceLine],
            _: &NewOutboxEvent,
        ) -> AppResult<()> {
            unreachable!()
        }

        async fn mark_failed(&self, _: Uuid, _: &str, _: &NewOutboxEvent) -> AppResult<()> {
            unreachable!()
        }

        async fn resolve_line(
            &self,
            _: &LineResolution,
            _: &NewOutboxEvent,
        ) -> AppResult<ParsedInvoiceLine> {
            unreachable!()
        }

        async fn reconciliation_rows(
            &self,
            _: &ReconciliationFilter,
        ) -> AppResult<Vec<ReconciliationRow>> {
            unreachable!()
        }

        async fn find_duplicate(
            &self,
            _: Uuid,
            _: &str,
            _: Uuid,
        ) -> AppResult<Option<ParsedInvoice>> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn failed_insert_removes_the_stored_document() {
        let documents = Arc::new(MemoryDocumentStore::new());
        let service = IngestionService::new(
            Arc::new(RejectingInvoices),
            documents.clone(),
            1024,
            "INR".into(),
        );
        let err = service
            .upload(UploadRequest {
                vendor_id: Some(Uuid::new_v4().to_string()),
                shop_id: Some(Uuid::new_v4().to_string()),
                source: None,
                file_name: Some("inv.txt".into()),
                content: Some(b"Invoice No: 1".to_vec()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
        assert!(documents.is_empty());
    }

    #[test]
    fn uuid_fields_are_validated() {
        assert!(matches!(
            required_uuid("vendor_id", None),
            Err(AppError::Validation(_))
        ));
        assert!(required_uuid("vendor_id", Some("not-a-uuid")).is_err());
        let id = Uuid::new_v4();
        assert_eq!(required_uuid("shop_id", Some(&id.to_string())).unwrap(), id);
    }

    #[test]
    fn only_transient_errors_are_retried() {
        assert!(is_retryable(&AppError::ExternalService("down".into())));
        assert!(!is_retryable(&AppError::validation("empty")));
    }
}
