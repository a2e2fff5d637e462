mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::{dec, Harness, INVOICE_TEXT};
use purchase_recon_rust::db::ParseJobQueue;
use purchase_recon_rust::error::{AppError, AppResult};
use purchase_recon_rust::models::{
    event_types, InvoiceStatus, LineStatus, MatchType, NewProduct, ParseJobStatus, ProductQuery,
    ReconciliationFilter,
};
use purchase_recon_rust::service::extraction::TextExtractor;
use purchase_recon_rust::service::ingestion::UploadRequest;
use purchase_recon_rust::service::{InvoiceParser, ParseWorker};
use purchase_recon_rust::service::reconciliation::{LineAction, ResolveLineRequest};
use uuid::Uuid;

fn match_request(product_id: Uuid) -> ResolveLineRequest {
    ResolveLineRequest {
        action: LineAction::Match,
        product_id: Some(product_id),
        new_product: None,
        batch_no: None,
        expiry_date: None,
    }
}

#[tokio::test]
async fn upload_returns_processing_before_any_parsing() {
    let h = Harness::new();
    let id = h.upload_as(h.vendor_id, INVOICE_TEXT.as_bytes()).await;

    let parsed = h.ingestion.get_parsed(id).await.unwrap();
    assert_eq!(parsed.invoice.status, InvoiceStatus::Processing);
    assert!(parsed.lines.is_empty());
    assert!(parsed.invoice.raw_doc_ref.starts_with("mem://"));
}

#[tokio::test]
async fn upload_validates_required_fields() {
    let h = Harness::new();
    let missing_file = h
        .ingestion
        .upload(UploadRequest {
            vendor_id: Some(h.vendor_id.to_string()),
            shop_id: Some(h.shop_id.to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(missing_file, AppError::Validation(_)));

    let bad_source = h
        .ingestion
        .upload(UploadRequest {
            vendor_id: Some(h.vendor_id.to_string()),
            shop_id: Some(h.shop_id.to_string()),
            source: Some("fax".into()),
            file_name: None,
            content: Some(b"x".to_vec()),
        })
        .await
        .unwrap_err();
    assert!(matches!(bad_source, AppError::Validation(_)));
}

#[tokio::test]
async fn scenario_a_parses_and_suggests_arnica() {
    let h = Harness::new();
    let (arnica, nux, _) = h.seed_catalog().await;

    let parsed = h.ingest(INVOICE_TEXT).await;
    assert_eq!(parsed.invoice.status, InvoiceStatus::Parsed);
    assert_eq!(parsed.invoice.invoice_number.as_deref(), Some("INV-2026/114"));
    assert_eq!(parsed.invoice.total_amount, Some(dec("2128.60")));
    assert_eq!(parsed.lines.len(), 2);

    let first = &parsed.lines[0];
    assert_eq!(first.qty, dec("12"));
    assert_eq!(first.unit_price, dec("85.00"));
    assert_eq!(first.tax_rate, dec("18"));
    assert_eq!(first.match_type, MatchType::Fuzzy);
    assert_eq!(first.suggested_product_id, Some(arnica));
    assert!(first.matched_product_id.is_none());
    assert!(first.match_confidence > 0.6);
    assert_eq!(first.status, LineStatus::Pending);

    let second = &parsed.lines[1];
    assert_eq!(second.match_type, MatchType::Exact);
    assert_eq!(second.matched_product_id, Some(nux));
    assert_eq!(second.status, LineStatus::Matched);
    assert!(second.match_confidence >= 0.9);

    for line in &parsed.lines {
        assert!(line.is_consistent(), "{:?}", line);
    }

    let events = h.store.outbox_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, event_types::INVOICE_PARSED);
    assert_eq!(events[0].payload["auto_matched"], 1);
}

#[tokio::test]
async fn unrelated_lines_stay_unmatched() {
    let h = Harness::new();
    h.seed_catalog().await;
    let parsed = h.ingest("Calendula Q – 3 units @ 140\n").await;
    let line = &parsed.lines[0];
    assert_eq!(line.match_type, MatchType::Unmatched);
    assert_eq!(line.match_confidence, 0.0);
    assert!(line.suggested_product_id.is_none());
}

#[tokio::test]
async fn scenario_b_manual_match_is_learned_for_the_vendor() {
    let h = Harness::new();
    let (arnica, _, _) = h.seed_catalog().await;
    let parsed = h.ingest(INVOICE_TEXT).await;
    let line = &parsed.lines[0];

    let resolved = h
        .reconciliation
        .resolve(parsed.invoice.id, line.id, match_request(arnica))
        .await
        .unwrap();
    assert_eq!(resolved.status, LineStatus::Matched);
    assert_eq!(resolved.matched_product_id, Some(arnica));
    assert_eq!(resolved.match_type, MatchType::Manual);
    assert_eq!(resolved.match_confidence, 1.0);
    assert!(resolved.suggested_product_id.is_none());

    let mappings = h.store.mappings().await;
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].vendor_id, h.vendor_id);
    assert_eq!(mappings[0].normalized_description, "sbl arnica 30c 10ml");
    assert_eq!(mappings[0].product_id, arnica);

    // 同一供应商的下一张发票直接命中映射
    let next = h.ingest(INVOICE_TEXT).await;
    assert_eq!(next.lines[0].status, LineStatus::Matched);
    assert_eq!(next.lines[0].matched_product_id, Some(arnica));
    assert_eq!(next.lines[0].match_confidence, 1.0);
    assert_eq!(h.store.mappings().await[0].usage_count, 2);

    // 其他供应商不受影响
    let other_vendor = Uuid::new_v4();
    let id = h.upload_as(other_vendor, INVOICE_TEXT.as_bytes()).await;
    h.drain_jobs().await;
    let other = h.ingestion.get_parsed(id).await.unwrap();
    assert_eq!(other.lines[0].match_type, MatchType::Fuzzy);
}

#[tokio::test]
async fn resolving_twice_is_a_conflict_and_writes_nothing() {
    let h = Harness::new();
    let (arnica, nux, _) = h.seed_catalog().await;
    let parsed = h.ingest(INVOICE_TEXT).await;
    let line = &parsed.lines[0];

    h.reconciliation
        .resolve(parsed.invoice.id, line.id, match_request(arnica))
        .await
        .unwrap();
    let events_before = h.store.outbox_events().await.len();

    let err = h
        .reconciliation
        .resolve(parsed.invoice.id, line.id, match_request(nux))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.store.mappings().await[0].product_id, arnica);
    assert_eq!(h.store.outbox_events().await.len(), events_before);
}

#[tokio::test]
async fn create_action_adds_a_product_and_matches() {
    let h = Harness::new();
    h.seed_catalog().await;
    let parsed = h.ingest("Calendula Q – 3 units @ 140\n").await;
    let before = h.store.product_count().await;

    let resolved = h
        .reconciliation
        .resolve(
            parsed.invoice.id,
            parsed.lines[0].id,
            ResolveLineRequest {
                action: LineAction::Create,
                product_id: None,
                new_product: Some(NewProduct {
                    name: "Calendula Q".into(),
                    brand: Some("SBL".into()),
                    potency: Some("Q".into()),
                    pack_size: Some("30ml".into()),
                    sku: None,
                }),
                batch_no: Some("CQ-1".into()),
                expiry_date: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(resolved.match_type, MatchType::Created);
    assert_eq!(resolved.batch_no.as_deref(), Some("CQ-1"));
    assert_eq!(h.store.product_count().await, before + 1);

    let found = h
        .matcher
        .search(&ProductQuery {
            q: "calendula".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found[0].product.id, resolved.matched_product_id.unwrap());
}

#[tokio::test]
async fn match_requires_an_existing_product() {
    let h = Harness::new();
    h.seed_catalog().await;
    let parsed = h.ingest(INVOICE_TEXT).await;
    let err = h
        .reconciliation
        .resolve(parsed.invoice.id, parsed.lines[0].id, match_request(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(h.store.mappings().await.is_empty());
}

#[tokio::test]
async fn reconciliation_queue_groups_pending_lines_by_invoice() {
    let h = Harness::new();
    h.seed_catalog().await;
    let first = h.ingest(INVOICE_TEXT).await;
    let second = h.ingest("Calendula Q – 3 units @ 140\nRhus Tox 30C – 2 units @ 60\n").await;

    let groups = h.reconciliation.queue(ReconciliationFilter::default()).await.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].parsed_invoice_id, first.invoice.id);
    assert_eq!(groups[0].line_count, 1);
    assert_eq!(groups[1].parsed_invoice_id, second.invoice.id);
    assert_eq!(groups[1].line_count, 2);
    assert!(groups
        .iter()
        .flat_map(|g| g.lines.iter())
        .all(|row| row.status == LineStatus::Pending));
}

#[tokio::test]
async fn validation_report_lists_blockers_and_warnings() {
    let h = Harness::new();
    let (arnica, _, _) = h.seed_catalog().await;
    let parsed = h.ingest(INVOICE_TEXT).await;

    let report = h.reconciliation.validate(parsed.invoice.id).await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.summary.pending, 1);
    assert_eq!(report.summary.matched, 1);

    h.reconciliation
        .resolve(parsed.invoice.id, parsed.lines[0].id, match_request(arnica))
        .await
        .unwrap();
    let report = h.reconciliation.validate(parsed.invoice.id).await.unwrap();
    assert!(report.valid, "{:?}", report.errors);
    // 12*85*1.18 + 5*185 = 1203.60 + 925.00
    assert_eq!(report.summary.lines_total, dec("2128.60"));
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    // 同号发票重复上传给出警告
    let dup = h.ingest(INVOICE_TEXT).await;
    let report = h.reconciliation.validate(dup.invoice.id).await.unwrap();
    assert!(report.warnings.iter().any(|w| w.contains("INV-2026/114")));
}

#[tokio::test]
async fn extraction_failure_is_retried_then_marks_the_invoice_failed() {
    let h = Harness::new();
    let id = h.upload_as(h.vendor_id, &[0xff, 0xfe, 0x00, 0x01]).await;

    let processed = h.drain_jobs().await;
    assert_eq!(processed as i32, h.config.parsing.max_attempts);

    let invoice = h.ingestion.get_parsed(id).await.unwrap().invoice;
    assert_eq!(invoice.status, InvoiceStatus::Failed);
    assert!(invoice.error_message.unwrap().contains("UTF-8"));

    let events = h.store.outbox_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, event_types::INVOICE_PARSE_FAILED);
    assert!(h.store.claim_next("test", 60).await.unwrap().is_none());
}

#[tokio::test]
async fn document_without_items_fails_without_retry() {
    let h = Harness::new();
    let id = h
        .upload_as(h.vendor_id, b"Invoice No: 77\nGrand Total: 0.00\n")
        .await;
    assert_eq!(h.drain_jobs().await, 1);
    let invoice = h.ingestion.get_parsed(id).await.unwrap().invoice;
    assert_eq!(invoice.status, InvoiceStatus::Failed);
}

/// 永远不返回的提取服务
struct StalledExtractor;

#[async_trait]
impl TextExtractor for StalledExtractor {
    async fn extract(&self, _file_name: &str, _content: &[u8]) -> AppResult<String> {
        std::future::pending::<AppResult<String>>().await
    }
}

#[tokio::test]
async fn processing_timeout_fails_the_invoice_and_ends_the_job() {
    let h = Harness::new();
    let mut parsing = h.config.parsing.clone();
    parsing.processing_timeout_secs = 1;
    parsing.max_attempts = 1;
    let worker = ParseWorker::new(
        h.repos.invoices.clone(),
        h.repos.jobs.clone(),
        h.documents.clone(),
        Arc::new(StalledExtractor),
        Arc::new(InvoiceParser::new().unwrap()),
        h.matcher.clone(),
        parsing,
    );
    let id = h.upload_as(h.vendor_id, INVOICE_TEXT.as_bytes()).await;

    assert!(worker.process_next().await.unwrap());

    let invoice = h.ingestion.get_parsed(id).await.unwrap().invoice;
    assert_eq!(invoice.status, InvoiceStatus::Failed);
    assert!(invoice.error_message.unwrap().contains("exceeded 1s"));
    let events = h.store.outbox_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, event_types::INVOICE_PARSE_FAILED);

    let jobs = h.store.jobs_for(id).await;
    assert_eq!(jobs[0].status, ParseJobStatus::Failed);
    assert!(jobs[0].lease_until.is_none());
    assert!(h.store.claim_next("test", 60).await.unwrap().is_none());
}

#[tokio::test]
async fn hung_claimed_jobs_are_swept() {
    let h = Harness::new();
    let id = h.upload_as(h.vendor_id, INVOICE_TEXT.as_bytes()).await;
    // 某个 worker 领取后失联，租约尚未过期
    h.store.claim_next("lost-worker", 3600).await.unwrap().unwrap();
    h.store.backdate_claim(id, Utc::now() - Duration::hours(1)).await;

    assert_eq!(h.worker.sweep_stale().await.unwrap(), 1);
    let invoice = h.ingestion.get_parsed(id).await.unwrap().invoice;
    assert_eq!(invoice.status, InvoiceStatus::Failed);
    assert_eq!(h.store.jobs_for(id).await[0].status, ParseJobStatus::Failed);
    assert!(h.lines(id).await.is_empty());

    // 已清理的任务不会重复计数
    assert_eq!(h.worker.sweep_stale().await.unwrap(), 0);
}

#[tokio::test]
async fn queued_invoices_are_not_swept_however_old() {
    let h = Harness::new();
    h.seed_catalog().await;
    let id = h.upload_as(h.vendor_id, INVOICE_TEXT.as_bytes()).await;
    h.store.backdate_invoice(id, Utc::now() - Duration::hours(6)).await;

    assert_eq!(h.worker.sweep_stale().await.unwrap(), 0);
    h.drain_jobs().await;
    let invoice = h.ingestion.get_parsed(id).await.unwrap().invoice;
    assert_eq!(invoice.status, InvoiceStatus::Parsed);
}
