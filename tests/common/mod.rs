#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::Utc;
use uuid::Uuid;

use purchase_recon_rust::db::{CatalogRepository, InvoiceRepository, MemoryStore, Repositories};
use purchase_recon_rust::models::{ParsedInvoiceLine, Product};
use purchase_recon_rust::service::extraction::PlainTextExtractor;
use purchase_recon_rust::service::ingestion::{InvoiceWithLines, UploadRequest};
use purchase_recon_rust::service::storage::MemoryDocumentStore;
use purchase_recon_rust::service::{
    GrnService, IngestionService, InventoryService, InvoiceParser, ParseWorker, ProductMatcher,
    ReconciliationService,
};
use purchase_recon_rust::AppConfig;

pub const INVOICE_TEXT: &str = "Invoice No: INV-2026/114\n\
Date: 03/10/2026\n\
SBL Arnica 30C 10ml – 12 units @ 85.00, tax 18%\n\
Nux Vomica 200C - 5 pcs @ 185.00\n\
Grand Total: 2128.60\n";

pub fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

/// 内存存储上的完整服务装配
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub repos: Repositories,
    pub documents: Arc<MemoryDocumentStore>,
    pub matcher: Arc<ProductMatcher>,
    pub config: AppConfig,
    pub ingestion: IngestionService,
    pub worker: ParseWorker,
    pub reconciliation: ReconciliationService,
    pub grns: GrnService,
    pub inventory: InventoryService,
    pub vendor_id: Uuid,
    pub shop_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.database.url = "memory://".to_string();

        let store = Arc::new(MemoryStore::new());
        let repos = Repositories::from_store(store.clone());
        let documents = Arc::new(MemoryDocumentStore::new());
        let matcher = Arc::new(ProductMatcher::new(repos.catalog.clone(), config.matcher.clone()));

        let ingestion = IngestionService::new(
            repos.invoices.clone(),
            documents.clone(),
            config.storage.max_upload_bytes,
            config.parsing.default_currency.clone(),
        );
        let worker = ParseWorker::new(
            repos.invoices.clone(),
            repos.jobs.clone(),
            documents.clone(),
            Arc::new(PlainTextExtractor),
            Arc::new(InvoiceParser::new().unwrap()),
            matcher.clone(),
            config.parsing.clone(),
        );
        let reconciliation = ReconciliationService::new(repos.invoices.clone(), repos.catalog.clone());
        let grns = GrnService::new(repos.grns.clone(), repos.invoices.clone(), config.accounting.clone());
        let inventory = InventoryService::new(repos.inventory.clone());

        Self {
            store,
            repos,
            documents,
            matcher,
            config,
            ingestion,
            worker,
            reconciliation,
            grns,
            inventory,
            vendor_id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
        }
    }

    pub async fn seed_product(&self, name: &str, potency: Option<&str>) -> Uuid {
        let product = Product {
            id: Uuid::new_v4(),
            name: name.to_string(),
            brand: None,
            potency: potency.map(str::to_string),
            pack_size: None,
            sku: None,
            is_active: true,
            created_at: Utc::now(),
        };
        self.store.insert_product(&product).await.unwrap();
        product.id
    }

    /// 默认目录: Arnica Montana 30C, Nux Vomica 200C, Belladonna 200C
    pub async fn seed_catalog(&self) -> (Uuid, Uuid, Uuid) {
        (
            self.seed_product("Arnica Montana 30C", Some("30C")).await,
            self.seed_product("Nux Vomica 200C", Some("200C")).await,
            self.seed_product("Belladonna 200C", Some("200C")).await,
        )
    }

    pub async fn upload_as(&self, vendor_id: Uuid, content: &[u8]) -> Uuid {
        let invoice = self
            .ingestion
            .upload(UploadRequest {
                vendor_id: Some(vendor_id.to_string()),
                shop_id: Some(self.shop_id.to_string()),
                source: Some("email".to_string()),
                file_name: Some("invoice.txt".to_string()),
                content: Some(content.to_vec()),
            })
            .await
            .unwrap();
        invoice.id
    }

    /// 处理队列直到没有可领取的任务
    pub async fn drain_jobs(&self) -> usize {
        let mut processed = 0;
        while self.worker.process_next().await.unwrap() {
            processed += 1;
        }
        processed
    }

    /// 上传并同步跑完解析
    pub async fn ingest(&self, text: &str) -> InvoiceWithLines {
        let id = self.upload_as(self.vendor_id, text.as_bytes()).await;
        self.drain_jobs().await;
        self.ingestion.get_parsed(id).await.unwrap()
    }

    pub async fn lines(&self, invoice_id: Uuid) -> Vec<ParsedInvoiceLine> {
        self.store.list_lines(invoice_id).await.unwrap()
    }
}
