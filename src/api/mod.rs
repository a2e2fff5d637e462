pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;

use crate::config::AppConfig;
use crate::db::Repositories;
use crate::service::{
    DocumentStore, GrnService, IngestionService, InventoryService, ProductMatcher,
    ReconciliationService,
};

/// multipart 编码与其他表单字段的余量
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionService>,
    pub matcher: Arc<ProductMatcher>,
    pub reconciliation: Arc<ReconciliationService>,
    pub grns: Arc<GrnService>,
    pub inventory: Arc<InventoryService>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        repos: &Repositories,
        documents: Arc<dyn DocumentStore>,
        matcher: Arc<ProductMatcher>,
        config: &AppConfig,
    ) -> Self {
        Self {
            ingestion: Arc::new(IngestionService::new(
                repos.invoices.clone(),
                documents,
                config.storage.max_upload_bytes,
                config.parsing.default_currency.clone(),
            )),
            matcher,
            reconciliation: Arc::new(ReconciliationService::new(
                repos.invoices.clone(),
                repos.catalog.clone(),
            )),
            grns: Arc::new(GrnService::new(
                repos.grns.clone(),
                repos.invoices.clone(),
                config.accounting.clone(),
            )),
            inventory: Arc::new(InventoryService::new(repos.inventory.clone())),
            max_upload_bytes: config.storage.max_upload_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD;

    let invoices = Router::new()
        .route("/invoices/upload", post(handlers::upload_invoice))
        .route("/invoices/:id/parsed", get(handlers::get_parsed_invoice))
        .route("/invoices/:id/validation", get(handlers::validate_invoice))
        .route("/invoices/:id/lines/:line_id/match", post(handlers::resolve_line));

    let purchases = Router::new()
        .route("/purchases/reconciliations", get(handlers::reconciliation_queue))
        .route("/purchases/grn", post(handlers::create_grn).get(handlers::list_grns))
        .route(
            "/purchases/grn/:id",
            get(handlers::get_grn)
                .put(handlers::update_grn)
                .delete(handlers::delete_grn),
        )
        .route("/purchases/grn/:id/confirm", post(handlers::confirm_grn))
        .route("/purchases/grn/:id/post", post(handlers::post_grn))
        .route("/purchases/grn/:id/export", get(handlers::export_grn));

    let inventory = Router::new()
        .route("/inventory/batches/bulk-update", post(handlers::bulk_update_batches))
        .route("/inventory/batches", get(handlers::list_batches));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/products/search", get(handlers::search_products))
        .merge(invoices)
        .merge(purchases)
        .merge(inventory)
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(body_limit)))
        .with_state(state)
}
