use std::str::FromStr;
use std::sync::Arc;

use purchase_recon_rust::{
    api::{self, AppState},
    service::{
        extraction, outbox,
        storage::{LocalDocumentStore, MemoryDocumentStore},
        DocumentStore, InvoiceParser, OutboxRelay, ParseWorker, ProductMatcher,
    },
    AppConfig, Repositories,
};
use tracing::{info, Level};
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载配置
    let config = AppConfig::load()?;

    // 初始化日志 - 使用本地时间格式
    let level = Level::from_str(&config.server.log_level).unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .with_max_level(level)
        .init();
    info!("Starting server with config: {:?}", config);

    let repos = Repositories::connect(&config.database).await?;

    let documents: Arc<dyn DocumentStore> = if config.database.is_memory() {
        Arc::new(MemoryDocumentStore::new())
    } else {
        Arc::new(LocalDocumentStore::new(&config.storage.upload_dir))
    };
    let extractor = Arc::from(extraction::from_config(&config.extraction)?);
    let parser = Arc::new(InvoiceParser::new()?);
    let matcher = Arc::new(ProductMatcher::new(repos.catalog.clone(), config.matcher.clone()));

    // 后台任务: 解析 worker 与 outbox 中继
    let worker = ParseWorker::new(
        repos.invoices.clone(),
        repos.jobs.clone(),
        documents.clone(),
        extractor,
        parser,
        matcher.clone(),
        config.parsing.clone(),
    );
    let worker_task = tokio::spawn(async move { worker.run().await });

    let relay = OutboxRelay::new(repos.outbox.clone(), outbox::from_config(&config.outbox)?, &config.outbox);
    let relay_task = tokio::spawn(async move { relay.run().await });

    let app = api::router(AppState::new(&repos, documents, matcher, &config));

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /invoices/upload                  - 上传发票 (异步解析)");
    info!("  POST /invoices/:id/lines/:line_id/match - 人工对账");
    info!("  POST /purchases/grn                    - 创建收货单草稿");
    info!("  POST /purchases/grn/:id/confirm        - 确认收货 (入库)");
    info!("  POST /purchases/grn/:id/post           - 过账");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("收到退出信号，正在关闭...");
        })
        .await?;

    worker_task.abort();
    relay_task.abort();
    info!("Server stopped");
    Ok(())
}
