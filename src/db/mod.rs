pub mod memory;
pub mod pool;
pub mod postgres;
pub mod repository;

use std::sync::Arc;

pub use memory::MemoryStore;
pub use pool::{create_pool, run_migrations};
pub use postgres::PgStore;
pub use repository::{
    CatalogRepository, GrnRepository, InventoryRepository, InvoiceRepository, OutboxRepository,
    ParseJobQueue,
};

use crate::config::DatabaseConfig;
use crate::error::AppResult;

/// 各聚合仓储的句柄集合，服务层按需取用
#[derive(Clone)]
pub struct Repositories {
    pub invoices: Arc<dyn InvoiceRepository>,
    pub jobs: Arc<dyn ParseJobQueue>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub grns: Arc<dyn GrnRepository>,
    pub inventory: Arc<dyn InventoryRepository>,
    pub outbox: Arc<dyn OutboxRepository>,
}

impl Repositories {
    /// 同一个存储实现同时充当所有仓储
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: InvoiceRepository
            + ParseJobQueue
            + CatalogRepository
            + GrnRepository
            + InventoryRepository
            + OutboxRepository
            + 'static,
    {
        Self {
            invoices: store.clone(),
            jobs: store.clone(),
            catalog: store.clone(),
            grns: store.clone(),
            inventory: store.clone(),
            outbox: store,
        }
    }

    /// 按配置连接: `memory://` 使用内存存储，否则连接 PostgreSQL
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        if config.is_memory() {
            tracing::warn!("使用内存存储，进程退出后数据丢失");
            return Ok(Self::from_store(Arc::new(MemoryStore::new())));
        }

        tracing::info!("正在连接数据库...");
        let pool = create_pool(config).await?;
        tracing::info!("数据库连接成功");
        if config.run_migrations {
            run_migrations(&pool).await?;
        }
        Ok(Self::from_store(Arc::new(PgStore::new(pool))))
    }
}
