use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::InventoryRepository;
use crate::error::{AppError, AppResult};
use crate::models::{BatchReceipt, InventoryBatch};

/// POST /inventory/batches/bulk-update
#[derive(Debug, Clone, Deserialize)]
pub struct BulkUpdateRequest {
    pub idempotency_key: String,
    pub batches: Vec<BatchReceipt>,
}

#[derive(Debug, Serialize)]
pub struct BulkUpdateResult {
    /// false: 同一 key 已处理过，本次未改动库存
    pub applied: bool,
    pub batches: Vec<InventoryBatch>,
}

/// 批次库存: 原子递增与查询
pub struct InventoryService {
    inventory: Arc<dyn InventoryRepository>,
}

impl InventoryService {
    pub fn new(inventory: Arc<dyn InventoryRepository>) -> Self {
        Self { inventory }
    }

    pub async fn bulk_update(&self, req: BulkUpdateRequest) -> AppResult<BulkUpdateResult> {
        let key = req.idempotency_key.trim();
        if key.is_empty() {
            return Err(AppError::validation("idempotency_key is required"));
        }
        if req.batches.is_empty() {
            return Err(AppError::validation("batches must not be empty"));
        }
        for receipt in &req.batches {
            receipt.validate()?;
        }

        let (applied, batches) = self.inventory.apply_bulk(key, &req.batches).await?;
        if applied {
            tracing::info!(idempotency_key = %key, batches = batches.len(), "库存批次已更新");
        } else {
            tracing::info!(idempotency_key = %key, "重复的库存更新请求，已忽略");
        }
        Ok(BulkUpdateResult { applied, batches })
    }

    pub async fn list(
        &self,
        shop_id: Option<Uuid>,
        product_id: Option<Uuid>,
    ) -> AppResult<Vec<InventoryBatch>> {
        self.inventory.list_batches(shop_id, product_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use bigdecimal::BigDecimal;

    fn receipt(qty: i64) -> BatchReceipt {
        BatchReceipt {
            shop_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            batch_no: "LOT-9".into(),
            expiry_date: None,
            qty: BigDecimal::from(qty),
            landed_cost: BigDecimal::from(12),
        }
    }

    #[tokio::test]
    async fn rejects_blank_key_and_empty_batches() {
        let service = InventoryService::new(Arc::new(MemoryStore::new()));
        let err = service
            .bulk_update(BulkUpdateRequest {
                idempotency_key: "  ".into(),
                batches: vec![receipt(1)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(service
            .bulk_update(BulkUpdateRequest {
                idempotency_key: "k".into(),
                batches: vec![],
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn invalid_receipt_leaves_stock_untouched() {
        let store = Arc::new(MemoryStore::new());
        let service = InventoryService::new(store.clone());
        let result = service
            .bulk_update(BulkUpdateRequest {
                idempotency_key: "k-1".into(),
                batches: vec![receipt(4), receipt(0)],
            })
            .await;
        assert!(result.is_err());
        assert!(service.list(None, None).await.unwrap().is_empty());
    }
}
