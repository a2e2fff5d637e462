use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// 库存批次 (inventory_batches)，键: (shop_id, product_id, batch_no)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InventoryBatch {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub product_id: Uuid,
    pub batch_no: String,
    pub quantity: BigDecimal,
    pub reserved: BigDecimal,
    pub available: BigDecimal,
    pub landed_cost: BigDecimal,
    pub expiry_date: Option<NaiveDate>,
    pub last_restocked: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 一次入库增量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub shop_id: Uuid,
    pub product_id: Uuid,
    pub batch_no: String,
    pub expiry_date: Option<NaiveDate>,
    pub qty: BigDecimal,
    pub landed_cost: BigDecimal,
}

impl BatchReceipt {
    pub fn validate(&self) -> AppResult<()> {
        if self.batch_no.trim().is_empty() {
            return Err(AppError::validation("batch_no is required"));
        }
        if self.qty <= BigDecimal::zero() {
            return Err(AppError::validation(format!(
                "batch {}: qty must be > 0",
                self.batch_no
            )));
        }
        if self.landed_cost < BigDecimal::zero() {
            return Err(AppError::validation(format!(
                "batch {}: landed_cost must be >= 0",
                self.batch_no
            )));
        }
        Ok(())
    }

    pub fn key(&self) -> (Uuid, Uuid, String) {
        (self.shop_id, self.product_id, self.batch_no.clone())
    }
}

impl InventoryBatch {
    pub fn from_receipt(receipt: &BatchReceipt, at: DateTime<Utc>) -> Self {
        let mut batch = Self {
            id: Uuid::new_v4(),
            shop_id: receipt.shop_id,
            product_id: receipt.product_id,
            batch_no: receipt.batch_no.clone(),
            quantity: receipt.qty.clone(),
            reserved: BigDecimal::zero(),
            available: BigDecimal::zero(),
            landed_cost: receipt.landed_cost.clone(),
            expiry_date: receipt.expiry_date,
            last_restocked: at,
            created_at: at,
            updated_at: at,
        };
        batch.recompute_available();
        batch
    }

    /// 增量入库: quantity += qty，刷新成本/效期，重算 available
    pub fn apply_receipt(&mut self, receipt: &BatchReceipt, at: DateTime<Utc>) {
        self.quantity += &receipt.qty;
        self.landed_cost = receipt.landed_cost.clone();
        if receipt.expiry_date.is_some() {
            self.expiry_date = receipt.expiry_date;
        }
        self.last_restocked = at;
        self.updated_at = at;
        self.recompute_available();
    }

    pub fn recompute_available(&mut self) {
        self.available = &self.quantity - &self.reserved;
    }

    pub fn is_consistent(&self) -> bool {
        self.available == &self.quantity - &self.reserved
    }
}
