use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// 商品目录 (products)，本服务只读 + 对账时新建
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub brand: Option<String>,
    pub potency: Option<String>,
    pub pack_size: Option<String>,
    pub sku: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// 对账 "create" 动作提交的新商品
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewProduct {
    pub name: String,
    pub brand: Option<String>,
    pub potency: Option<String>,
    pub pack_size: Option<String>,
    pub sku: Option<String>,
}

impl NewProduct {
    pub fn into_product(self) -> AppResult<Product> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::validation("new_product.name is required"));
        }
        Ok(Product {
            id: Uuid::new_v4(),
            name,
            brand: self.brand.filter(|s| !s.trim().is_empty()),
            potency: self.potency.filter(|s| !s.trim().is_empty()),
            pack_size: self.pack_size,
            sku: self.sku.filter(|s| !s.trim().is_empty()),
            is_active: true,
            created_at: Utc::now(),
        })
    }
}

/// 匹配用的规范化: 小写，非 ASCII 字母数字视为分隔符，空白折叠
///
/// 与 SQL 侧 `trim(regexp_replace(lower(name), '[^a-z0-9]+', ' ', 'g'))` 等价
pub fn normalize_text(s: &str) -> String {
    let mapped: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 商品搜索条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductQuery {
    pub q: String,
    pub brand: Option<String>,
    pub potency: Option<String>,
    pub limit: Option<i64>,
}

/// 带相似度的候选商品
#[derive(Debug, Clone, Serialize)]
pub struct ProductCandidate {
    #[serde(flatten)]
    pub product: Product,
    pub similarity: f64,
}

/// 供应商措辞 -> 商品 的学习映射 (vendor_product_mappings)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VendorProductMapping {
    pub vendor_id: Uuid,
    pub normalized_description: String,
    pub product_id: Uuid,
    pub confidence: f64,
    pub usage_count: i32,
    pub last_used_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_punctuation_and_case() {
        assert_eq!(normalize_text("  SBL Arnica-30C, 10ml "), "sbl arnica 30c 10ml");
        assert_eq!(normalize_text("***"), "");
    }

    #[test]
    fn new_product_requires_name() {
        let np = NewProduct {
            name: "   ".into(),
            brand: None,
            potency: None,
            pack_size: None,
            sku: None,
        };
        assert!(matches!(np.into_product(), Err(AppError::Validation(_))));
    }

    #[test]
    fn new_product_is_active_and_trimmed() {
        let p = NewProduct {
            name: " Nux Vomica 200C ".into(),
            brand: Some("".into()),
            potency: Some("200C".into()),
            pack_size: None,
            sku: None,
        }
        .into_product()
        .unwrap();
        assert_eq!(p.name, "Nux Vomica 200C");
        assert!(p.is_active);
        assert!(p.brand.is_none());
    }
}
