use std::sync::Arc;

use rayon::prelude::*;
use uuid::Uuid;

use crate::config::MatcherConfig;
use crate::db::CatalogRepository;
use crate::error::AppResult;
use crate::models::{
    normalize_text, LineCandidate, MatchOutcome, ParsedInvoiceLine, ProductCandidate, ProductQuery,
};

/// 两个词视为同一词的 Jaro-Winkler 下限
const TOKEN_MATCH: f64 = 0.9;
const DEFAULT_SEARCH_LIMIT: i64 = 10;
const MAX_SEARCH_LIMIT: i64 = 50;

/// 综合相似度 = ½·整串 Jaro-Winkler + ½·商品名词覆盖率
///
/// 覆盖率: 商品名中能在描述里找到对应词 (Jaro-Winkler ≥ 0.9) 的词占比。
/// 供应商描述常带品牌前缀和规格后缀，单看整串相似度会偏低。
pub fn similarity(description: &str, product_name: &str) -> f64 {
    if description.is_empty() || product_name.is_empty() {
        return 0.0;
    }
    let whole = strsim::jaro_winkler(description, product_name);

    let desc_tokens: Vec<&str> = description.split_whitespace().collect();
    let name_tokens: Vec<&str> = product_name.split_whitespace().collect();
    let covered = name_tokens
        .iter()
        .filter(|t| {
            desc_tokens
                .iter()
                .any(|d| strsim::jaro_winkler(t, d) >= TOKEN_MATCH)
        })
        .count();
    let coverage = covered as f64 / name_tokens.len() as f64;

    (0.5 * whole + 0.5 * coverage).clamp(0.0, 1.0)
}

/// 商品匹配: 供应商映射 -> 包含匹配 -> 模糊建议
pub struct ProductMatcher {
    catalog: Arc<dyn CatalogRepository>,
    config: MatcherConfig,
}

impl ProductMatcher {
    pub fn new(catalog: Arc<dyn CatalogRepository>, config: MatcherConfig) -> Self {
        Self { catalog, config }
    }

    pub async fn match_description(&self, vendor_id: Uuid, description: &str) -> AppResult<MatchOutcome> {
        let normalized = normalize_text(description);
        if normalized.is_empty() {
            return Ok(MatchOutcome::unmatched());
        }

        // 1. 供应商措辞学习映射，命中即采用
        if let Some(mapping) = self.catalog.find_mapping(vendor_id, &normalized).await? {
            self.catalog.touch_mapping(vendor_id, &normalized).await?;
            return Ok(MatchOutcome::learned(mapping.product_id));
        }

        // 2. 描述包含于商品名
        if let Some(product) = self.catalog.find_containing(&normalized).await? {
            return Ok(MatchOutcome::exact(product.id, self.config.exact_confidence));
        }

        // 3. 模糊: 仅作为建议
        let query = ProductQuery {
            q: description.to_string(),
            ..Default::default()
        };
        let best = self.rank(&query, 1).await?.into_iter().next();
        match best {
            Some(c) if c.similarity > self.config.fuzzy_threshold => {
                Ok(MatchOutcome::fuzzy(c.product.id, c.similarity))
            }
            _ => Ok(MatchOutcome::unmatched()),
        }
    }

    /// 为解析出的候选行逐行匹配；数值无法解析的行不匹配
    pub async fn match_candidates(
        &self,
        vendor_id: Uuid,
        invoice_id: Uuid,
        candidates: Vec<LineCandidate>,
    ) -> AppResult<Vec<ParsedInvoiceLine>> {
        let mut lines = Vec::with_capacity(candidates.len());
        for (idx, candidate) in candidates.into_iter().enumerate() {
            let skip = candidate.numeric_error;
            let mut line = candidate.into_line(invoice_id, idx as i32 + 1);
            let outcome = if skip {
                MatchOutcome::unmatched()
            } else {
                self.match_description(vendor_id, &line.description).await?
            };
            tracing::debug!(
                invoice_id = %invoice_id,
                line_no = line.line_no,
                match_type = %outcome.match_type,
                confidence = outcome.confidence,
                "行匹配完成"
            );
            line.apply_match(outcome);
            lines.push(line);
        }
        Ok(lines)
    }

    /// 商品搜索 (人工匹配时的候选列表)
    pub async fn search(&self, query: &ProductQuery) -> AppResult<Vec<ProductCandidate>> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        self.rank(query, limit as usize).await
    }

    async fn rank(&self, query: &ProductQuery, limit: usize) -> AppResult<Vec<ProductCandidate>> {
        let normalized = normalize_text(&query.q);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }
        let products = self
            .catalog
            .fuzzy_candidates(query, self.config.candidate_threshold, self.config.candidate_limit)
            .await?;

        let mut scored: Vec<ProductCandidate> = products
            .into_par_iter()
            .map(|product| {
                let similarity = similarity(&normalized, &normalize_text(&product.name));
                ProductCandidate { product, similarity }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.product.name.cmp(&b.product.name))
        });
        scored.truncate(limit);
        Ok(scored)
    }
}
