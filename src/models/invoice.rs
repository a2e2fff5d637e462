use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

text_enum! {
    /// 发票处理状态: processing -> parsed | failed, parsed -> confirmed
    InvoiceStatus {
        Processing => "processing",
        Parsed => "parsed",
        Failed => "failed",
        Confirmed => "confirmed",
    }
}

text_enum! {
    SourceType {
        Manual => "manual",
        Email => "email",
        Api => "api",
        Scan => "scan",
    }
}

text_enum! {
    MatchType {
        Exact => "exact",
        Fuzzy => "fuzzy",
        Manual => "manual",
        Created => "created",
        Unmatched => "unmatched",
    }
}

text_enum! {
    LineStatus {
        Pending => "pending",
        Matched => "matched",
        Ignored => "ignored",
    }
}

text_enum! {
    ParseJobStatus {
        Queued => "queued",
        Running => "running",
        Done => "done",
        Failed => "failed",
    }
}

impl InvoiceStatus {
    pub fn can_transition_to(self, to: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, to),
            (Processing, Parsed) | (Processing, Failed) | (Parsed, Confirmed)
        )
    }

    pub fn ensure_transition(self, to: InvoiceStatus) -> AppResult<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(AppError::transition("parsed_invoice", self, to))
        }
    }
}

/// 上传的供应商发票 (parsed_invoices)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ParsedInvoice {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub shop_id: Uuid,
    pub source_type: SourceType,
    pub raw_doc_ref: String,
    pub status: InvoiceStatus,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub currency: String,
    pub total_amount: Option<BigDecimal>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parsed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl ParsedInvoice {
    pub fn new_processing(
        vendor_id: Uuid,
        shop_id: Uuid,
        source_type: SourceType,
        raw_doc_ref: String,
        currency: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            vendor_id,
            shop_id,
            source_type,
            raw_doc_ref,
            status: InvoiceStatus::Processing,
            invoice_number: None,
            invoice_date: None,
            currency: currency.to_string(),
            total_amount: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            parsed_at: None,
            confirmed_at: None,
        }
    }
}

/// 从发票文本抽取的抬头信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceHeader {
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub total_amount: Option<BigDecimal>,
}

/// 发票明细行 (parsed_invoice_lines)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ParsedInvoiceLine {
    pub id: Uuid,
    pub parsed_invoice_id: Uuid,
    pub line_no: i32,
    pub raw_text: String,
    pub description: String,
    pub qty: BigDecimal,
    pub unit_price: BigDecimal,
    pub tax_rate: BigDecimal,
    pub batch_no: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub suggested_product_id: Option<Uuid>,
    pub matched_product_id: Option<Uuid>,
    pub match_type: MatchType,
    pub match_confidence: f64,
    pub status: LineStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ParsedInvoiceLine {
    /// 含税行金额
    pub fn line_total(&self) -> BigDecimal {
        let net = &self.qty * &self.unit_price;
        let tax = &net * &self.tax_rate / BigDecimal::from(100);
        (net + tax).with_scale(2)
    }

    pub fn is_resolved(&self) -> bool {
        self.status != LineStatus::Pending
    }

    /// 写入匹配结果；有 matched_product_id 的行直接视为已匹配
    pub fn apply_match(&mut self, outcome: MatchOutcome) {
        self.status = if outcome.matched_product_id.is_some() {
            LineStatus::Matched
        } else {
            LineStatus::Pending
        };
        self.matched_product_id = outcome.matched_product_id;
        self.suggested_product_id = outcome.suggested_product_id;
        self.match_type = outcome.match_type;
        self.match_confidence = outcome.confidence;
    }

    /// 行级不变量
    pub fn is_consistent(&self) -> bool {
        let conf_ok = (0.0..=1.0).contains(&self.match_confidence);
        let matched_ok = self.status != LineStatus::Matched || self.matched_product_id.is_some();
        let exact_ok = self.match_type != MatchType::Exact || self.match_confidence >= 0.9;
        let unmatched_ok = self.match_type != MatchType::Unmatched || self.match_confidence == 0.0;
        let single_ok = !(self.matched_product_id.is_some() && self.suggested_product_id.is_some());
        conf_ok && matched_ok && exact_ok && unmatched_ok && single_ok
    }
}

/// 匹配器输出；matched 与 suggested 至多一个有值
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub matched_product_id: Option<Uuid>,
    pub suggested_product_id: Option<Uuid>,
    pub match_type: MatchType,
    pub confidence: f64,
}

impl MatchOutcome {
    pub fn exact(product_id: Uuid, confidence: f64) -> Self {
        Self {
            matched_product_id: Some(product_id),
            suggested_product_id: None,
            match_type: MatchType::Exact,
            confidence: confidence.clamp(0.9, 1.0),
        }
    }

    pub fn fuzzy(product_id: Uuid, similarity: f64) -> Self {
        Self {
            matched_product_id: None,
            suggested_product_id: Some(product_id),
            match_type: MatchType::Fuzzy,
            confidence: similarity.clamp(0.0, 1.0),
        }
    }

    /// 供应商映射命中: 复用人工确认过的结果
    pub fn learned(product_id: Uuid) -> Self {
        Self {
            matched_product_id: Some(product_id),
            suggested_product_id: None,
            match_type: MatchType::Manual,
            confidence: 1.0,
        }
    }

    pub fn unmatched() -> Self {
        Self {
            matched_product_id: None,
            suggested_product_id: None,
            match_type: MatchType::Unmatched,
            confidence: 0.0,
        }
    }
}

/// 对账动作的落库形式
#[derive(Debug, Clone)]
pub enum ResolvedAction {
    Matched {
        product_id: Uuid,
        match_type: MatchType,
        new_product: Option<crate::models::Product>,
    },
    Ignored,
}

#[derive(Debug, Clone)]
pub struct LineResolution {
    pub invoice_id: Uuid,
    pub line_id: Uuid,
    pub action: ResolvedAction,
    /// 学习映射的键 (规范化后的行描述)
    pub normalized_description: String,
    pub batch_no: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub resolved_at: DateTime<Utc>,
}

impl LineResolution {
    /// 在内存行上应用 (内存仓储与单测共用)
    pub fn apply_to(&self, line: &mut ParsedInvoiceLine) -> AppResult<()> {
        if line.is_resolved() {
            return Err(AppError::conflict(format!(
                "line {} already {}",
                line.id, line.status
            )));
        }
        match &self.action {
            ResolvedAction::Matched {
                product_id,
                match_type,
                ..
            } => {
                line.matched_product_id = Some(*product_id);
                line.suggested_product_id = None;
                line.match_type = *match_type;
                line.match_confidence = 1.0;
                line.status = LineStatus::Matched;
            }
            ResolvedAction::Ignored => {
                line.status = LineStatus::Ignored;
            }
        }
        if self.batch_no.is_some() {
            line.batch_no = self.batch_no.clone();
        }
        if self.expiry_date.is_some() {
            line.expiry_date = self.expiry_date;
        }
        line.resolved_at = Some(self.resolved_at);
        Ok(())
    }
}

/// 对账队列过滤条件
#[derive(Debug, Clone)]
pub struct ReconciliationFilter {
    pub status: LineStatus,
    pub vendor_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ReconciliationFilter {
    fn default() -> Self {
        Self {
            status: LineStatus::Pending,
            vendor_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// 对账队列查询行 (行 + 所属发票摘要)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ReconciliationRow {
    pub parsed_invoice_id: Uuid,
    pub vendor_id: Uuid,
    pub shop_id: Uuid,
    pub invoice_number: Option<String>,
    pub line_id: Uuid,
    pub line_no: i32,
    pub description: String,
    pub qty: BigDecimal,
    pub unit_price: BigDecimal,
    pub match_type: MatchType,
    pub match_confidence: f64,
    pub suggested_product_id: Option<Uuid>,
    pub status: LineStatus,
}

/// 持久化的解析任务 (parse_jobs)
#[derive(Debug, Clone, FromRow)]
pub struct ParseJob {
    pub id: Uuid,
    pub parsed_invoice_id: Uuid,
    pub status: ParseJobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// 最近一次被领取的时间
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ParseJob {
    pub fn queued(parsed_invoice_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            parsed_invoice_id,
            status: ParseJobStatus::Queued,
            attempts: 0,
            last_error: None,
            locked_at: None,
            lease_until: None,
            created_at: Utc::now(),
        }
    }
}

/// 解析出的候选行 (入库前)
#[derive(Debug, Clone, PartialEq)]
pub struct LineCandidate {
    pub raw_text: String,
    pub description: String,
    pub qty: BigDecimal,
    pub unit_price: BigDecimal,
    pub tax_rate: BigDecimal,
    pub batch_no: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    /// 数值字段无法解析；保留行但不参与匹配
    pub numeric_error: bool,
}

impl LineCandidate {
    pub fn into_line(self, invoice_id: Uuid, line_no: i32) -> ParsedInvoiceLine {
        ParsedInvoiceLine {
            id: Uuid::new_v4(),
            parsed_invoice_id: invoice_id,
            line_no,
            raw_text: self.raw_text,
            description: self.description,
            qty: self.qty,
            unit_price: self.unit_price,
            tax_rate: self.tax_rate,
            batch_no: self.batch_no,
            expiry_date: self.expiry_date,
            suggested_product_id: None,
            matched_product_id: None,
            match_type: MatchType::Unmatched,
            match_confidence: 0.0,
            status: LineStatus::Pending,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn unparsable(raw_text: &str, description: String) -> Self {
        Self {
            raw_text: raw_text.to_string(),
            description,
            qty: BigDecimal::zero(),
            unit_price: BigDecimal::zero(),
            tax_rate: BigDecimal::zero(),
            batch_no: None,
            expiry_date: None,
            numeric_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn line() -> ParsedInvoiceLine {
        LineCandidate {
            raw_text: "x".into(),
            description: "Arnica".into(),
            qty: BigDecimal::from(12),
            unit_price: BigDecimal::from_str("85.00").unwrap(),
            tax_rate: BigDecimal::from(18),
            batch_no: None,
            expiry_date: None,
            numeric_error: false,
        }
        .into_line(Uuid::new_v4(), 1)
    }

    #[test]
    fn invoice_status_edges() {
        assert!(InvoiceStatus::Processing.can_transition_to(InvoiceStatus::Parsed));
        assert!(InvoiceStatus::Processing.can_transition_to(InvoiceStatus::Failed));
        assert!(InvoiceStatus::Parsed.can_transition_to(InvoiceStatus::Confirmed));
        assert!(!InvoiceStatus::Confirmed.can_transition_to(InvoiceStatus::Parsed));
        assert!(!InvoiceStatus::Failed.can_transition_to(InvoiceStatus::Parsed));
        assert!(InvoiceStatus::Processing
            .ensure_transition(InvoiceStatus::Confirmed)
            .is_err());
    }

    #[test]
    fn line_total_includes_tax() {
        // 12 * 85 = 1020, +18% = 1203.60
        assert_eq!(line().line_total(), BigDecimal::from_str("1203.60").unwrap());
    }

    #[test]
    fn match_outcomes_keep_invariants() {
        let pid = Uuid::new_v4();
        for outcome in [
            MatchOutcome::exact(pid, 0.95),
            MatchOutcome::fuzzy(pid, 0.71),
            MatchOutcome::learned(pid),
            MatchOutcome::unmatched(),
        ] {
            let mut l = line();
            l.apply_match(outcome);
            assert!(l.is_consistent(), "{:?}", l);
        }
    }

    #[test]
    fn fuzzy_outcome_is_only_a_suggestion() {
        let mut l = line();
        l.apply_match(MatchOutcome::fuzzy(Uuid::new_v4(), 0.7));
        assert_eq!(l.status, LineStatus::Pending);
        assert!(l.matched_product_id.is_none());
        assert!(l.suggested_product_id.is_some());
    }

    #[test]
    fn resolving_twice_is_a_conflict() {
        let mut l = line();
        let res = LineResolution {
            invoice_id: l.parsed_invoice_id,
            line_id: l.id,
            action: ResolvedAction::Ignored,
            normalized_description: "arnica".into(),
            batch_no: None,
            expiry_date: None,
            resolved_at: Utc::now(),
        };
        res.apply_to(&mut l).unwrap();
        assert_eq!(l.status, LineStatus::Ignored);
        assert!(matches!(res.apply_to(&mut l), Err(AppError::Conflict(_))));
    }

    #[test]
    fn text_enums_parse_and_print() {
        assert_eq!(MatchType::from_str("fuzzy").unwrap(), MatchType::Fuzzy);
        assert_eq!(LineStatus::Ignored.to_string(), "ignored");
        assert!(SourceType::from_str("fax").is_err());
    }
}
