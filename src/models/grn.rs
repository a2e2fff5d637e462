use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::config::AccountingConfig;
use crate::error::{AppError, AppResult};
use crate::models::inventory::BatchReceipt;

text_enum! {
    /// 收货单状态: draft -> confirmed -> posted (终态)
    GrnStatus {
        Draft => "draft",
        Confirmed => "confirmed",
        Posted => "posted",
    }
}

text_enum! {
    EntrySide {
        Debit => "debit",
        Credit => "credit",
    }
}

impl GrnStatus {
    /// 唯一合法的下一个状态
    pub fn next(self) -> Option<GrnStatus> {
        match self {
            GrnStatus::Draft => Some(GrnStatus::Confirmed),
            GrnStatus::Confirmed => Some(GrnStatus::Posted),
            GrnStatus::Posted => None,
        }
    }

    pub fn ensure_transition(self, to: GrnStatus) -> AppResult<()> {
        if self.next() == Some(to) {
            Ok(())
        } else {
            Err(AppError::transition("grn", self, to))
        }
    }

    pub fn ensure_editable(self) -> AppResult<()> {
        if self == GrnStatus::Draft {
            Ok(())
        } else {
            Err(AppError::conflict(format!(
                "grn is {}; only draft receipts can be edited, issue an adjustment instead",
                self
            )))
        }
    }
}

/// 收货单 (purchase_receipts)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Grn {
    pub id: Uuid,
    pub receipt_number: String,
    pub parsed_invoice_id: Option<Uuid>,
    pub vendor_id: Uuid,
    pub shop_id: Uuid,
    pub status: GrnStatus,
    pub receipt_date: NaiveDate,
    pub subtotal: BigDecimal,
    pub tax_total: BigDecimal,
    pub freight: BigDecimal,
    pub grand_total: BigDecimal,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Grn {
    pub fn new_draft(
        parsed_invoice_id: Option<Uuid>,
        vendor_id: Uuid,
        shop_id: Uuid,
        receipt_date: NaiveDate,
        totals: GrnTotals,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            id,
            receipt_number: receipt_number(receipt_date, id),
            parsed_invoice_id,
            vendor_id,
            shop_id,
            status: GrnStatus::Draft,
            receipt_date,
            subtotal: totals.subtotal,
            tax_total: totals.tax_total,
            freight: totals.freight,
            grand_total: totals.grand_total,
            approved_by: None,
            approved_at: None,
            posted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_totals(&mut self, totals: GrnTotals) {
        self.subtotal = totals.subtotal;
        self.tax_total = totals.tax_total;
        self.freight = totals.freight;
        self.grand_total = totals.grand_total;
    }
}

/// GRN-YYYYMMDD-xxxxxxxx
pub fn receipt_number(date: NaiveDate, id: Uuid) -> String {
    let hex = id.simple().to_string();
    format!("GRN-{}-{}", date.format("%Y%m%d"), &hex[..8])
}

/// 收货单明细 (purchase_receipt_lines)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GrnLine {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub line_no: i32,
    pub parsed_line_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub batch_no: String,
    pub expiry_date: Option<NaiveDate>,
    pub qty: BigDecimal,
    pub unit_cost: BigDecimal,
    pub discount: BigDecimal,
    pub tax_rate: BigDecimal,
    pub tax: BigDecimal,
    pub landed_unit_cost: BigDecimal,
    pub line_total: BigDecimal,
    /// 对账时被忽略的行: 保留审计，不影响库存与记账
    pub excluded: bool,
}

/// 创建 / 编辑收货单时提交的明细
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GrnLineInput {
    pub parsed_line_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub batch_no: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub qty: BigDecimal,
    pub unit_cost: BigDecimal,
    /// 行折扣总额
    pub discount: Option<BigDecimal>,
    /// 税率 (百分比)
    pub tax_rate: Option<BigDecimal>,
    #[serde(default)]
    pub excluded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrnTotals {
    pub subtotal: BigDecimal,
    pub tax_total: BigDecimal,
    pub freight: BigDecimal,
    pub grand_total: BigDecimal,
}

impl GrnTotals {
    pub fn zero() -> Self {
        Self {
            subtotal: BigDecimal::zero(),
            tax_total: BigDecimal::zero(),
            freight: BigDecimal::zero(),
            grand_total: BigDecimal::zero(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GrnWithLines {
    #[serde(flatten)]
    pub grn: Grn,
    pub lines: Vec<GrnLine>,
}

impl GrnWithLines {
    /// 需要入库的批次增量 (跳过 excluded 行)
    pub fn batch_receipts(&self) -> Vec<BatchReceipt> {
        self.lines
            .iter()
            .filter(|l| !l.excluded)
            .filter_map(|l| {
                l.product_id.map(|product_id| BatchReceipt {
                    shop_id: self.grn.shop_id,
                    product_id,
                    batch_no: l.batch_no.clone(),
                    expiry_date: l.expiry_date,
                    qty: l.qty.clone(),
                    landed_cost: l.landed_unit_cost.clone(),
                })
            })
            .collect()
    }
}

fn hundred() -> BigDecimal {
    BigDecimal::from(100)
}

fn validate_input(idx: usize, input: &GrnLineInput) -> AppResult<()> {
    let n = idx + 1;
    if input.qty < BigDecimal::zero() || input.unit_cost < BigDecimal::zero() {
        return Err(AppError::validation(format!("line {}: qty and unit_cost must be >= 0", n)));
    }
    if input.excluded {
        return Ok(());
    }
    if input.product_id.is_none() {
        return Err(AppError::validation(format!("line {}: product_id is required", n)));
    }
    if input.qty <= BigDecimal::zero() {
        return Err(AppError::validation(format!("line {}: qty must be > 0", n)));
    }
    let gross = &input.qty * &input.unit_cost;
    if let Some(discount) = &input.discount {
        if *discount < BigDecimal::zero() || *discount > gross {
            return Err(AppError::validation(format!(
                "line {}: discount must be between 0 and the line value",
                n
            )));
        }
    }
    if let Some(rate) = &input.tax_rate {
        if *rate < BigDecimal::zero() || *rate > hundred() {
            return Err(AppError::validation(format!("line {}: tax_rate must be 0..=100", n)));
        }
    }
    Ok(())
}

/// 计算明细行的税额、到岸成本与合计
///
/// 到岸单位成本 = (数量*单价 - 折扣 + 税额 + 运费分摊) / 数量，
/// 运费按各行净额占比分摊；净额全为 0 时平均分摊。excluded 行不参与分摊和合计。
pub fn build_lines(
    receipt_id: Uuid,
    receipt_date: NaiveDate,
    inputs: &[GrnLineInput],
    freight: &BigDecimal,
) -> AppResult<(Vec<GrnLine>, GrnTotals)> {
    if *freight < BigDecimal::zero() {
        return Err(AppError::validation("freight must be >= 0"));
    }
    for (idx, input) in inputs.iter().enumerate() {
        validate_input(idx, input)?;
    }
    let included = inputs.iter().filter(|i| !i.excluded).count();
    if included == 0 {
        return Err(AppError::validation("a goods receipt needs at least one receivable line"));
    }

    let net_of = |i: &GrnLineInput| {
        &i.qty * &i.unit_cost - i.discount.clone().unwrap_or_else(BigDecimal::zero)
    };
    let total_net: BigDecimal = inputs
        .iter()
        .filter(|i| !i.excluded)
        .map(net_of)
        .fold(BigDecimal::zero(), |acc, v| acc + v);

    let default_batch = format!("AUTO-{}", receipt_date.format("%Y%m%d"));
    let mut subtotal = BigDecimal::zero();
    let mut tax_total = BigDecimal::zero();
    let mut lines = Vec::with_capacity(inputs.len());

    for (idx, input) in inputs.iter().enumerate() {
        let discount = input.discount.clone().unwrap_or_else(BigDecimal::zero);
        let tax_rate = input.tax_rate.clone().unwrap_or_else(BigDecimal::zero);
        let net = net_of(input);
        let tax = (&net * &tax_rate / hundred()).round(2);
        let net_rounded = net.round(2);

        let freight_share = if input.excluded || freight.is_zero() {
            BigDecimal::zero()
        } else if total_net.is_zero() {
            freight / BigDecimal::from(included as i64)
        } else {
            freight * &net / &total_net
        };

        let landed_unit_cost = if input.qty.is_zero() {
            input.unit_cost.round(4)
        } else {
            ((&net + &tax + &freight_share) / &input.qty).round(4)
        };

        if !input.excluded {
            subtotal += &net_rounded;
            tax_total += &tax;
        }

        lines.push(GrnLine {
            id: Uuid::new_v4(),
            receipt_id,
            line_no: idx as i32 + 1,
            parsed_line_id: input.parsed_line_id,
            product_id: input.product_id,
            batch_no: input
                .batch_no
                .as_ref()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| default_batch.clone()),
            expiry_date: input.expiry_date,
            qty: input.qty.clone(),
            unit_cost: input.unit_cost.clone(),
            discount,
            tax_rate,
            tax: tax.clone(),
            landed_unit_cost,
            line_total: net_rounded + tax,
            excluded: input.excluded,
        });
    }

    let freight = freight.round(2);
    let grand_total = &subtotal + &tax_total + &freight;
    Ok((
        lines,
        GrnTotals {
            subtotal,
            tax_total,
            freight,
            grand_total,
        },
    ))
}

/// 过账分录 (accounting_entries)
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AccountingEntry {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub account: String,
    pub side: EntrySide,
    pub amount: BigDecimal,
    pub memo: String,
    pub created_at: DateTime<Utc>,
}

/// 借: 库存 (净额 + 运费)、进项税；贷: 应付账款 (总额)
pub fn accounting_entries(
    grn: &Grn,
    accounts: &AccountingConfig,
    at: DateTime<Utc>,
) -> Vec<AccountingEntry> {
    let entry = |account: &str, side: EntrySide, amount: BigDecimal, memo: &str| AccountingEntry {
        id: Uuid::new_v4(),
        receipt_id: grn.id,
        account: account.to_string(),
        side,
        amount,
        memo: format!("{} {}", grn.receipt_number, memo),
        created_at: at,
    };

    let mut entries = vec![entry(
        &accounts.inventory_account,
        EntrySide::Debit,
        &grn.subtotal + &grn.freight,
        "inventory received",
    )];
    if !grn.tax_total.is_zero() {
        entries.push(entry(
            &accounts.input_tax_account,
            EntrySide::Debit,
            grn.tax_total.clone(),
            "input tax",
        ));
    }
    entries.push(entry(
        &accounts.payable_account,
        EntrySide::Credit,
        grn.grand_total.clone(),
        "payable to vendor",
    ));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn input(qty: &str, cost: &str) -> GrnLineInput {
        GrnLineInput {
            parsed_line_id: None,
            product_id: Some(Uuid::new_v4()),
            batch_no: None,
            expiry_date: None,
            qty: dec(qty),
            unit_cost: dec(cost),
            discount: None,
            tax_rate: None,
            excluded: false,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()
    }

    #[test]
    fn status_machine_is_strictly_linear() {
        assert!(GrnStatus::Draft.ensure_transition(GrnStatus::Confirmed).is_ok());
        assert!(GrnStatus::Confirmed.ensure_transition(GrnStatus::Posted).is_ok());
        assert!(GrnStatus::Draft.ensure_transition(GrnStatus::Posted).is_err());
        assert!(GrnStatus::Confirmed.ensure_transition(GrnStatus::Confirmed).is_err());
        assert!(GrnStatus::Posted.ensure_transition(GrnStatus::Draft).is_err());
        assert!(GrnStatus::Posted.next().is_none());
        assert!(GrnStatus::Confirmed.ensure_editable().is_err());
    }

    #[test]
    fn landed_cost_without_extras_equals_unit_cost() {
        let (lines, totals) =
            build_lines(Uuid::new_v4(), date(), &[input("12", "70"), input("5", "185")], &BigDecimal::zero())
                .unwrap();
        assert_eq!(lines[0].landed_unit_cost, dec("70"));
        assert_eq!(lines[1].landed_unit_cost, dec("185"));
        assert_eq!(totals.subtotal, dec("1765"));
        assert_eq!(totals.grand_total, dec("1765"));
        assert_eq!(lines[0].batch_no, "AUTO-20261015");
    }

    #[test]
    fn landed_cost_applies_discount_tax_and_freight() {
        let mut l = input("10", "100");
        l.discount = Some(dec("100")); // 10/unit
        l.tax_rate = Some(dec("18"));
        let (lines, totals) = build_lines(Uuid::new_v4(), date(), &[l], &dec("50")).unwrap();
        // net 900, tax 162, freight 50 => 1112 / 10
        assert_eq!(lines[0].tax, dec("162"));
        assert_eq!(lines[0].landed_unit_cost, dec("111.2"));
        assert_eq!(totals.tax_total, dec("162"));
        assert_eq!(totals.grand_total, dec("1112"));
    }

    #[test]
    fn freight_is_apportioned_by_net_value() {
        let (lines, _) = build_lines(
            Uuid::new_v4(),
            date(),
            &[input("1", "300"), input("1", "100")],
            &dec("40"),
        )
        .unwrap();
        assert_eq!(lines[0].landed_unit_cost, dec("330"));
        assert_eq!(lines[1].landed_unit_cost, dec("110"));
    }

    #[test]
    fn excluded_lines_do_not_count() {
        let mut ignored = input("3", "50");
        ignored.product_id = None;
        ignored.excluded = true;
        let (lines, totals) =
            build_lines(Uuid::new_v4(), date(), &[input("2", "10"), ignored], &BigDecimal::zero())
                .unwrap();
        assert_eq!(totals.subtotal, dec("20"));
        assert!(lines[1].excluded);
    }

    #[test]
    fn rejects_missing_product_and_bad_qty() {
        let mut no_product = input("1", "1");
        no_product.product_id = None;
        assert!(build_lines(Uuid::new_v4(), date(), &[no_product], &BigDecimal::zero()).is_err());
        assert!(build_lines(Uuid::new_v4(), date(), &[input("0", "1")], &BigDecimal::zero()).is_err());
        assert!(build_lines(Uuid::new_v4(), date(), &[], &BigDecimal::zero()).is_err());
    }

    #[test]
    fn accounting_entries_balance() {
        let mut l = input("4", "25");
        l.tax_rate = Some(dec("12"));
        let (_, totals) = build_lines(Uuid::new_v4(), date(), &[l], &dec("8")).unwrap();
        let grn = Grn::new_draft(None, Uuid::new_v4(), Uuid::new_v4(), date(), totals);
        let entries = accounting_entries(&grn, &crate::config::AppConfig::default().accounting, Utc::now());
        let debit: BigDecimal = entries
            .iter()
            .filter(|e| e.side == EntrySide::Debit)
            .fold(BigDecimal::zero(), |a, e| a + &e.amount);
        let credit: BigDecimal = entries
            .iter()
            .filter(|e| e.side == EntrySide::Credit)
            .fold(BigDecimal::zero(), |a, e| a + &e.amount);
        assert_eq!(debit, credit);
        assert_eq!(credit, dec("120"));
    }

    #[test]
    fn receipt_number_shape() {
        let n = receipt_number(date(), Uuid::new_v4());
        assert!(n.starts_with("GRN-20261015-"));
        assert_eq!(n.len(), "GRN-20261015-".len() + 8);
    }
}
