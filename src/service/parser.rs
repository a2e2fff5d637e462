//! 发票文本解析: 抬头字段 + 明细行候选
//!
//! 支持两种行格式:
//! - 标记式: `SBL Arnica 30C 10ml – 12 units @ 85.00, tax 18%`
//! - 表格式: 以 tab 或连续空格分列，`描述  数量  单价  [税率%]`

use std::str::FromStr;

use bigdecimal::{BigDecimal, Zero};
use chrono::{Datelike, NaiveDate};
use regex::Regex;

use crate::models::{InvoiceHeader, LineCandidate};

/// 一份发票文本的解析结果
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub header: InvoiceHeader,
    pub lines: Vec<LineCandidate>,
}

pub struct InvoiceParser {
    marker_line: Regex,
    column_split: Regex,
    tax_fragment: Regex,
    batch: Regex,
    expiry: Regex,
    non_item: Regex,
    invoice_number: Vec<Regex>,
    labelled_date: Regex,
    any_date: Regex,
    grand_total: Regex,
    total: Regex,
    amount: Regex,
}

impl InvoiceParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            marker_line: Regex::new(
                r"(?i)^(?P<desc>.+?)\s*[-–—:|]?\s*(?P<qty>\d[\d,]*(?:\.\d+)?)\s*(?:units?|pcs|nos|strips?|bottles?)?\.?\s*(?:@|\bx\b|\bat\b)\s*(?:₹|rs\.?|inr)?\s*(?P<price>\d[\d,]*(?:\.\d+)?)",
            )?,
            column_split: Regex::new(r"\t+|\s{2,}")?,
            tax_fragment: Regex::new(r"(?i)\b(?:tax|gst|vat|igst)\s*[:@]?\s*(\d+(?:\.\d+)?)\s*%")?,
            batch: Regex::new(r"(?i)\b(?:batch(?:\s*no)?|b\.\s*no|lot)\b\s*[:#.\-]?\s*([A-Z0-9][A-Z0-9\-/]*)")?,
            expiry: Regex::new(
                r"(?i)\bexp(?:iry)?\b\.?\s*(?:date)?\s*[:\-]?\s*(\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{1,2}[/-]\d{4})",
            )?,
            non_item: Regex::new(
                r"(?i)^\s*(?:tax\s+)?(?:invoice|bill\b|inv\b|date\b|dated\b|grand\s*total|sub\s*-?\s*total|total\b|amount\b|gstin|gst\s*no|address|phone|tel\b|mobile|email|s\.?\s*no\b|sr\.?\s*no\b|description|item\b|particulars|thank)",
            )?,
            invoice_number: vec![
                Regex::new(r"(?i)invoice\s*(?:no\.?|number|#)\s*[:\-]?\s*([A-Z0-9][A-Z0-9\-/]*)")?,
                Regex::new(r"(?i)bill\s*(?:no\.?|number)\s*[:\-]?\s*([A-Z0-9][A-Z0-9\-/]*)")?,
                Regex::new(r"\b(INV[-/]?\d[A-Z0-9\-/]*)")?,
            ],
            labelled_date: Regex::new(r"(?i)\bdate[d]?\s*[:\-]?\s*(\d{1,2}[-/]\d{1,2}[-/]\d{2,4})")?,
            any_date: Regex::new(r"\b(\d{1,2}[-/]\d{1,2}[-/]\d{2,4})\b")?,
            grand_total: Regex::new(r"(?i)grand\s*total\s*[:\-]?\s*(?:₹|rs\.?|inr)?\s*(\d[\d,]*(?:\.\d+)?)")?,
            total: Regex::new(r"(?i)\btotal\b[^\d]*?(\d[\d,]*(?:\.\d+)?)")?,
            amount: Regex::new(r"(?i)\bamount\b[^\d]*?(\d[\d,]*(?:\.\d+)?)")?,
        })
    }

    pub fn parse(&self, text: &str) -> ParsedDocument {
        ParsedDocument {
            header: self.parse_header(text),
            lines: self.parse_lines(text),
        }
    }

    pub fn parse_header(&self, text: &str) -> InvoiceHeader {
        let invoice_number = self
            .invoice_number
            .iter()
            .find_map(|re| re.captures(text).map(|c| c[1].trim_end_matches(['-', '/']).to_string()));

        let invoice_date = self
            .labelled_date
            .captures(text)
            .and_then(|c| parse_date(&c[1]))
            .or_else(|| {
                text.lines()
                    .filter(|l| !self.expiry.is_match(l))
                    .find_map(|l| self.any_date.captures(l).and_then(|c| parse_date(&c[1])))
            });

        let total_amount = self
            .grand_total
            .captures(text)
            .and_then(|c| parse_decimal(&c[1]))
            .or_else(|| {
                text.lines()
                    .filter(|l| !l.to_lowercase().contains("sub"))
                    .find_map(|l| self.total.captures(l).and_then(|c| parse_decimal(&c[1])))
            })
            .or_else(|| self.amount.captures(text).and_then(|c| parse_decimal(&c[1])));

        InvoiceHeader {
            invoice_number,
            invoice_date,
            total_amount,
        }
    }

    /// 文本 -> 明细行候选；数值解析失败的行保留为 numeric_error
    pub fn parse_lines(&self, text: &str) -> Vec<LineCandidate> {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter(|l| !self.non_item.is_match(l))
            .filter_map(|l| self.parse_line(l))
            .collect()
    }

    pub fn parse_line(&self, raw: &str) -> Option<LineCandidate> {
        let batch_no = self.batch.captures(raw).map(|c| c[1].to_string());
        let expiry_date = self.expiry.captures(raw).and_then(|c| parse_expiry(&c[1]));

        if let Some(mut candidate) = self.parse_marker(raw) {
            candidate.batch_no = batch_no;
            candidate.expiry_date = expiry_date;
            return Some(candidate);
        }
        if let Some(mut candidate) = self.parse_tabular(raw, batch_no.as_deref()) {
            candidate.batch_no = batch_no;
            candidate.expiry_date = expiry_date;
            return Some(candidate);
        }

        // 形似明细但数值无法解析
        if raw.contains('@') {
            let before_at = raw.split('@').next().unwrap_or(raw);
            let desc = [" – ", " — ", " - ", " | "]
                .iter()
                .find_map(|sep| before_at.split_once(sep).map(|(d, _)| d))
                .unwrap_or(before_at);
            let desc = clean_description(desc);
            if !desc.is_empty() {
                let mut candidate = LineCandidate::unparsable(raw, desc);
                candidate.batch_no = batch_no;
                candidate.expiry_date = expiry_date;
                return Some(candidate);
            }
        }
        None
    }

    fn parse_marker(&self, raw: &str) -> Option<LineCandidate> {
        let caps = self.marker_line.captures(raw)?;
        let description = clean_description(&caps["desc"]);
        if description.is_empty() {
            return None;
        }
        let tax_rate = self
            .tax_fragment
            .captures(raw)
            .and_then(|c| parse_decimal(&c[1]));

        match (parse_decimal(&caps["qty"]), parse_decimal(&caps["price"])) {
            (Some(qty), Some(unit_price)) => Some(LineCandidate {
                raw_text: raw.to_string(),
                description,
                qty,
                unit_price,
                tax_rate: tax_rate.unwrap_or_else(BigDecimal::zero),
                batch_no: None,
                expiry_date: None,
                numeric_error: false,
            }),
            _ => Some(LineCandidate::unparsable(raw, description)),
        }
    }

    fn parse_tabular(&self, raw: &str, batch_no: Option<&str>) -> Option<LineCandidate> {
        let mut cols: Vec<&str> = self
            .column_split
            .split(raw)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
        if cols.len() < 3 {
            return None;
        }
        // 序号列
        if cols.len() >= 4 && cols[0].chars().all(|c| c.is_ascii_digit()) {
            cols.remove(0);
        }

        let description = clean_description(cols[0]);
        if description.is_empty() || parse_decimal(&description).is_some() {
            return None;
        }

        let mut numbers = Vec::new();
        let mut tax_rate = None;
        for col in &cols[1..] {
            if batch_no.is_some_and(|b| col.ends_with(b)) || self.expiry.is_match(col) {
                continue;
            }
            if let Some(pct) = col.strip_suffix('%') {
                tax_rate = parse_decimal(pct.trim());
            } else if let Some(n) = parse_decimal(col.trim_start_matches('₹')) {
                numbers.push(n);
            }
        }

        let mut numbers = numbers.into_iter();
        match (numbers.next(), numbers.next()) {
            (Some(qty), Some(unit_price)) => Some(LineCandidate {
                raw_text: raw.to_string(),
                description,
                qty,
                unit_price,
                tax_rate: tax_rate.unwrap_or_else(BigDecimal::zero),
                batch_no: None,
                expiry_date: None,
                numeric_error: false,
            }),
            _ => Some(LineCandidate::unparsable(raw, description)),
        }
    }
}

fn clean_description(s: &str) -> String {
    s.trim()
        .trim_end_matches(|c: char| c.is_whitespace() || "-–—:|,".contains(c))
        .trim()
        .to_string()
}

/// "1,200.50" -> 1200.50；负数视为无法解析
fn parse_decimal(s: &str) -> Option<BigDecimal> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() || cleaned.starts_with('-') {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}

/// dd/mm/yyyy, dd-mm-yyyy, dd/mm/yy
fn parse_date(s: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = s.split(['/', '-']).collect();
    if parts.len() != 3 {
        return None;
    }
    let day: u32 = parts[0].parse().ok()?;
    let month: u32 = parts[1].parse().ok()?;
    let year = expand_year(parts[2])?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// 效期: 完整日期，或 mm/yyyy 取当月最后一天
fn parse_expiry(s: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = s.split(['/', '-']).collect();
    match parts.len() {
        3 => parse_date(s),
        2 => {
            let month: u32 = parts[0].parse().ok()?;
            let year = expand_year(parts[1])?;
            last_day_of_month(year, month)
        }
        _ => None,
    }
}

fn expand_year(s: &str) -> Option<i32> {
    let year: i32 = s.parse().ok()?;
    match s.len() {
        2 => Some(2000 + year),
        4 => Some(year),
        _ => None,
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(first.year(), month + 1, 1)?
    };
    next.pred_opt()
}
