// 🧹 Row Normalizer - raw cells → cleaned, typed scalars
//
// Every function here is total: a malformed cell degrades to a default
// ("" / None / 0.00000) instead of failing the row.

use crate::parser::{CellValue, RawRow};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::LazyLock;

/// Fractional digits kept for every monetary figure
pub const MONEY_SCALE: u32 = 5;

/// Integer digits a monetary column holds (21 digits in total)
pub const MONEY_INTEGER_DIGITS: u32 = 16;

/// "7701234567.0" - a numeric cell coerced to text by the spreadsheet
static NUMERIC_PADDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.0+$").expect("static padding pattern"));

const DATE_FORMATS: &[&str] = &["%d.%m.%Y", "%Y-%m-%d", "%d/%m/%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

// ============================================================================
// SCALAR TRANSFORMS
// ============================================================================

fn integral(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        Some(value as i64)
    } else {
        None
    }
}

/// Digits-only identifier; empty when nothing usable remains
pub fn normalize_tax_id(cell: Option<&CellValue>) -> String {
    let raw = match cell {
        None => return String::new(),
        Some(CellValue::Integer(i)) => i.to_string(),
        Some(CellValue::Float(f)) => match integral(*f) {
            Some(i) => i.to_string(),
            None => f.to_string(),
        },
        Some(CellValue::Text(s)) => {
            let trimmed = s.trim();
            NUMERIC_PADDING.replace(trimmed, "$1").into_owned()
        }
        Some(other) => other.as_label(),
    };

    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Trimmed text; absent cells become ""
pub fn clean_text(cell: Option<&CellValue>) -> String {
    match cell {
        None => String::new(),
        Some(CellValue::Text(s)) => s.trim().to_string(),
        Some(CellValue::Float(f)) => match integral(*f) {
            Some(i) => i.to_string(),
            None => f.to_string(),
        },
        Some(other) => other.as_label().trim().to_string(),
    }
}

/// Like `clean_text`, but blank → None (for optional references)
pub fn optional_text(cell: Option<&CellValue>) -> Option<String> {
    let text = clean_text(cell);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Excel serial day number (1899-12-30 epoch) with fractional time of day
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 || serial > 2_958_465.0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    base.checked_add_signed(Duration::milliseconds(millis))
}

fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

/// Calendar date from a date, timestamp, serial number or text cell
pub fn extract_date(cell: Option<&CellValue>) -> Option<NaiveDate> {
    match cell? {
        CellValue::Date(d) => Some(*d),
        CellValue::DateTime(dt) => Some(dt.date()),
        CellValue::Float(f) => excel_serial_to_datetime(*f).map(|dt| dt.date()),
        CellValue::Integer(i) => excel_serial_to_datetime(*i as f64).map(|dt| dt.date()),
        CellValue::Text(s) => parse_date_text(s),
        CellValue::Bool(_) => None,
    }
}

/// Round half-up (away from zero) and pin the scale to `MONEY_SCALE`.
///
/// Exact for anything within `MONEY_INTEGER_DIGITS`; far larger values
/// cannot carry five fractional digits in a `Decimal` and come back with fewer.
pub fn quantize(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(MONEY_SCALE);
    rounded
}

pub fn zero_money() -> Decimal {
    quantize(Decimal::ZERO)
}

fn parse_decimal_text(raw: &str) -> Option<Decimal> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    // The separator that appears last is the decimal one; the other groups digits
    let cleaned = match (compact.rfind('.'), compact.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => compact.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => compact.replace(',', ""),
        (None, Some(_)) => compact.replace(',', "."),
        _ => compact,
    };

    Decimal::from_str(&cleaned)
        .ok()
        .or_else(|| Decimal::from_scientific(&cleaned).ok())
}

fn fits_money_column(value: &Decimal) -> bool {
    value.abs() < Decimal::from(10_i64.pow(MONEY_INTEGER_DIGITS))
}

/// Monetary figure; anything unparseable or too wide for the column is 0.00000
pub fn extract_decimal(cell: Option<&CellValue>) -> Decimal {
    let value = match cell {
        Some(CellValue::Integer(i)) => Some(Decimal::from(*i)),
        Some(CellValue::Float(f)) => Decimal::from_f64(*f),
        Some(CellValue::Text(s)) => parse_decimal_text(s),
        _ => None,
    };
    quantize(value.filter(fits_money_column).unwrap_or(Decimal::ZERO))
}

// ============================================================================
// ROW
// ============================================================================

/// The five monetary figures of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    pub debt_total: Decimal,
    pub debt_acts: Decimal,
    pub debt_current: Decimal,
    pub debt_overdue: Decimal,
    pub credit_total: Decimal,
}

impl Default for Balances {
    fn default() -> Self {
        Balances {
            debt_total: zero_money(),
            debt_acts: zero_money(),
            debt_current: zero_money(),
            debt_overdue: zero_money(),
            credit_total: zero_money(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub line: usize,
    pub tax_id: String,
    pub name: String,
    pub address: String,
    pub district: String,
    pub category: Option<String>,
    pub business_plan_category: Option<String>,
    pub contract_number: String,
    pub contract_date: Option<NaiveDate>,
    pub termination_date: Option<NaiveDate>,
    pub debt_origin_date: Option<NaiveDate>,
    pub balances: Balances,
}

pub fn normalize_row(row: &RawRow) -> NormalizedRow {
    NormalizedRow {
        line: row.line,
        tax_id: normalize_tax_id(row.tax_id.as_ref()),
        name: clean_text(row.enterprise_name.as_ref()),
        address: clean_text(row.address.as_ref()),
        district: clean_text(row.district.as_ref()),
        category: optional_text(row.category.as_ref()),
        business_plan_category: optional_text(row.business_plan_category.as_ref()),
        contract_number: clean_text(row.contract_number.as_ref()),
        contract_date: extract_date(row.contract_date.as_ref()),
        termination_date: extract_date(row.termination_date.as_ref()),
        debt_origin_date: extract_date(row.debt_origin_date.as_ref()),
        balances: Balances {
            debt_total: extract_decimal(row.receivables_total.as_ref()),
            debt_acts: extract_decimal(row.receivables_acts.as_ref()),
            debt_current: extract_decimal(row.receivables_current.as_ref()),
            debt_overdue: extract_decimal(row.receivables_overdue.as_ref()),
            credit_total: extract_decimal(row.payables_total.as_ref()),
        },
    }
}
