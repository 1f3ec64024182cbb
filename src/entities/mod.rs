// 🏛️ Entity Models - persisted rows and the candidates that reconcile into them
//
// Identity is a UUID assigned once at creation. Matching happens on the
// natural key of each entity, never on the UUID.

pub mod category;
pub mod contract;
pub mod counterparty;
pub mod debt_credit;

pub use category::{resolve_lookups, LookupEntry, LookupKind};
pub use contract::{Contract, ContractCandidate};
pub use counterparty::{Counterparty, CounterpartyCandidate, CounterpartyKey};
pub use debt_credit::{DebtCredit, DebtCreditCandidate, DebtCreditKey};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rusqlite::types::{Type, Value};
use std::str::FromStr;

/// "?, ?, ?" for an IN list
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(crate) fn date_value(date: Option<NaiveDate>) -> Value {
    match date {
        Some(d) => Value::Text(d.format("%Y-%m-%d").to_string()),
        None => Value::Null,
    }
}

pub(crate) fn money_value(amount: &Decimal) -> Value {
    Value::Text(amount.to_string())
}

pub(crate) fn optional_id_value(id: Option<i64>) -> Value {
    match id {
        Some(id) => Value::Integer(id),
        None => Value::Null,
    }
}

/// Monetary columns are fixed-point text
pub(crate) fn read_money(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn read_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}
