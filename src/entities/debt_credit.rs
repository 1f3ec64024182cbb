// 💰 Debt/Credit Snapshot - balances of one contract at one reporting date
//
// Natural key: (contract id, reporting date). A missing reporting date is
// its own key value, so a report without a date still maps to exactly one
// snapshot per contract. Older snapshots are history and never touched.

use super::{date_value, money_value, placeholders, read_money, read_timestamp};
use crate::error::EntityLevel;
use crate::normalize::Balances;
use crate::planner::{diff_field, FieldSet, Reconcile};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebtCreditKey {
    pub contract_id: String,
    pub reporting_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtCredit {
    pub id: String,
    pub contract_id: String,
    pub reporting_date: Option<NaiveDate>,
    pub balances: Balances,
    pub debt_origin_date: Option<NaiveDate>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DebtCredit {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(DebtCredit {
            id: row.get(0)?,
            contract_id: row.get(1)?,
            reporting_date: row.get(2)?,
            balances: Balances {
                debt_total: read_money(row, 3)?,
                debt_acts: read_money(row, 4)?,
                debt_current: read_money(row, 5)?,
                debt_overdue: read_money(row, 6)?,
                credit_total: read_money(row, 7)?,
            },
            debt_origin_date: row.get(8)?,
            created_at: read_timestamp(row, 9)?,
            updated_at: read_timestamp(row, 10)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebtCreditCandidate {
    pub line: usize,
    pub contract_id: String,
    /// Only used to label failures
    pub contract_number: String,
    pub reporting_date: Option<NaiveDate>,
    pub balances: Balances,
    pub debt_origin_date: Option<NaiveDate>,
}

impl Reconcile for DebtCreditCandidate {
    type Key = DebtCreditKey;
    type Existing = DebtCredit;

    const TABLE: &'static str = "debt_credits";
    const LEVEL: EntityLevel = EntityLevel::DebtCredit;
    const COLUMNS: &'static [&'static str] = &[
        "contract_id",
        "reporting_date",
        "debt_total",
        "debt_acts",
        "debt_current",
        "debt_overdue",
        "credit_total",
        "debt_origin_date",
    ];

    fn key(&self) -> DebtCreditKey {
        DebtCreditKey {
            contract_id: self.contract_id.clone(),
            reporting_date: self.reporting_date,
        }
    }

    fn existing_key(existing: &DebtCredit) -> DebtCreditKey {
        DebtCreditKey {
            contract_id: existing.contract_id.clone(),
            reporting_date: existing.reporting_date,
        }
    }

    fn existing_id(existing: &DebtCredit) -> &str {
        &existing.id
    }

    fn changed_fields(&self, existing: &DebtCredit) -> FieldSet {
        let (new, old) = (&self.balances, &existing.balances);
        let mut fields = Vec::new();
        diff_field(&mut fields, "debt_total", &new.debt_total, &old.debt_total);
        diff_field(&mut fields, "debt_acts", &new.debt_acts, &old.debt_acts);
        diff_field(&mut fields, "debt_current", &new.debt_current, &old.debt_current);
        diff_field(&mut fields, "debt_overdue", &new.debt_overdue, &old.debt_overdue);
        diff_field(&mut fields, "credit_total", &new.credit_total, &old.credit_total);
        diff_field(&mut fields, "debt_origin_date", &self.debt_origin_date, &existing.debt_origin_date);
        fields
    }

    fn value(&self, field: &str) -> Value {
        match field {
            "contract_id" => Value::Text(self.contract_id.clone()),
            "reporting_date" => date_value(self.reporting_date),
            "debt_total" => money_value(&self.balances.debt_total),
            "debt_acts" => money_value(&self.balances.debt_acts),
            "debt_current" => money_value(&self.balances.debt_current),
            "debt_overdue" => money_value(&self.balances.debt_overdue),
            "credit_total" => money_value(&self.balances.credit_total),
            "debt_origin_date" => date_value(self.debt_origin_date),
            _ => Value::Null,
        }
    }

    fn key_label(&self) -> String {
        match self.reporting_date {
            Some(date) => format!("{} @ {}", self.contract_number, date),
            None => format!("{} @ (no date)", self.contract_number),
        }
    }
}

/// Bulk-load the snapshots of `contract_ids` for one reporting date
pub fn load_for_contracts(
    conn: &Connection,
    contract_ids: &[&str],
    reporting_date: Option<NaiveDate>,
    chunk_size: usize,
) -> rusqlite::Result<Vec<DebtCredit>> {
    let date = date_value(reporting_date);
    let mut loaded = Vec::new();

    for chunk in contract_ids.chunks(chunk_size.max(1)) {
        let sql = format!(
            "SELECT id, contract_id, reporting_date, debt_total, debt_acts, debt_current,
                    debt_overdue, credit_total, debt_origin_date, created_at, updated_at
             FROM debt_credits
             WHERE contract_id IN ({})
               AND IFNULL(reporting_date, '') = IFNULL(?, '')
             ORDER BY created_at, id",
            placeholders(chunk.len())
        );
        let params: Vec<Value> = chunk
            .iter()
            .map(|id| Value::Text(id.to_string()))
            .chain(std::iter::once(date.clone()))
            .collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), DebtCredit::from_row)?;
        for row in rows {
            loaded.push(row?);
        }
    }

    Ok(loaded)
}

pub fn list_for_contract(conn: &Connection, contract_id: &str) -> rusqlite::Result<Vec<DebtCredit>> {
    let mut stmt = conn.prepare(
        "SELECT id, contract_id, reporting_date, debt_total, debt_acts, debt_current,
                debt_overdue, credit_total, debt_origin_date, created_at, updated_at
         FROM debt_credits
         WHERE contract_id = ?1
         ORDER BY reporting_date",
    )?;
    let snapshots = stmt
        .query_map([contract_id], DebtCredit::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(snapshots)
}

pub fn count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM debt_credits", [], |row| row.get(0))
}
