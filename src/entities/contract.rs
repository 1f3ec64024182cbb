// 📄 Contract Entity - an agreement with one counterparty
//
// Natural key: the contract number. Ownership is an ordinary field, so a
// contract that moves to another counterparty is updated in place.

use super::{date_value, placeholders, read_timestamp};
use crate::error::EntityLevel;
use crate::planner::{diff_field, FieldSet, Reconcile};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub contract_number: String,
    pub contract_date: Option<NaiveDate>,
    pub termination_date: Option<NaiveDate>,
    pub counterparty_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Contract {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Contract {
            id: row.get(0)?,
            contract_number: row.get(1)?,
            contract_date: row.get(2)?,
            termination_date: row.get(3)?,
            counterparty_id: row.get(4)?,
            created_at: read_timestamp(row, 5)?,
            updated_at: read_timestamp(row, 6)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractCandidate {
    pub line: usize,
    pub contract_number: String,
    pub contract_date: Option<NaiveDate>,
    pub termination_date: Option<NaiveDate>,
    /// Resolved owner; rows whose owner did not resolve never become candidates
    pub counterparty_id: String,
}

impl Reconcile for ContractCandidate {
    type Key = String;
    type Existing = Contract;

    const TABLE: &'static str = "contracts";
    const LEVEL: EntityLevel = EntityLevel::Contract;
    const COLUMNS: &'static [&'static str] =
        &["contract_number", "contract_date", "termination_date", "counterparty_id"];

    fn key(&self) -> String {
        self.contract_number.clone()
    }

    fn existing_key(existing: &Contract) -> String {
        existing.contract_number.clone()
    }

    fn existing_id(existing: &Contract) -> &str {
        &existing.id
    }

    fn changed_fields(&self, existing: &Contract) -> FieldSet {
        let mut fields = Vec::new();
        diff_field(&mut fields, "contract_date", &self.contract_date, &existing.contract_date);
        diff_field(&mut fields, "termination_date", &self.termination_date, &existing.termination_date);
        diff_field(&mut fields, "counterparty_id", &self.counterparty_id, &existing.counterparty_id);
        fields
    }

    fn value(&self, field: &str) -> Value {
        match field {
            "contract_number" => Value::Text(self.contract_number.clone()),
            "contract_date" => date_value(self.contract_date),
            "termination_date" => date_value(self.termination_date),
            "counterparty_id" => Value::Text(self.counterparty_id.clone()),
            _ => Value::Null,
        }
    }

    fn key_label(&self) -> String {
        self.contract_number.clone()
    }
}

/// Bulk-load contracts by number, oldest first
pub fn load_by_numbers(
    conn: &Connection,
    numbers: &[&str],
    chunk_size: usize,
) -> rusqlite::Result<Vec<Contract>> {
    let mut loaded = Vec::new();

    for chunk in numbers.chunks(chunk_size.max(1)) {
        let sql = format!(
            "SELECT id, contract_number, contract_date, termination_date, counterparty_id,
                    created_at, updated_at
             FROM contracts
             WHERE contract_number IN ({})
             ORDER BY created_at, id",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), Contract::from_row)?;
        for row in rows {
            loaded.push(row?);
        }
    }

    Ok(loaded)
}

pub fn count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM contracts", [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use rusqlite::params;

    fn seed(conn: &Connection) {
        conn.execute(
            "INSERT INTO counterparties (id, tax_id, name, address, created_at, updated_at)
             VALUES ('cp-1', '111', 'Acme', 'Main St 1', '2025-01-01T00:00:00+00:00', '2025-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        for (id, number, date) in [("k-1", "C-1", Some("2024-02-01")), ("k-2", "C-2", None)] {
            conn.execute(
                "INSERT INTO contracts (id, contract_number, contract_date, counterparty_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'cp-1', '2025-01-01T00:00:00+00:00', '2025-01-01T00:00:00+00:00')",
                params![id, number, date],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_load_by_numbers_reads_dates() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        seed(&conn);

        let loaded = load_by_numbers(&conn, &["C-1", "C-2", "C-3"], 500).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].contract_date, NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(loaded[1].contract_date, None);
        assert_eq!(count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_owner_change_is_a_field_change() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        seed(&conn);
        let existing = load_by_numbers(&conn, &["C-1"], 500).unwrap().remove(0);

        let candidate = ContractCandidate {
            line: 3,
            contract_number: "C-1".to_string(),
            contract_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            termination_date: None,
            counterparty_id: "cp-2".to_string(),
        };

        assert_eq!(candidate.changed_fields(&existing), vec!["counterparty_id"]);
        assert_eq!(candidate.value("contract_date"), Value::Text("2024-02-01".to_string()));
    }
}
