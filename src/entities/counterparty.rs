// 🏢 Counterparty Entity - a business partner identified by (tax id, address)
//
// Identity: UUID (never changes)
// Natural key: tax id + address. One legal entity may appear at several
// addresses (branches), each its own counterparty.
// Enrichment and organizational columns (kpp, ogrn, legal form...) are owned
// by other processes; ingestion never writes them.

use super::{optional_id_value, placeholders, read_timestamp};
use crate::error::EntityLevel;
use crate::planner::{diff_field, FieldSet, Reconcile};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterpartyKey {
    pub tax_id: String,
    pub address: String,
}

impl CounterpartyKey {
    pub fn new(tax_id: impl Into<String>, address: impl Into<String>) -> Self {
        CounterpartyKey {
            tax_id: tax_id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for CounterpartyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.tax_id, self.address)
    }
}

/// Persisted counterparty, as far as ingestion cares about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterparty {
    pub id: String,
    pub tax_id: String,
    pub name: String,
    pub address: String,
    pub district: String,
    pub category_id: Option<i64>,
    pub business_plan_category_id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Counterparty {
    pub fn key(&self) -> CounterpartyKey {
        CounterpartyKey::new(&self.tax_id, &self.address)
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Counterparty {
            id: row.get(0)?,
            tax_id: row.get(1)?,
            name: row.get(2)?,
            address: row.get(3)?,
            district: row.get(4)?,
            category_id: row.get(5)?,
            business_plan_category_id: row.get(6)?,
            created_at: read_timestamp(row, 7)?,
            updated_at: read_timestamp(row, 8)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, tax_id, name, address, district, category_id, \
     business_plan_category_id, created_at, updated_at";

/// Desired state of one counterparty, built from the first row carrying its key
#[derive(Debug, Clone, PartialEq)]
pub struct CounterpartyCandidate {
    pub line: usize,
    pub tax_id: String,
    pub name: String,
    pub address: String,
    pub district: String,
    pub category_id: Option<i64>,
    pub business_plan_category_id: Option<i64>,
}

impl Reconcile for CounterpartyCandidate {
    type Key = CounterpartyKey;
    type Existing = Counterparty;

    const TABLE: &'static str = "counterparties";
    const LEVEL: EntityLevel = EntityLevel::Counterparty;
    const COLUMNS: &'static [&'static str] = &[
        "tax_id",
        "name",
        "address",
        "district",
        "category_id",
        "business_plan_category_id",
    ];

    fn key(&self) -> CounterpartyKey {
        CounterpartyKey::new(&self.tax_id, &self.address)
    }

    fn existing_key(existing: &Counterparty) -> CounterpartyKey {
        existing.key()
    }

    fn existing_id(existing: &Counterparty) -> &str {
        &existing.id
    }

    fn changed_fields(&self, existing: &Counterparty) -> FieldSet {
        let mut fields = Vec::new();
        diff_field(&mut fields, "name", &self.name, &existing.name);
        diff_field(&mut fields, "district", &self.district, &existing.district);
        diff_field(&mut fields, "category_id", &self.category_id, &existing.category_id);
        diff_field(
            &mut fields,
            "business_plan_category_id",
            &self.business_plan_category_id,
            &existing.business_plan_category_id,
        );
        fields
    }

    fn value(&self, field: &str) -> Value {
        match field {
            "tax_id" => Value::Text(self.tax_id.clone()),
            "name" => Value::Text(self.name.clone()),
            "address" => Value::Text(self.address.clone()),
            "district" => Value::Text(self.district.clone()),
            "category_id" => optional_id_value(self.category_id),
            "business_plan_category_id" => optional_id_value(self.business_plan_category_id),
            _ => Value::Null,
        }
    }

    fn key_label(&self) -> String {
        self.key().to_string()
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// Bulk-load every counterparty carrying one of `tax_ids`
pub fn load_by_tax_ids(
    conn: &Connection,
    tax_ids: &[&str],
    chunk_size: usize,
) -> rusqlite::Result<Vec<Counterparty>> {
    let mut loaded = Vec::new();

    for chunk in tax_ids.chunks(chunk_size.max(1)) {
        let sql = format!(
            "SELECT {} FROM counterparties WHERE tax_id IN ({}) ORDER BY created_at, id",
            SELECT_COLUMNS,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), Counterparty::from_row)?;
        for row in rows {
            loaded.push(row?);
        }
    }

    Ok(loaded)
}

pub fn find_by_key(conn: &Connection, key: &CounterpartyKey) -> rusqlite::Result<Option<Counterparty>> {
    let sql = format!(
        "SELECT {} FROM counterparties WHERE tax_id = ?1 AND address = ?2",
        SELECT_COLUMNS
    );
    conn.query_row(&sql, params![key.tax_id, key.address], Counterparty::from_row)
        .optional()
}

pub fn count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM counterparties", [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn insert(conn: &Connection, id: &str, tax_id: &str, address: &str, created_at: &str) {
        conn.execute(
            "INSERT INTO counterparties (id, tax_id, name, address, district, created_at, updated_at)
             VALUES (?1, ?2, 'Acme', ?3, 'North', ?4, ?4)",
            params![id, tax_id, address, created_at],
        )
        .unwrap();
    }

    fn candidate(name: &str, district: &str, category_id: Option<i64>) -> CounterpartyCandidate {
        CounterpartyCandidate {
            line: 2,
            tax_id: "7701234567".to_string(),
            name: name.to_string(),
            address: "Main St 1".to_string(),
            district: district.to_string(),
            category_id,
            business_plan_category_id: None,
        }
    }

    #[test]
    fn test_load_by_tax_ids_in_chunks() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        insert(&conn, "a", "111", "Main St 1", "2025-01-01T00:00:00+00:00");
        insert(&conn, "b", "111", "Main St 2", "2025-01-02T00:00:00+00:00");
        insert(&conn, "c", "222", "Main St 1", "2025-01-03T00:00:00+00:00");
        insert(&conn, "d", "333", "Main St 1", "2025-01-04T00:00:00+00:00");

        let loaded = load_by_tax_ids(&conn, &["111", "222", "999"], 1).unwrap();

        let ids: Vec<&str> = loaded.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(count(&conn).unwrap(), 4);
    }

    #[test]
    fn test_find_by_key() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        insert(&conn, "a", "111", "Main St 1", "2025-01-01T00:00:00+00:00");

        let found = find_by_key(&conn, &CounterpartyKey::new("111", "Main St 1")).unwrap();
        assert_eq!(found.map(|c| c.id), Some("a".to_string()));

        let missing = find_by_key(&conn, &CounterpartyKey::new("111", "Elsewhere")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_changed_fields_ignore_key_columns() {
        let existing = Counterparty {
            id: "a".to_string(),
            tax_id: "7701234567".to_string(),
            name: "Acme".to_string(),
            address: "Main St 1".to_string(),
            district: "North".to_string(),
            category_id: Some(1),
            business_plan_category_id: None,
            created_at: None,
            updated_at: None,
        };

        assert!(candidate("Acme", "North", Some(1)).changed_fields(&existing).is_empty());
        assert_eq!(
            candidate("Acme Ltd", "North", None).changed_fields(&existing),
            vec!["name", "category_id"]
        );
    }
}
