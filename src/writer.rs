// ✍️ Batch Writer - chunked bulk creates and grouped updates
//
// Runs inside the caller's transaction. A constraint violation only costs
// the offending row (SQLite aborts the statement, not the transaction);
// anything else aborts the whole run.

use crate::db::{insert_event, Event};
use crate::entities::placeholders;
use crate::error::RowFailure;
use crate::planner::{FieldSet, Matched, Reconcile};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct InsertOutcome<K> {
    /// Natural key → newly assigned UUID
    pub created: Vec<(K, String)>,
    pub failures: Vec<RowFailure>,
}

#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub applied: usize,
    pub changed_fields: usize,
    pub failures: Vec<RowFailure>,
}

/// Column named by a constraint message.
///
/// "CHECK constraint failed: tax_id" → tax_id,
/// "UNIQUE constraint failed: contracts.contract_number, contracts.counterparty_id" → contract_number,
/// "UNIQUE constraint failed: index 'idx_debt_credits_snapshot'" → idx_debt_credits_snapshot.
pub fn constraint_field(message: &str) -> String {
    let Some((_, detail)) = message.split_once("failed: ") else {
        return String::new();
    };

    if let Some(index) = detail.strip_prefix("index ") {
        return index.trim_matches('\'').to_string();
    }

    let first = detail.split(',').next().unwrap_or(detail).trim();
    match first.split_once('.') {
        Some((_, column)) => column.to_string(),
        None => first.to_string(),
    }
}

/// Per-row outcome of one statement execution
fn classify(result: rusqlite::Result<usize>) -> rusqlite::Result<Result<(), String>> {
    match result {
        Ok(_) => Ok(Ok(())),
        Err(rusqlite::Error::SqliteFailure(err, message)) if err.code == ErrorCode::ConstraintViolation => {
            Ok(Err(message.unwrap_or_else(|| err.to_string())))
        }
        Err(e) => Err(e),
    }
}

fn failure<C: Reconcile>(candidate: &C, message: String) -> RowFailure {
    let rejected = RowFailure::new(C::LEVEL, candidate.key_label(), constraint_field(&message), message);
    warn!(entity = %rejected.level, key = %rejected.natural_key, field = %rejected.field, "row rejected: {}", rejected.message);
    rejected
}

/// Create every candidate, assigning UUIDs here rather than in SQL
pub fn insert_batch<C: Reconcile>(
    conn: &Connection,
    candidates: &[&C],
    batch_size: usize,
) -> rusqlite::Result<InsertOutcome<C::Key>> {
    let columns: Vec<&str> = std::iter::once("id")
        .chain(C::COLUMNS.iter().copied())
        .chain(["created_at", "updated_at"])
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        C::TABLE,
        columns.join(", "),
        placeholders(columns.len())
    );

    let mut outcome = InsertOutcome {
        created: Vec::with_capacity(candidates.len()),
        failures: Vec::new(),
    };

    for (chunk_no, chunk) in candidates.chunks(batch_size.max(1)).enumerate() {
        let mut stmt = conn.prepare_cached(&sql)?;
        let now = Utc::now().to_rfc3339();

        for candidate in chunk {
            let id = uuid::Uuid::new_v4().to_string();
            let mut values = Vec::with_capacity(columns.len());
            values.push(Value::Text(id.clone()));
            values.extend(C::COLUMNS.iter().map(|column| candidate.value(column)));
            values.push(Value::Text(now.clone()));
            values.push(Value::Text(now.clone()));

            match classify(stmt.execute(params_from_iter(values)))? {
                Ok(()) => outcome.created.push((candidate.key(), id)),
                Err(message) => outcome.failures.push(failure(*candidate, message)),
            }
        }

        debug!(table = C::TABLE, chunk = chunk_no, rows = chunk.len(), "insert chunk written");
    }

    Ok(outcome)
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => json!(i),
        Value::Real(f) => json!(f),
        Value::Text(s) => json!(s),
        Value::Blob(b) => json!(b.len()),
    }
}

/// Apply each homogeneous update group with one statement shape.
///
/// Only the changed columns (plus `updated_at`) are written, so columns
/// owned by other processes are never touched. Each applied row gets an
/// audit event carrying the new values.
pub fn apply_updates<C: Reconcile>(
    conn: &Connection,
    updates: &BTreeMap<FieldSet, Vec<Matched<'_, C>>>,
    batch_size: usize,
    actor: &str,
) -> rusqlite::Result<UpdateOutcome> {
    let mut outcome = UpdateOutcome::default();
    let event_type = format!("{}_updated", C::LEVEL);

    for (fields, rows) in updates {
        let assignments: Vec<String> = fields
            .iter()
            .map(|field| format!("{field} = ?"))
            .chain(std::iter::once("updated_at = ?".to_string()))
            .collect();
        let sql = format!("UPDATE {} SET {} WHERE id = ?", C::TABLE, assignments.join(", "));

        for chunk in rows.chunks(batch_size.max(1)) {
            let mut stmt = conn.prepare_cached(&sql)?;
            let now = Utc::now().to_rfc3339();

            for matched in chunk {
                let new_values: Vec<Value> = fields.iter().map(|field| matched.candidate.value(field)).collect();
                let params = new_values
                    .iter()
                    .cloned()
                    .chain([Value::Text(now.clone()), Value::Text(matched.id.clone())]);

                match classify(stmt.execute(params_from_iter(params)))? {
                    Ok(()) => {
                        outcome.applied += 1;
                        outcome.changed_fields += fields.len();

                        let changes: serde_json::Map<String, serde_json::Value> = fields
                            .iter()
                            .zip(&new_values)
                            .map(|(field, value)| (field.to_string(), json_value(value)))
                            .collect();
                        let event = Event::new(
                            &event_type,
                            C::LEVEL.as_str(),
                            &matched.id,
                            json!({ "fields": changes }),
                            actor,
                        );
                        insert_event(conn, &event)?;
                    }
                    Err(message) => outcome.failures.push(failure(matched.candidate, message)),
                }
            }

            debug!(table = C::TABLE, fields = ?fields, rows = chunk.len(), "update chunk applied");
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_events_for_entity, setup_database};
    use crate::entities::counterparty::{self, CounterpartyCandidate};
    use crate::planner::UpsertPlan;

    fn candidate(tax_id: &str, address: &str, name: &str) -> CounterpartyCandidate {
        CounterpartyCandidate {
            line: 2,
            tax_id: tax_id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            district: "North".to_string(),
            category_id: None,
            business_plan_category_id: None,
        }
    }

    #[test]
    fn test_constraint_field_parsing() {
        assert_eq!(constraint_field("CHECK constraint failed: tax_id"), "tax_id");
        assert_eq!(
            constraint_field("UNIQUE constraint failed: counterparties.tax_id, counterparties.address"),
            "tax_id"
        );
        assert_eq!(constraint_field("NOT NULL constraint failed: contracts.counterparty_id"), "counterparty_id");
        assert_eq!(
            constraint_field("UNIQUE constraint failed: index 'idx_debt_credits_snapshot'"),
            "idx_debt_credits_snapshot"
        );
        assert_eq!(constraint_field("FOREIGN KEY constraint failed"), "");
    }

    #[test]
    fn test_insert_batch_isolates_constraint_failures() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let rows = vec![
            candidate("111", "Main St 1", "Acme"),
            candidate("12345678901234", "Main St 2", "Too long"),
            candidate("333", "Main St 3", "Globex"),
        ];
        let refs: Vec<&CounterpartyCandidate> = rows.iter().collect();

        let outcome = insert_batch(&conn, &refs, 2).unwrap();

        assert_eq!(outcome.created.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].field, "tax_id");
        assert_eq!(outcome.failures[0].natural_key, "12345678901234 @ Main St 2");
        assert_eq!(counterparty::count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_apply_updates_writes_only_changed_fields_and_events() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let original = vec![candidate("111", "Main St 1", "Acme")];
        let refs: Vec<&CounterpartyCandidate> = original.iter().collect();
        insert_batch(&conn, &refs, 500).unwrap();
        conn.execute("UPDATE counterparties SET kpp = '770101001'", []).unwrap();

        let desired = vec![candidate("111", "Main St 1", "Acme Ltd")];
        let existing = counterparty::load_by_tax_ids(&conn, &["111"], 500).unwrap();
        let plan = UpsertPlan::build(&desired, existing);
        let outcome = apply_updates(&conn, &plan.updates, 500, "tester").unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.changed_fields, 1);

        let (name, kpp): (String, String) = conn
            .query_row("SELECT name, kpp FROM counterparties", [], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        assert_eq!(name, "Acme Ltd");
        assert_eq!(kpp, "770101001");

        let id = &plan.updates.values().next().unwrap()[0].id;
        let events = get_events_for_entity(&conn, "counterparty", id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "counterparty_updated");
        assert_eq!(events[0].data["fields"]["name"], "Acme Ltd");
    }
}
