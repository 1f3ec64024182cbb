// 🗄️ Storage - schema, connection setup and the audit event log

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Event for audit trail: every applied change is recorded
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Open a file database ready for ingestion
pub fn open_database<P: AsRef<Path>>(path: P, busy_timeout_ms: u64) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases keep "memory")
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Lookup tables
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL
        );
        CREATE TABLE IF NOT EXISTS business_plan_categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL
        );",
    )?;

    // ==========================================================================
    // Counterparties (enrichment/org columns are never written by ingestion)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS counterparties (
            id TEXT PRIMARY KEY,
            tax_id TEXT NOT NULL CONSTRAINT tax_id CHECK (length(tax_id) <= 12),
            name TEXT NOT NULL CONSTRAINT name CHECK (length(name) <= 512),
            address TEXT NOT NULL CONSTRAINT address CHECK (length(address) <= 1024),
            district TEXT NOT NULL DEFAULT '' CONSTRAINT district CHECK (length(district) <= 16),
            category_id INTEGER REFERENCES categories(id),
            business_plan_category_id INTEGER REFERENCES business_plan_categories(id),
            enriched_name TEXT,
            enriched_address TEXT,
            counterparty_type TEXT CONSTRAINT counterparty_type
                CHECK (counterparty_type IS NULL OR counterparty_type IN ('LEGAL', 'INDIVIDUAL')),
            branch_type TEXT CONSTRAINT branch_type
                CHECK (branch_type IS NULL OR branch_type IN ('MAIN', 'BRANCH')),
            parent_id TEXT REFERENCES counterparties(id),
            kpp TEXT,
            ogrn TEXT,
            ogrn_date TEXT,
            full_name_with_legal_form TEXT,
            okved TEXT,
            legal_form_full TEXT,
            legal_form_short TEXT,
            registration_date TEXT,
            liquidation_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tax_id, address)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS contracts (
            id TEXT PRIMARY KEY,
            contract_number TEXT NOT NULL
                CONSTRAINT contract_number CHECK (length(contract_number) <= 32),
            contract_date TEXT,
            termination_date TEXT,
            counterparty_id TEXT NOT NULL REFERENCES counterparties(id),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (contract_number, counterparty_id)
        )",
        [],
    )?;

    // Money is fixed-point text with 5 fractional digits
    conn.execute(
        "CREATE TABLE IF NOT EXISTS debt_credits (
            id TEXT PRIMARY KEY,
            contract_id TEXT NOT NULL REFERENCES contracts(id),
            reporting_date TEXT,
            debt_total TEXT NOT NULL DEFAULT '0.00000',
            debt_acts TEXT NOT NULL DEFAULT '0.00000',
            debt_current TEXT NOT NULL DEFAULT '0.00000',
            debt_overdue TEXT NOT NULL DEFAULT '0.00000',
            credit_total TEXT NOT NULL DEFAULT '0.00000',
            debt_origin_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Run ledger
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_logs (
            id TEXT PRIMARY KEY,
            uploaded_by TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            file_name TEXT NOT NULL,
            rows_processed INTEGER NOT NULL DEFAULT 0 CHECK (rows_processed >= 0),
            outcome TEXT NOT NULL CHECK (outcome IN ('succeeded', 'failed')),
            error TEXT,
            artifact_ref TEXT,
            content_hash TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_counterparties_tax_id ON counterparties(tax_id);
         CREATE INDEX IF NOT EXISTS idx_contracts_number ON contracts(contract_number);
         CREATE UNIQUE INDEX IF NOT EXISTS idx_debt_credits_snapshot
             ON debt_credits(contract_id, IFNULL(reporting_date, ''));
         CREATE INDEX IF NOT EXISTS idx_upload_logs_uploaded_at ON upload_logs(uploaded_at);
         CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
         CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            event.data.to_string(),
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> rusqlite::Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
                    })?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

pub fn count_events(conn: &Connection, event_type: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM events WHERE event_type = ?1",
        [event_type],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('categories', 'business_plan_categories', 'counterparties', 'contracts',
                  'debt_credits', 'upload_logs', 'events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }

    #[test]
    fn test_named_check_constraint_reports_column() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let err = conn
            .execute(
                "INSERT INTO counterparties (id, tax_id, name, address, created_at, updated_at)
                 VALUES ('a', '12345678901234', 'Acme', 'Main St 1', 'now', 'now')",
                [],
            )
            .unwrap_err();

        assert!(err.to_string().contains("CHECK constraint failed: tax_id"), "{err}");
    }

    #[test]
    fn test_event_log() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let event = Event::new(
            "counterparty_updated",
            "counterparty",
            "test_id_123",
            serde_json::json!({"fields": {"name": "Acme Ltd"}}),
            "test_actor",
        );

        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "counterparty", "test_id_123").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "counterparty_updated");
        assert_eq!(events[0].actor, "test_actor");
        assert_eq!(events[0].data["fields"]["name"], "Acme Ltd");
        assert_eq!(count_events(&conn, "counterparty_updated").unwrap(), 1);
    }
}
