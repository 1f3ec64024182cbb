// 🏷️ Lookup Entities - categories and business-plan categories
//
// Plain name lookups with integer ids. Rows are only ever inserted:
// a name seen once keeps its id forever, nothing is renamed or deleted.

use super::placeholders;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    Category,
    BusinessPlanCategory,
}

impl LookupKind {
    pub fn table(&self) -> &'static str {
        match self {
            LookupKind::Category => "categories",
            LookupKind::BusinessPlanCategory => "business_plan_categories",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    pub id: i64,
    pub name: String,
}

/// Fetch the entries whose names are in `names`, chunked
pub fn load_by_names(
    conn: &Connection,
    kind: LookupKind,
    names: &[&str],
    chunk_size: usize,
) -> rusqlite::Result<HashMap<String, LookupEntry>> {
    let mut found = HashMap::new();

    for chunk in names.chunks(chunk_size.max(1)) {
        let sql = format!(
            "SELECT id, name FROM {} WHERE name IN ({})",
            kind.table(),
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok(LookupEntry {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        for entry in rows {
            let entry = entry?;
            found.insert(entry.name.clone(), entry);
        }
    }

    Ok(found)
}

/// Insert-or-fetch every distinct non-blank name.
///
/// Existing names are loaded first; only the missing ones are inserted
/// (`ON CONFLICT DO NOTHING`, so a concurrent insert of the same name is
/// harmless), then everything is reloaded to learn the new ids.
pub fn resolve_lookups<'n, I>(
    conn: &Connection,
    kind: LookupKind,
    names: I,
    batch_size: usize,
) -> rusqlite::Result<HashMap<String, LookupEntry>>
where
    I: IntoIterator<Item = &'n str>,
{
    let wanted: BTreeSet<&str> = names
        .into_iter()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();
    if wanted.is_empty() {
        return Ok(HashMap::new());
    }
    let wanted: Vec<&str> = wanted.into_iter().collect();

    let existing = load_by_names(conn, kind, &wanted, batch_size)?;
    let missing: Vec<&str> = wanted
        .iter()
        .copied()
        .filter(|name| !existing.contains_key(*name))
        .collect();

    if missing.is_empty() {
        return Ok(existing);
    }

    for chunk in missing.chunks(batch_size.max(1)) {
        let values = vec!["(?)"; chunk.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} (name) VALUES {} ON CONFLICT(name) DO NOTHING",
            kind.table(),
            values
        );
        conn.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    debug!(table = kind.table(), inserted = missing.len(), "lookup names created");

    load_by_names(conn, kind, &wanted, batch_size)
}

/// Every entry of one lookup table, by name
pub fn list_all(conn: &Connection, kind: LookupKind) -> rusqlite::Result<Vec<LookupEntry>> {
    let sql = format!("SELECT id, name FROM {} ORDER BY name", kind.table());
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([], |row| {
            Ok(LookupEntry {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}
