// 📒 Run Ledger - one audit row per ingestion attempt, plus artifact retention
//
// Every call to `ingest` leaves exactly one ledger row: `succeeded` with the
// true row count (written in the run's own transaction) or `failed` with
// zero rows (written after the run's transaction has been rolled back).

use crate::error::IngestError;
use crate::parser::ArtifactFormat;
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cell::OnceCell;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Already-authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Actor { id: id.into() }
    }
}

/// Uploaded bytes plus the name the caller gave them, if any
#[derive(Debug, Clone)]
pub struct Artifact {
    pub content: Vec<u8>,
    pub name: Option<String>,
}

impl Artifact {
    pub fn new(content: Vec<u8>, name: Option<String>) -> Self {
        Artifact { content, name }
    }

    /// SHA-256 of the raw bytes, hex encoded
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.content);
        format!("{:x}", hasher.finalize())
    }

    /// Caller's file name stripped of any directory part, or a timestamped default
    pub fn file_name(&self, now: DateTime<Utc>) -> String {
        self.name
            .as_deref()
            .and_then(|name| Path::new(name.trim()).file_name())
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| default_artifact_name(ArtifactFormat::detect(&self.content), now))
    }
}

/// `counterparty-report-YYYYmmddHHMMSS.<ext>`
pub fn default_artifact_name(format: ArtifactFormat, now: DateTime<Utc>) -> String {
    format!(
        "counterparty-report-{}.{}",
        now.format("%Y%m%d%H%M%S"),
        format.extension()
    )
}

/// Opaque locator of a retained artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef(pub String);

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where uploaded artifacts are kept
pub trait ArtifactStore {
    fn retain(&self, content: &[u8], suggested_name: &str, actor: &Actor) -> anyhow::Result<ArtifactRef>;
}

/// Stores artifacts under `<root>/uploads/YYYY/MM/`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        FsArtifactStore { root: root.into() }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn retain(&self, content: &[u8], suggested_name: &str, _actor: &Actor) -> anyhow::Result<ArtifactRef> {
        let now = Utc::now();
        let relative_dir = PathBuf::from("uploads")
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string());
        let dir = self.root.join(&relative_dir);
        fs::create_dir_all(&dir).with_context(|| format!("Creating {}", dir.display()))?;

        // Never overwrite an earlier upload with the same name
        let mut file_name = suggested_name.to_string();
        if dir.join(&file_name).exists() {
            let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
            file_name = match suggested_name.rsplit_once('.') {
                Some((stem, ext)) => format!("{stem}_{suffix}.{ext}"),
                None => format!("{suggested_name}_{suffix}"),
            };
        }

        let path = dir.join(&file_name);
        fs::write(&path, content).with_context(|| format!("Writing {}", path.display()))?;

        let relative = relative_dir.join(&file_name);
        Ok(ArtifactRef(relative.to_string_lossy().replace('\\', "/")))
    }
}

// ============================================================================
// LEDGER ROWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "succeeded" {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub file_name: String,
    pub rows_processed: u64,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub artifact_ref: Option<String>,
    pub content_hash: String,
}

pub fn append(conn: &Connection, entry: &LedgerEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO upload_logs (
            id, uploaded_by, uploaded_at, file_name, rows_processed,
            outcome, error, artifact_ref, content_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.id,
            entry.uploaded_by,
            entry.uploaded_at.to_rfc3339(),
            entry.file_name,
            entry.rows_processed as i64,
            entry.outcome.as_str(),
            entry.error,
            entry.artifact_ref,
            entry.content_hash,
        ],
    )?;
    Ok(())
}

/// Most recent entries first
pub fn list_entries(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, uploaded_by, uploaded_at, file_name, rows_processed,
                outcome, error, artifact_ref, content_hash
         FROM upload_logs
         ORDER BY uploaded_at DESC, rowid DESC
         LIMIT ?1",
    )?;

    let entries = stmt
        .query_map([limit as i64], |row| {
            let uploaded_at: String = row.get(2)?;
            let rows_processed: i64 = row.get(4)?;
            let outcome: String = row.get(5)?;

            Ok(LedgerEntry {
                id: row.get(0)?,
                uploaded_by: row.get(1)?,
                uploaded_at: DateTime::parse_from_rfc3339(&uploaded_at)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
                    })?
                    .with_timezone(&Utc),
                file_name: row.get(3)?,
                rows_processed: rows_processed.max(0) as u64,
                outcome: RunOutcome::parse(&outcome),
                error: row.get(6)?,
                artifact_ref: row.get(7)?,
                content_hash: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

// ============================================================================
// RUN CONTEXT
// ============================================================================

/// Everything one ingestion attempt needs to account for itself
pub struct RunContext<'a> {
    pub ledger_id: String,
    pub started_at: DateTime<Utc>,
    pub file_name: String,
    pub content_hash: String,
    pub artifact: &'a Artifact,
    pub actor: &'a Actor,
    pub store: &'a dyn ArtifactStore,
    retained: OnceCell<Option<String>>,
}

impl<'a> RunContext<'a> {
    pub fn new(artifact: &'a Artifact, actor: &'a Actor, store: &'a dyn ArtifactStore) -> Self {
        let started_at = Utc::now();
        RunContext {
            ledger_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            file_name: artifact.file_name(started_at),
            content_hash: artifact.content_hash(),
            artifact,
            actor,
            store,
            retained: OnceCell::new(),
        }
    }

    /// Best effort: a storage failure is logged and yields `None`.
    /// The store is asked at most once per run; later calls reuse the answer.
    pub fn retain_artifact(&self) -> Option<String> {
        self.retained
            .get_or_init(|| match self.store.retain(&self.artifact.content, &self.file_name, self.actor) {
                Ok(reference) => Some(reference.0),
                Err(e) => {
                    warn!(ledger_id = %self.ledger_id, "artifact retention failed: {e:#}");
                    None
                }
            })
            .clone()
    }

    pub fn entry(&self, outcome: RunOutcome, rows_processed: u64, error: Option<String>, artifact_ref: Option<String>) -> LedgerEntry {
        LedgerEntry {
            id: self.ledger_id.clone(),
            uploaded_by: self.actor.id.clone(),
            uploaded_at: self.started_at,
            file_name: self.file_name.clone(),
            rows_processed,
            outcome,
            error,
            artifact_ref,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Run `work`; if it fails, record a `failed` ledger row and hand the
/// original error back.
///
/// By the time the failure path runs, `work` has returned and any
/// transaction it opened has been dropped (rolled back), so the failed
/// entry is the only trace the attempt leaves. An artifact already
/// retained inside `work` is referenced, not stored again. Errors while recording it
/// are logged and swallowed.
pub fn guarded<T, F>(conn: &mut Connection, ctx: &RunContext<'_>, work: F) -> Result<T, IngestError>
where
    F: FnOnce(&mut Connection) -> Result<T, IngestError>,
{
    match work(conn) {
        Ok(value) => Ok(value),
        Err(err) => {
            error!(ledger_id = %ctx.ledger_id, file = %ctx.file_name, "ingestion failed: {err}");
            let artifact_ref = ctx.retain_artifact();
            let entry = ctx.entry(RunOutcome::Failed, 0, Some(err.to_string()), artifact_ref);
            match append(conn, &entry) {
                Ok(()) => info!(ledger_id = %ctx.ledger_id, "failed run recorded"),
                Err(ledger_err) => error!(ledger_id = %ctx.ledger_id, "could not record failed run: {ledger_err}"),
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::error::ParseError;
    use chrono::TimeZone;

    struct NullStore;

    impl ArtifactStore for NullStore {
        fn retain(&self, _content: &[u8], name: &str, _actor: &Actor) -> anyhow::Result<ArtifactRef> {
            Ok(ArtifactRef(format!("mem/{name}")))
        }
    }

    #[test]
    fn test_default_artifact_name() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 5).unwrap();
        assert_eq!(
            default_artifact_name(ArtifactFormat::Workbook, now),
            "counterparty-report-20250601093005.xlsx"
        );

        let artifact = Artifact::new(b"Tax ID;Contract number\n".to_vec(), Some("../../etc/report.csv".to_string()));
        assert_eq!(artifact.file_name(now), "report.csv");

        let unnamed = Artifact::new(b"Tax ID,Contract number\n".to_vec(), None);
        assert_eq!(unnamed.file_name(now), "counterparty-report-20250601093005.csv");
    }

    #[test]
    fn test_append_and_list_entries() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let artifact = Artifact::new(b"abc".to_vec(), Some("a.csv".to_string()));
        let actor = Actor::new("alice");
        let ctx = RunContext::new(&artifact, &actor, &NullStore);

        append(&conn, &ctx.entry(RunOutcome::Succeeded, 12, None, Some("mem/a.csv".to_string()))).unwrap();

        let entries = list_entries(&conn, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rows_processed, 12);
        assert_eq!(entries[0].outcome, RunOutcome::Succeeded);
        assert_eq!(entries[0].uploaded_by, "alice");
        assert_eq!(
            entries[0].content_hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_guarded_records_failure_and_returns_original_error() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let artifact = Artifact::new(Vec::new(), None);
        let actor = Actor::new("bob");
        let ctx = RunContext::new(&artifact, &actor, &NullStore);

        let result: Result<(), IngestError> =
            guarded(&mut conn, &ctx, |_| Err(ParseError::EmptyTable.into()));

        assert!(matches!(result, Err(IngestError::Parse(ParseError::EmptyTable))));
        let entries = list_entries(&conn, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, RunOutcome::Failed);
        assert_eq!(entries[0].rows_processed, 0);
        assert!(entries[0].artifact_ref.is_some());
        assert!(entries[0].error.as_deref().unwrap_or("").contains("empty"));
    }

    #[test]
    fn test_fs_store_keeps_both_uploads_with_same_name() {
        let root = std::env::temp_dir().join(format!("ledger-store-{}", uuid::Uuid::new_v4()));
        let store = FsArtifactStore::new(&root);
        let actor = Actor::new("carol");

        let first = store.retain(b"one", "report.xlsx", &actor).unwrap();
        let second = store.retain(b"two", "report.xlsx", &actor).unwrap();

        assert!(first.0.starts_with("uploads/"));
        assert!(first.0.ends_with("/report.xlsx"));
        assert_ne!(first, second);
        assert_eq!(fs::read(root.join(&second.0)).unwrap(), b"two");

        fs::remove_dir_all(&root).ok();
    }

    #[derive(Default)]
    struct CountingStore {
        calls: std::cell::Cell<usize>,
    }

    impl ArtifactStore for CountingStore {
        fn retain(&self, _content: &[u8], name: &str, _actor: &Actor) -> anyhow::Result<ArtifactRef> {
            self.calls.set(self.calls.get() + 1);
            Ok(ArtifactRef(format!("mem/{}/{name}", self.calls.get())))
        }
    }

    #[test]
    fn test_failure_after_retention_reuses_stored_artifact() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let artifact = Artifact::new(b"abc".to_vec(), Some("late.csv".to_string()));
        let actor = Actor::new("dave");
        let store = CountingStore::default();
        let ctx = RunContext::new(&artifact, &actor, &store);

        let result: Result<(), IngestError> = guarded(&mut conn, &ctx, |_| {
            assert_eq!(ctx.retain_artifact().as_deref(), Some("mem/1/late.csv"));
            Err(IngestError::DeadlineExceeded { stage: "ledger" })
        });

        assert!(result.is_err());
        assert_eq!(store.calls.get(), 1);
        let entries = list_entries(&conn, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, RunOutcome::Failed);
        assert_eq!(entries[0].artifact_ref.as_deref(), Some("mem/1/late.csv"));
    }
}
