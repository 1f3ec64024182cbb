// Counterparty Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod columns;       // Column Resolver - date-bearing report columns
pub mod config;
pub mod db;
pub mod deduplication; // first-seen-wins per natural key
pub mod entities;      // counterparties, contracts, debt/credit, lookups
pub mod error;
pub mod ingest;        // engine entry point
pub mod ledger;        // Run Ledger + artifact retention
pub mod normalize;
pub mod parser;        // workbook / CSV decoding
pub mod planner;       // Diff/Upsert Planner
pub mod writer;        // Batch Writer

// Re-export commonly used types
pub use config::{load_config, load_optional_config, AppConfig, IngestConfig};
pub use db::{get_events_for_entity, insert_event, open_database, setup_database, Event};
pub use error::{EntityLevel, IngestError, ParseError, RowFailure};
pub use ingest::{ingest, LevelSummary, RunResult};
pub use ledger::{
    list_entries, Actor, Artifact, ArtifactRef, ArtifactStore, FsArtifactStore, LedgerEntry, RunOutcome,
};
