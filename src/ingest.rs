// 🚚 Ingestion - one spreadsheet upload reconciled into the store
//
// Stages run in a fixed order inside one IMMEDIATE transaction:
// parse → normalize → lookups → counterparties → contracts → debt/credit
// → ledger. Per-row failures are collected; anything else rolls the run
// back and leaves a single `failed` ledger row.

use crate::config::IngestConfig;
use crate::db::{insert_event, Event};
use crate::deduplication::{contract_rows, counterparty_rows, first_seen};
use crate::entities::category::{resolve_lookups, LookupKind};
use crate::entities::contract::{self, ContractCandidate};
use crate::entities::counterparty::{self, CounterpartyCandidate, CounterpartyKey};
use crate::entities::debt_credit::{self, DebtCreditCandidate};
use crate::error::{EntityLevel, IngestError, Result, RowFailure};
use crate::ledger::{self, Actor, Artifact, ArtifactStore, RunContext, RunOutcome};
use crate::normalize::{normalize_row, NormalizedRow};
use crate::parser::parse_artifact;
use crate::planner::{Reconcile, UpsertPlan};
use crate::writer::{apply_updates, insert_batch};
use chrono::NaiveDate;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Counts for one entity level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub discarded_duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub ledger_id: String,
    pub rows_processed: usize,
    pub reporting_date: Option<NaiveDate>,
    pub failed_rows: Vec<RowFailure>,
    pub counterparties: LevelSummary,
    pub contracts: LevelSummary,
    pub debt_credits: LevelSummary,
    /// Field values actually rewritten across all levels
    pub changed_fields: usize,
    pub artifact_ref: Option<String>,
}

/// Optional wall-clock budget, checked between stages
struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn new(limit_secs: Option<u64>) -> Self {
        Deadline {
            started: Instant::now(),
            limit: limit_secs.map(Duration::from_secs),
        }
    }

    fn check(&self, stage: &'static str) -> Result<()> {
        match self.limit {
            Some(limit) if self.started.elapsed() > limit => {
                Err(IngestError::DeadlineExceeded { stage })
            }
            _ => Ok(()),
        }
    }
}

/// Ingest one uploaded artifact.
///
/// Exactly one ledger row is written per call. On success it carries the
/// number of data rows read; on any batch-fatal error no business data is
/// persisted and the ledger row is `failed` with zero rows.
pub fn ingest(
    conn: &mut Connection,
    artifact: &Artifact,
    actor: &Actor,
    store: &dyn ArtifactStore,
    config: &IngestConfig,
) -> Result<RunResult> {
    let ctx = RunContext::new(artifact, actor, store);
    info!(ledger_id = %ctx.ledger_id, file = %ctx.file_name, actor = %actor.id, "ingestion started");

    let result = ledger::guarded(conn, &ctx, |conn| run(conn, &ctx, config))?;

    info!(
        ledger_id = %result.ledger_id,
        rows = result.rows_processed,
        failed = result.failed_rows.len(),
        "ingestion finished"
    );
    Ok(result)
}

fn level_summary<C: Reconcile>(plan: &UpsertPlan<'_, C>, failed: usize, discarded: usize) -> LevelSummary {
    LevelSummary {
        created: plan.creates.len(),
        updated: plan.update_count(),
        unchanged: plan.unchanged.len(),
        failed,
        discarded_duplicates: discarded,
    }
}

/// Reduce a plan's counts by what the writer actually rejected
fn settle(summary: &mut LevelSummary, insert_failures: usize, update_failures: usize) {
    summary.created -= insert_failures;
    summary.updated -= update_failures;
    summary.failed += insert_failures + update_failures;
}

fn run(conn: &mut Connection, ctx: &RunContext<'_>, config: &IngestConfig) -> Result<RunResult> {
    let deadline = Deadline::new(config.run_timeout_secs);
    let batch = config.effective_batch_size();
    let actor = ctx.actor.id.as_str();

    // ========================================================================
    // PARSE + NORMALIZE
    // ========================================================================
    let sheet = parse_artifact(&ctx.artifact.content, config)?;
    let reporting_date = sheet.layout.reporting_date;
    if reporting_date.is_none() {
        warn!(label = ?sheet.layout.receivables_label, "no reporting date in receivables header");
    }

    let rows: Vec<NormalizedRow> = sheet.rows.iter().map(normalize_row).collect();
    let rows_processed = rows.len();
    info!(rows = rows_processed, ?reporting_date, format = ?sheet.format, "artifact parsed");
    deadline.check("parse")?;

    let mut failed_rows = Vec::new();
    let eligible: Vec<&NormalizedRow> = if config.reject_empty_tax_id {
        rows.iter()
            .filter(|row| {
                if row.tax_id.is_empty() {
                    let failure = RowFailure::new(
                        EntityLevel::Counterparty,
                        format!("line {}", row.line),
                        "tax_id",
                        "empty tax identifier",
                    );
                    warn!(line = row.line, "{failure}");
                    failed_rows.push(failure);
                    false
                } else {
                    true
                }
            })
            .collect()
    } else {
        rows.iter().collect()
    };
    let empty_tax_ids = failed_rows.len();

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // ========================================================================
    // LOOKUPS
    // ========================================================================
    // Names come from the surviving counterparty rows only, so a discarded
    // duplicate never creates a category nothing references.
    let unique_counterparties = counterparty_rows(eligible.iter().copied());
    let categories = resolve_lookups(
        &tx,
        LookupKind::Category,
        unique_counterparties.kept.iter().filter_map(|row| row.category.as_deref()),
        batch,
    )?;
    let plan_categories = resolve_lookups(
        &tx,
        LookupKind::BusinessPlanCategory,
        unique_counterparties
            .kept
            .iter()
            .filter_map(|row| row.business_plan_category.as_deref()),
        batch,
    )?;
    deadline.check("lookups")?;

    // ========================================================================
    // COUNTERPARTIES
    // ========================================================================
    let cp_candidates: Vec<CounterpartyCandidate> = unique_counterparties
        .kept
        .iter()
        .map(|row| CounterpartyCandidate {
            line: row.line,
            tax_id: row.tax_id.clone(),
            name: row.name.clone(),
            address: row.address.clone(),
            district: row.district.clone(),
            category_id: row.category.as_ref().and_then(|n| categories.get(n)).map(|e| e.id),
            business_plan_category_id: row
                .business_plan_category
                .as_ref()
                .and_then(|n| plan_categories.get(n))
                .map(|e| e.id),
        })
        .collect();

    let tax_ids: Vec<&str> = cp_candidates
        .iter()
        .map(|c| c.tax_id.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let existing = counterparty::load_by_tax_ids(&tx, &tax_ids, batch)?;
    let cp_plan = UpsertPlan::build(&cp_candidates, existing);
    let mut counterparties = level_summary(&cp_plan, empty_tax_ids, unique_counterparties.discarded);

    let mut counterparty_ids: HashMap<CounterpartyKey, String> = cp_plan.existing_ids();
    let inserted = insert_batch(&tx, &cp_plan.creates, batch)?;
    let updated = apply_updates(&tx, &cp_plan.updates, batch, actor)?;
    counterparty_ids.extend(inserted.created);
    settle(&mut counterparties, inserted.failures.len(), updated.failures.len());
    let mut changed_fields = updated.changed_fields;
    failed_rows.extend(inserted.failures);
    failed_rows.extend(updated.failures);
    info!(
        created = counterparties.created,
        updated = counterparties.updated,
        unchanged = counterparties.unchanged,
        failed = counterparties.failed,
        "counterparties reconciled"
    );
    deadline.check("counterparties")?;

    // ========================================================================
    // CONTRACTS
    // ========================================================================
    let unique_contracts = contract_rows(eligible.iter().copied());
    let contract_candidates: Vec<ContractCandidate> = unique_contracts
        .kept
        .iter()
        .filter_map(|row| {
            let owner = counterparty_ids.get(&CounterpartyKey::new(&row.tax_id, &row.address))?;
            Some(ContractCandidate {
                line: row.line,
                contract_number: row.contract_number.clone(),
                contract_date: row.contract_date,
                termination_date: row.termination_date,
                counterparty_id: owner.clone(),
            })
        })
        .collect();

    let numbers: Vec<&str> = contract_candidates.iter().map(|c| c.contract_number.as_str()).collect();
    let existing = contract::load_by_numbers(&tx, &numbers, batch)?;
    let contract_plan = UpsertPlan::build(&contract_candidates, existing);
    let mut contracts = level_summary(&contract_plan, 0, unique_contracts.discarded);

    let mut contract_ids: HashMap<String, String> = contract_plan.existing_ids();
    let inserted = insert_batch(&tx, &contract_plan.creates, batch)?;
    let updated = apply_updates(&tx, &contract_plan.updates, batch, actor)?;
    contract_ids.extend(inserted.created);
    settle(&mut contracts, inserted.failures.len(), updated.failures.len());
    changed_fields += updated.changed_fields;
    failed_rows.extend(inserted.failures);
    failed_rows.extend(updated.failures);
    info!(
        created = contracts.created,
        updated = contracts.updated,
        unchanged = contracts.unchanged,
        failed = contracts.failed,
        "contracts reconciled"
    );
    deadline.check("contracts")?;

    // ========================================================================
    // DEBT / CREDIT SNAPSHOTS
    // ========================================================================
    let snapshot_rows: Vec<DebtCreditCandidate> = eligible
        .iter()
        .filter(|row| !row.contract_number.is_empty())
        .filter_map(|row| {
            let contract_id = contract_ids.get(&row.contract_number)?;
            Some(DebtCreditCandidate {
                line: row.line,
                contract_id: contract_id.clone(),
                contract_number: row.contract_number.clone(),
                reporting_date,
                balances: row.balances.clone(),
                debt_origin_date: row.debt_origin_date,
            })
        })
        .collect();
    let unique_snapshots = first_seen(&snapshot_rows, |c| c.key());

    let contract_keys: Vec<&str> = unique_snapshots.kept.iter().map(|c| c.contract_id.as_str()).collect();
    let existing = debt_credit::load_for_contracts(&tx, &contract_keys, reporting_date, batch)?;
    let debt_plan = UpsertPlan::build(unique_snapshots.kept.iter().copied(), existing);
    let mut debt_credits = level_summary(&debt_plan, 0, unique_snapshots.discarded);

    let inserted = insert_batch(&tx, &debt_plan.creates, batch)?;
    let updated = apply_updates(&tx, &debt_plan.updates, batch, actor)?;
    settle(&mut debt_credits, inserted.failures.len(), updated.failures.len());
    changed_fields += updated.changed_fields;
    failed_rows.extend(inserted.failures);
    failed_rows.extend(updated.failures);
    info!(
        created = debt_credits.created,
        updated = debt_credits.updated,
        unchanged = debt_credits.unchanged,
        failed = debt_credits.failed,
        "debt/credit snapshots reconciled"
    );
    deadline.check("debt_credits")?;

    // ========================================================================
    // LEDGER
    // ========================================================================
    let artifact_ref = ctx.retain_artifact();
    let entry = ctx.entry(RunOutcome::Succeeded, rows_processed as u64, None, artifact_ref.clone());
    ledger::append(&tx, &entry)?;

    let result = RunResult {
        ledger_id: ctx.ledger_id.clone(),
        rows_processed,
        reporting_date,
        failed_rows,
        counterparties,
        contracts,
        debt_credits,
        changed_fields,
        artifact_ref,
    };
    insert_event(
        &tx,
        &Event::new(
            "ingestion_completed",
            "upload_log",
            &ctx.ledger_id,
            json!({
                "rows_processed": result.rows_processed,
                "failed_rows": result.failed_rows.len(),
                "counterparties": result.counterparties,
                "contracts": result.contracts,
                "debt_credits": result.debt_credits,
                "changed_fields": result.changed_fields,
            }),
            actor,
        ),
    )?;

    deadline.check("ledger")?;
    tx.commit()?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_without_limit_never_fires() {
        let deadline = Deadline::new(None);
        assert!(deadline.check("parse").is_ok());
    }

    #[test]
    fn test_deadline_of_zero_fires_after_work() {
        let deadline = Deadline::new(Some(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            deadline.check("contracts"),
            Err(IngestError::DeadlineExceeded { stage: "contracts" })
        ));
    }

    #[test]
    fn test_settle_moves_rejections_to_failed() {
        let mut summary = LevelSummary {
            created: 5,
            updated: 2,
            unchanged: 1,
            failed: 1,
            discarded_duplicates: 0,
        };
        settle(&mut summary, 2, 1);
        assert_eq!(summary.created, 3);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.failed, 4);
    }
}
