//! The sweeper: periodic maintenance that expires aged facts, reaps
//! orphaned provenance, prunes stale content, and checkpoints the WAL.
//!
//! Each phase is its own write transaction, so a crash mid-sweep leaves the
//! store in a state some earlier phase already committed, never a half
//! finished one. A time budget bounds the whole run; if it's exceeded
//! between phases the sweep stops early and reports which phases it
//! actually reached rather than erroring.

use std::time::{Duration, Instant};

use chrono::Utc;
use redb::ReadableTable;
use tracing::{info, instrument};

use crate::config::Config;
use crate::content_log::prune_expired_content;
use crate::error::Result;
use crate::facts::{update_fact_in_txn, FactStatus, FactUpdate};
use crate::persistence::{tables, Store};
use crate::provenance::reap_orphaned;

/// Per-phase row budget. A single sweep phase never attempts to touch more
/// than this many rows, so one huge backlog can't turn a sweep into an
/// unbounded pause; the next sweep picks up where this one left off.
const PHASE_ROW_BUDGET: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepStats {
    pub proposed_facts_expired: usize,
    pub disputed_facts_expired: usize,
    pub orphaned_provenance_deleted: usize,
    pub old_content_pruned: usize,
    pub elapsed_seconds: f64,
    /// `false` if the sweep stopped early because `budget_seconds` elapsed
    /// before every phase ran.
    pub budget_honored: bool,
}

/// Runs all five maintenance phases in order, stopping early (but never
/// erroring) if `budget_seconds` elapses between phases.
#[instrument(skip(store, config))]
pub fn run_sweep(store: &mut Store, config: &Config, budget_seconds: u64) -> Result<SweepStats> {
    let start = Instant::now();
    let budget = Duration::from_secs(budget_seconds);
    let mut stats = SweepStats { budget_honored: true, ..Default::default() };

    let now = Utc::now();

    stats.proposed_facts_expired = expire_aged_facts(
        store,
        FactStatus::Proposed,
        config.proposed_ttl,
        now,
        PHASE_ROW_BUDGET,
    )?;
    if start.elapsed() >= budget {
        return finish(stats, start, false);
    }

    stats.disputed_facts_expired = expire_aged_facts(
        store,
        FactStatus::Disputed,
        config.disputed_ttl,
        now,
        PHASE_ROW_BUDGET,
    )?;
    if start.elapsed() >= budget {
        return finish(stats, start, false);
    }

    stats.orphaned_provenance_deleted = reap_orphaned(store, PHASE_ROW_BUDGET)?;
    if start.elapsed() >= budget {
        return finish(stats, start, false);
    }

    let content_cutoff = now - chrono::Duration::from_std(config.content_ttl).unwrap_or(chrono::Duration::zero());
    stats.old_content_pruned = prune_expired_content(store, content_cutoff, PHASE_ROW_BUDGET)?;
    if start.elapsed() >= budget {
        return finish(stats, start, false);
    }

    store.compact()?;

    finish(stats, start, true)
}

fn finish(mut stats: SweepStats, start: Instant, budget_honored: bool) -> Result<SweepStats> {
    stats.elapsed_seconds = start.elapsed().as_secs_f64();
    stats.budget_honored = budget_honored;
    info!(
        proposed_facts_expired = stats.proposed_facts_expired,
        disputed_facts_expired = stats.disputed_facts_expired,
        orphaned_provenance_deleted = stats.orphaned_provenance_deleted,
        old_content_pruned = stats.old_content_pruned,
        elapsed_seconds = stats.elapsed_seconds,
        budget_honored = stats.budget_honored,
        "sweep finished"
    );
    Ok(stats)
}

/// Retracts every fact in `status` whose `valid_from` is older than `ttl`,
/// up to `max_rows`. A full table scan: the `facts_by_slot` index is keyed
/// by (subject, predicate), which gives no way to range over "all facts in
/// this status," so there is no narrower index to scan instead.
fn expire_aged_facts(
    store: &Store,
    status: FactStatus,
    ttl: Duration,
    now: chrono::DateTime<Utc>,
    max_rows: usize,
) -> Result<usize> {
    let cutoff = now - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

    let txn = store.begin_write()?;
    let aged_ids: Vec<String> = {
        let facts = txn.open_table(tables::FACTS)?;
        facts
            .iter()?
            .filter_map(|entry| entry.ok())
            .filter_map(|(k, v)| {
                let fact: crate::facts::Fact = serde_json::from_str(v.value()).ok()?;
                let matches_status = fact.status as u8 == status as u8;
                (matches_status && fact.valid_from < cutoff).then(|| k.value().to_string())
            })
            .take(max_rows)
            .collect()
    };

    let mut expired = 0usize;
    for id in &aged_ids {
        let updated = update_fact_in_txn(
            &txn,
            &crate::ids::FactId::from(id.as_str()),
            FactUpdate {
                status: Some(FactStatus::Retracted),
                valid_to: Some(Some(now)),
                ..Default::default()
            },
        )?;
        if updated.is_some() {
            expired += 1;
        }
    }
    txn.commit()?;
    Ok(expired)
}
