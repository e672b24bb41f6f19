//! Storage layer: one `redb::Database`, a numbered migration registry, and
//! the composite-key table definitions every other module reads and writes
//! through.
//!
//! Follows the teacher's `TemporalGraph::open`/`init` shape: tables are
//! created (or, here, migrated) inside a single write transaction before the
//! `Store` is handed back to the caller. Unlike the teacher, table creation
//! is expressed as a registry of idempotent migrations rather than one
//! hand-rolled `init`, so future schema changes are additive and ordered —
//! see §0 of the expanded spec for why redb plays the role SQLite does in
//! the distilled design.

use std::path::Path;
use std::time::{Duration, Instant};

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Central table registry. All composite keys follow the teacher's
/// `"{a}:{b}:{c}"` convention so that "all rows for X" is a prefix range
/// scan, never a full-table linear scan.
pub mod tables {
    use super::TableDefinition;

    /// `"version" -> schema version currently applied`.
    pub const SCHEMA_INFO: TableDefinition<&str, u64> = TableDefinition::new("schema_info");

    /// `content_item_id -> json(ContentItem)`.
    pub const CONTENT_ITEMS: TableDefinition<&str, &str> = TableDefinition::new("content_items");
    /// `"{content_hash}:{session_id}" -> content_item_id`, enforcing the
    /// one-row-per-hash-per-session uniqueness rule.
    pub const CONTENT_ITEMS_BY_HASH_SESSION: TableDefinition<&str, &str> =
        TableDefinition::new("content_items_by_hash_session");
    /// `"{session_id}:{transcript_path}" -> byte offset`.
    pub const DELTA_CURSORS: TableDefinition<&str, u64> = TableDefinition::new("delta_cursors");

    /// `entity_id -> json(Entity)`.
    pub const ENTITIES: TableDefinition<&str, &str> = TableDefinition::new("entities");
    /// `slug -> entity_id`, the unique key entity resolution upserts against.
    pub const ENTITIES_BY_SLUG: TableDefinition<&str, &str> =
        TableDefinition::new("entities_by_slug");
    /// `"{entity_id}:{alias_id}" -> json(EntityAlias)`.
    pub const ENTITY_ALIASES: TableDefinition<&str, &str> = TableDefinition::new("entity_aliases");

    /// `fact_id -> json(Fact)`.
    pub const FACTS: TableDefinition<&str, &str> = TableDefinition::new("facts");
    /// `"{subject_id}:{predicate}:{fact_id}" -> fact_id`, the slot index the
    /// resolver scans to find candidate facts for a subject/predicate pair.
    pub const FACTS_BY_SLOT: TableDefinition<&str, &str> = TableDefinition::new("facts_by_slot");

    /// `fact_id -> raw little-endian f32 embedding bytes`.
    pub const EMBEDDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("embeddings");
    /// `"dim" -> dimension`, set by the first embedding ever inserted and
    /// checked against every insert and query after that.
    pub const EMBEDDING_META: TableDefinition<&str, u64> = TableDefinition::new("embedding_meta");

    /// `provenance_id -> json(ProvenanceReceipt)`.
    pub const PROVENANCE: TableDefinition<&str, &str> = TableDefinition::new("provenance");
    /// `"{fact_id}:{provenance_id}" -> provenance_id`.
    pub const PROVENANCE_BY_FACT: TableDefinition<&str, &str> =
        TableDefinition::new("provenance_by_fact");
    /// `"{content_item_id}:{provenance_id}" -> provenance_id`.
    pub const PROVENANCE_BY_CONTENT: TableDefinition<&str, &str> =
        TableDefinition::new("provenance_by_content");

    /// `link_id -> json(FactLink)`.
    pub const FACT_LINKS: TableDefinition<&str, &str> = TableDefinition::new("fact_links");
    /// `"{from_fact_id}:{link_id}" -> link_id`, i.e. "what does this fact supersede".
    pub const FACT_LINKS_BY_FROM: TableDefinition<&str, &str> =
        TableDefinition::new("fact_links_by_from");
    /// `"{to_fact_id}:{link_id}" -> link_id`, i.e. "what superseded this fact".
    pub const FACT_LINKS_BY_TO: TableDefinition<&str, &str> =
        TableDefinition::new("fact_links_by_to");

    /// `conflict_id -> json(Conflict)`.
    pub const CONFLICTS: TableDefinition<&str, &str> = TableDefinition::new("conflicts");
    /// `"{fact_id}:{conflict_id}" -> conflict_id`.
    pub const CONFLICTS_BY_FACT: TableDefinition<&str, &str> =
        TableDefinition::new("conflicts_by_fact");

    /// `operation_id -> json(OperationProgress)`.
    pub const OPERATION_PROGRESS: TableDefinition<&str, &str> =
        TableDefinition::new("operation_progress");
    /// `metric_id -> json(IngestionMetric)`. Keyed by ULID so a prefix/range
    /// scan over the whole table returns insertion order, giving the
    /// append-only log its ordering for free.
    pub const INGESTION_METRICS: TableDefinition<&str, &str> =
        TableDefinition::new("ingestion_metrics");
}

/// One schema migration. `up` must be safe to run against a database that
/// already has it applied — migrations only ever create tables or seed rows
/// that a `get_or_insert`-shaped write would also tolerate.
pub struct Migration {
    pub version: u64,
    pub description: &'static str,
    pub up: fn(&WriteTransaction) -> Result<()>,
}

/// Registry, applied strictly in ascending `version` order. Append, never
/// edit or reorder, an existing entry.
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "create base tables",
    up: migration_001_base_tables,
}];

fn migration_001_base_tables(txn: &WriteTransaction) -> Result<()> {
    use tables::*;
    txn.open_table(CONTENT_ITEMS)?;
    txn.open_table(CONTENT_ITEMS_BY_HASH_SESSION)?;
    txn.open_table(DELTA_CURSORS)?;
    txn.open_table(ENTITIES)?;
    txn.open_table(ENTITIES_BY_SLUG)?;
    txn.open_table(ENTITY_ALIASES)?;
    txn.open_table(FACTS)?;
    txn.open_table(FACTS_BY_SLOT)?;
    txn.open_table(EMBEDDINGS)?;
    txn.open_table(EMBEDDING_META)?;
    txn.open_table(PROVENANCE)?;
    txn.open_table(PROVENANCE_BY_FACT)?;
    txn.open_table(PROVENANCE_BY_CONTENT)?;
    txn.open_table(FACT_LINKS)?;
    txn.open_table(FACT_LINKS_BY_FROM)?;
    txn.open_table(FACT_LINKS_BY_TO)?;
    txn.open_table(CONFLICTS)?;
    txn.open_table(CONFLICTS_BY_FACT)?;
    txn.open_table(OPERATION_PROGRESS)?;
    txn.open_table(INGESTION_METRICS)?;
    Ok(())
}

/// Owns the on-disk (or in-memory) database for one scope (global or
/// project). Every component that needs to read or write takes a `&Store`
/// and opens its own transaction — there is no shared, implicit transaction
/// threaded through the call stack.
pub struct Store {
    db: Database,
    busy_timeout: Duration,
}

impl Store {
    /// Opens (creating if absent) the database at `path`, applying any
    /// pending migrations before returning.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        let store = Self { db, busy_timeout };
        store.apply_migrations()?;
        debug!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    /// In-memory database for tests; never persisted, never shared across
    /// processes, so busy-retry is a formality here (kept for API symmetry).
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        let store = Self {
            db,
            busy_timeout: Duration::from_secs(5),
        };
        store.apply_migrations()?;
        Ok(store)
    }

    fn schema_version(&self, txn: &WriteTransaction) -> Result<u64> {
        let table = txn.open_table(tables::SCHEMA_INFO)?;
        Ok(table.get("version")?.map(|v| v.value()).unwrap_or(0))
    }

    fn apply_migrations(&self) -> Result<()> {
        let target = MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0);
        let txn = self.db.begin_write()?;
        let current = self.schema_version(&txn)?;

        if current > target {
            return Err(Error::SchemaMismatch(format!(
                "on-disk schema version {current} is newer than this build's target {target}"
            )));
        }

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            debug!(version = migration.version, desc = migration.description, "applying migration");
            (migration.up)(&txn)?;
        }

        {
            let mut table = txn.open_table(tables::SCHEMA_INFO)?;
            table.insert("version", target)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Opens a write transaction, retrying with backoff if the attempt fails
    /// (another writer holds the lock) until `busy_timeout` elapses.
    ///
    /// redb serializes writers within a process already; this loop exists
    /// for the cross-process case (two short-lived hook invocations racing
    /// to write the same project store) and for surfacing a typed error
    /// instead of an indefinite hang.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(10);
        loop {
            match self.db.begin_write() {
                Ok(txn) => return Ok(txn),
                Err(e) => {
                    let waited = start.elapsed();
                    if waited >= self.busy_timeout {
                        return Err(Error::StorageBusy {
                            waited,
                            last_error: e.to_string(),
                        });
                    }
                    warn!(error = %e, waited = ?waited, "write transaction busy, retrying");
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(250));
                }
            }
        }
    }

    pub fn begin_read(&self) -> Result<redb::ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Truncating checkpoint. Compaction needs exclusive access to the file;
    /// if other handles are open this is a best-effort no-op, never a hard
    /// failure — called from the Sweeper's final phase, which should never
    /// fail a sweep just because compaction couldn't run this time.
    pub fn compact(&mut self) -> Result<bool> {
        match self.db.compact() {
            Ok(done) => Ok(done),
            Err(e) => {
                debug!(error = %e, "compaction skipped");
                Ok(false)
            }
        }
    }
}

/// Exclusive end bound for a prefix scan over a composite string key:
/// `prefix_range("a:b")` returns `("a:b", "a:b\u{10FFFF}")`, wide enough to
/// cover any string subkeys appended after the prefix (ids are plain ASCII
/// ULIDs so this never collides with real data).
pub fn prefix_range(prefix: &str) -> (String, String) {
    let mut end = prefix.to_string();
    end.push('\u{10FFFF}');
    (prefix.to_string(), end)
}
