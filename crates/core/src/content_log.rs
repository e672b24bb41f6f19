//! Raw transcript ingestion log: one row per transcript message the
//! distiller has seen, plus the delta cursor each session resumes reading
//! from. Nothing here interprets content — that is the distiller's job,
//! upstream of this crate.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::ContentItemId;
use crate::persistence::{prefix_range, tables, Store};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentItem {
    pub id: ContentItemId,
    pub source: String,
    pub session_id: String,
    pub transcript_path: String,
    pub project_path: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub content_hash: String,
    pub byte_len: u64,
    pub raw_text: String,
    pub metadata: serde_json::Value,
    pub git_branch: Option<String>,
    pub working_dir: Option<String>,
    pub tool_version: Option<String>,
    pub thinking_level: Option<String>,
    pub source_modified_at: Option<DateTime<Utc>>,
    /// Set once every extraction derived from this item has either produced
    /// a fact or been dropped; used by `prune_expired_content` to decide
    /// whether a content row past its TTL still has unprocessed work.
    pub processed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaCursor {
    pub session_id: String,
    pub transcript_path: String,
    pub byte_offset: u64,
}

fn hash_session_key(content_hash: &str, session_id: &str) -> String {
    format!("{content_hash}:{session_id}")
}

fn cursor_key(session_id: &str, transcript_path: &str) -> String {
    format!("{session_id}:{transcript_path}")
}

/// Inserts `item`, unless a row already exists for its `(content_hash,
/// session_id)` pair — replays of the same transcript region must not
/// duplicate content rows. Returns the id actually on record (the new one,
/// or the pre-existing one on a duplicate).
pub fn upsert_content_item(store: &Store, item: ContentItem) -> Result<ContentItemId> {
    let txn = store.begin_write()?;
    let existing = {
        let idx = txn.open_table(tables::CONTENT_ITEMS_BY_HASH_SESSION)?;
        idx.get(hash_session_key(&item.content_hash, &item.session_id).as_str())?
            .map(|v| ContentItemId::from(v.value()))
    };
    let id = if let Some(existing_id) = existing {
        existing_id
    } else {
        let key = hash_session_key(&item.content_hash, &item.session_id);
        {
            let mut idx = txn.open_table(tables::CONTENT_ITEMS_BY_HASH_SESSION)?;
            idx.insert(key.as_str(), item.id.0.as_str())?;
        }
        {
            let mut items = txn.open_table(tables::CONTENT_ITEMS)?;
            let json = serde_json::to_string(&item)?;
            items.insert(item.id.0.as_str(), json.as_str())?;
        }
        item.id.clone()
    };
    txn.commit()?;
    Ok(id)
}

/// Every content item id in the store, for callers (the recall engine's
/// lexical search step) that need the whole corpus to search over.
pub fn all_content_item_ids(store: &Store) -> Result<Vec<ContentItemId>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::CONTENT_ITEMS)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (k, _) = entry?;
        out.push(ContentItemId::from(k.value()));
    }
    Ok(out)
}

pub fn content_item_by_id(store: &Store, id: &ContentItemId) -> Result<Option<ContentItem>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::CONTENT_ITEMS)?;
    match table.get(id.0.as_str())? {
        Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
        None => Ok(None),
    }
}

/// Null object: an unknown `(session_id, transcript_path)` pair reads as
/// offset zero, meaning "start from the beginning," never an error.
pub fn get_delta_cursor(store: &Store, session_id: &str, transcript_path: &str) -> Result<u64> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::DELTA_CURSORS)?;
    Ok(table
        .get(cursor_key(session_id, transcript_path).as_str())?
        .map(|v| v.value())
        .unwrap_or(0))
}

/// Cursor updates only ever move forward; a caller racing an older offset
/// against a newer one (e.g. two concurrent hook invocations) never loses
/// progress already recorded.
pub fn update_delta_cursor(
    store: &Store,
    session_id: &str,
    transcript_path: &str,
    byte_offset: u64,
) -> Result<()> {
    let txn = store.begin_write()?;
    let key = cursor_key(session_id, transcript_path);
    {
        let mut table = txn.open_table(tables::DELTA_CURSORS)?;
        let current = table.get(key.as_str())?.map(|v| v.value()).unwrap_or(0);
        if byte_offset < current {
            return Err(Error::ConstraintViolation(format!(
                "delta cursor for {key} would move backward: {current} -> {byte_offset}"
            )));
        }
        table.insert(key.as_str(), byte_offset)?;
    }
    txn.commit()?;
    Ok(())
}

/// Deletes content items older than `cutoff` that have no remaining
/// provenance pointing at them and are marked `processed`. Budget-bounded:
/// stops after `max_rows` deletions so a huge backlog never turns one sweep
/// phase into an unbounded pause.
pub fn prune_expired_content(
    store: &Store,
    cutoff: DateTime<Utc>,
    max_rows: usize,
) -> Result<usize> {
    let txn = store.begin_write()?;
    let mut deleted = 0usize;
    let stale_ids: Vec<String> = {
        let items = txn.open_table(tables::CONTENT_ITEMS)?;
        let (start, end) = prefix_range("");
        items
            .range(start.as_str()..end.as_str())?
            .filter_map(|entry| entry.ok())
            .filter_map(|(k, v)| {
                let item: ContentItem = serde_json::from_str(v.value()).ok()?;
                if item.processed && item.ingested_at < cutoff {
                    Some(k.value().to_string())
                } else {
                    None
                }
            })
            .take(max_rows)
            .collect()
    };

    {
        let mut items = txn.open_table(tables::CONTENT_ITEMS)?;
        let mut by_hash = txn.open_table(tables::CONTENT_ITEMS_BY_HASH_SESSION)?;
        for id in &stale_ids {
            let prov = txn.open_table(tables::PROVENANCE_BY_CONTENT)?;
            let (start, end) = prefix_range(id);
            let still_referenced = prov.range(start.as_str()..end.as_str())?.next().is_some();
            if still_referenced {
                continue;
            }
            if let Some(v) = items.remove(id.as_str())? {
                if let Ok(item) = serde_json::from_str::<ContentItem>(v.value()) {
                    by_hash.remove(hash_session_key(&item.content_hash, &item.session_id).as_str())?;
                }
                deleted += 1;
            }
        }
    }
    txn.commit()?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(hash: &str, session: &str) -> ContentItem {
        ContentItem {
            id: ContentItemId::new(),
            source: "transcript".to_string(),
            session_id: session.to_string(),
            transcript_path: "/tmp/t.jsonl".to_string(),
            project_path: None,
            occurred_at: Utc::now(),
            ingested_at: Utc::now(),
            content_hash: hash.to_string(),
            byte_len: 5,
            raw_text: "hello".to_string(),
            metadata: serde_json::json!({}),
            git_branch: None,
            working_dir: None,
            tool_version: None,
            thinking_level: None,
            source_modified_at: None,
            processed: false,
        }
    }

    #[test]
    fn upsert_is_idempotent_per_hash_and_session() {
        let store = Store::open_in_memory().unwrap();
        let item = sample("h1", "s1");
        let first = upsert_content_item(&store, item.clone()).unwrap();
        let mut replay = sample("h1", "s1");
        replay.id = ContentItemId::new();
        let second = upsert_content_item(&store, replay).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn same_hash_different_session_is_a_distinct_row() {
        let store = Store::open_in_memory().unwrap();
        let first = upsert_content_item(&store, sample("h1", "s1")).unwrap();
        let second = upsert_content_item(&store, sample("h1", "s2")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn delta_cursor_defaults_to_zero_and_advances() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(get_delta_cursor(&store, "s1", "/tmp/t.jsonl").unwrap(), 0);
        update_delta_cursor(&store, "s1", "/tmp/t.jsonl", 128).unwrap();
        assert_eq!(get_delta_cursor(&store, "s1", "/tmp/t.jsonl").unwrap(), 128);
    }

    #[test]
    fn delta_cursor_rejects_moving_backward() {
        let store = Store::open_in_memory().unwrap();
        update_delta_cursor(&store, "s1", "/tmp/t.jsonl", 128).unwrap();
        let err = update_delta_cursor(&store, "s1", "/tmp/t.jsonl", 64).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn prune_skips_unprocessed_and_referenced_rows() {
        let store = Store::open_in_memory().unwrap();
        let mut item = sample("h1", "s1");
        item.processed = true;
        item.ingested_at = Utc::now() - chrono::Duration::days(200);
        upsert_content_item(&store, item).unwrap();
        let deleted = prune_expired_content(&store, Utc::now(), 10).unwrap();
        assert_eq!(deleted, 1);
    }
}
