//! Provenance ledger: append-only evidence receipts tying a fact back to
//! the content (or synthetic origin) it was extracted from.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::facts::Strength;
use crate::ids::{ContentItemId, EntityId, FactId, ProvenanceId};
use crate::persistence::{prefix_range, tables, Store};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvenanceReceipt {
    pub id: ProvenanceId,
    pub fact_id: FactId,
    pub content_item_id: Option<ContentItemId>,
    pub quote: String,
    pub attribution: Option<EntityId>,
    pub strength: Strength,
    pub recorded_at: DateTime<Utc>,
}

fn by_fact_key(fact_id: &FactId, id: &ProvenanceId) -> String {
    format!("{}:{}", fact_id.0, id.0)
}

fn by_content_key(content_item_id: &ContentItemId, id: &ProvenanceId) -> String {
    format!("{}:{}", content_item_id.0, id.0)
}

pub fn insert_provenance(store: &Store, receipt: ProvenanceReceipt) -> Result<()> {
    let txn = store.begin_write()?;
    insert_provenance_in_txn(&txn, &receipt)?;
    txn.commit()?;
    Ok(())
}

pub fn insert_provenance_in_txn(
    txn: &redb::WriteTransaction,
    receipt: &ProvenanceReceipt,
) -> Result<()> {
    {
        let mut table = txn.open_table(tables::PROVENANCE)?;
        table.insert(receipt.id.0.as_str(), serde_json::to_string(receipt)?.as_str())?;
    }
    {
        let mut by_fact = txn.open_table(tables::PROVENANCE_BY_FACT)?;
        by_fact.insert(by_fact_key(&receipt.fact_id, &receipt.id).as_str(), receipt.id.0.as_str())?;
    }
    if let Some(content_item_id) = &receipt.content_item_id {
        let mut by_content = txn.open_table(tables::PROVENANCE_BY_CONTENT)?;
        by_content.insert(
            by_content_key(content_item_id, &receipt.id).as_str(),
            receipt.id.0.as_str(),
        )?;
    }
    Ok(())
}

pub fn provenance_for_fact(store: &Store, fact_id: &FactId) -> Result<Vec<ProvenanceReceipt>> {
    let txn = store.begin_read()?;
    let by_fact = txn.open_table(tables::PROVENANCE_BY_FACT)?;
    let table = txn.open_table(tables::PROVENANCE)?;
    let (start, end) = prefix_range(&format!("{}:", fact_id.0));
    let mut out = Vec::new();
    for entry in by_fact.range(start.as_str()..end.as_str())? {
        let (_, v) = entry?;
        if let Some(row) = table.get(v.value())? {
            out.push(serde_json::from_str(row.value())?);
        }
    }
    Ok(out)
}

/// Batched "for content X" lookup, reused by the resolver's signal step and
/// the recall engine's `query_index` (step (b) of its three-query
/// contract): one range scan per content item id, not one query per
/// provenance row.
pub fn provenance_for_content_items(
    store: &Store,
    content_item_ids: &[ContentItemId],
) -> Result<Vec<ProvenanceReceipt>> {
    let txn = store.begin_read()?;
    let by_content = txn.open_table(tables::PROVENANCE_BY_CONTENT)?;
    let table = txn.open_table(tables::PROVENANCE)?;
    let mut out = Vec::new();
    for content_item_id in content_item_ids {
        let (start, end) = prefix_range(&format!("{}:", content_item_id.0));
        for entry in by_content.range(start.as_str()..end.as_str())? {
            let (_, v) = entry?;
            if let Some(row) = table.get(v.value())? {
                out.push(serde_json::from_str(row.value())?);
            }
        }
    }
    Ok(out)
}

/// Deletes receipts whose fact no longer exists or is retracted. Run by the
/// Sweeper; budget-bounded by `max_rows`.
pub fn reap_orphaned(store: &Store, max_rows: usize) -> Result<usize> {
    use crate::facts::FactStatus;

    let txn = store.begin_write()?;
    let orphans: Vec<(String, FactId)> = {
        let table = txn.open_table(tables::PROVENANCE)?;
        let facts = txn.open_table(tables::FACTS)?;
        table
            .iter()?
            .filter_map(|e| e.ok())
            .filter_map(|(k, v)| {
                let receipt: ProvenanceReceipt = serde_json::from_str(v.value()).ok()?;
                let orphaned = match facts.get(receipt.fact_id.0.as_str()).ok()? {
                    None => true,
                    Some(row) => {
                        let fact: crate::facts::Fact = serde_json::from_str(row.value()).ok()?;
                        matches!(fact.status, FactStatus::Retracted)
                    }
                };
                orphaned.then(|| (k.value().to_string(), receipt.fact_id))
            })
            .take(max_rows)
            .collect()
    };

    let mut deleted = 0usize;
    {
        let mut table = txn.open_table(tables::PROVENANCE)?;
        let mut by_fact = txn.open_table(tables::PROVENANCE_BY_FACT)?;
        for (id, fact_id) in &orphans {
            if table.remove(id.as_str())?.is_some() {
                deleted += 1;
            }
            let key = by_fact_key(fact_id, &ProvenanceId::from(id.as_str()));
            let _ = by_fact.remove(key.as_str());
        }
    }
    txn.commit()?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fact_id: FactId, content_item_id: Option<ContentItemId>) -> ProvenanceReceipt {
        ProvenanceReceipt {
            id: ProvenanceId::new(),
            fact_id,
            content_item_id,
            quote: "we use postgres".to_string(),
            attribution: None,
            strength: Strength::Stated,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn insert_and_fetch_for_fact() {
        let store = Store::open_in_memory().unwrap();
        let fact_id = FactId::new();
        let receipt = sample(fact_id.clone(), Some(ContentItemId::new()));
        insert_provenance(&store, receipt.clone()).unwrap();
        let fetched = provenance_for_fact(&store, &fact_id).unwrap();
        assert_eq!(fetched, vec![receipt]);
    }

    #[test]
    fn batched_fetch_for_multiple_content_items() {
        let store = Store::open_in_memory().unwrap();
        let c1 = ContentItemId::new();
        let c2 = ContentItemId::new();
        let r1 = sample(FactId::new(), Some(c1.clone()));
        let r2 = sample(FactId::new(), Some(c2.clone()));
        insert_provenance(&store, r1.clone()).unwrap();
        insert_provenance(&store, r2.clone()).unwrap();
        let mut fetched = provenance_for_content_items(&store, &[c1, c2]).unwrap();
        fetched.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        let mut expected = vec![r1, r2];
        expected.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        assert_eq!(fetched, expected);
    }
}
