//! Supersession edges between facts, and the conflict ledger the resolver
//! writes to when it cannot rank two candidates on the same slot.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{ConflictId, FactId, FactLinkId};
use crate::persistence::{prefix_range, tables, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Supersedes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactLink {
    pub id: FactLinkId,
    pub from_fact_id: FactId,
    pub to_fact_id: FactId,
    pub link_type: LinkType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    pub id: ConflictId,
    pub fact_a: FactId,
    pub fact_b: FactId,
    pub status: ConflictStatus,
    pub detected_at: DateTime<Utc>,
    pub notes: String,
}

pub fn insert_fact_link(
    store: &Store,
    from_fact_id: FactId,
    to_fact_id: FactId,
    link_type: LinkType,
) -> Result<FactLinkId> {
    let txn = store.begin_write()?;
    let link = FactLink {
        id: FactLinkId::new(),
        from_fact_id,
        to_fact_id,
        link_type,
        created_at: Utc::now(),
    };
    insert_fact_link_in_txn(&txn, &link)?;
    txn.commit()?;
    Ok(link.id)
}

pub fn insert_fact_link_in_txn(txn: &redb::WriteTransaction, link: &FactLink) -> Result<()> {
    {
        let mut links = txn.open_table(tables::FACT_LINKS)?;
        links.insert(link.id.0.as_str(), serde_json::to_string(link)?.as_str())?;
    }
    {
        let mut by_from = txn.open_table(tables::FACT_LINKS_BY_FROM)?;
        let key = format!("{}:{}", link.from_fact_id.0, link.id.0);
        by_from.insert(key.as_str(), link.id.0.as_str())?;
    }
    {
        let mut by_to = txn.open_table(tables::FACT_LINKS_BY_TO)?;
        let key = format!("{}:{}", link.to_fact_id.0, link.id.0);
        by_to.insert(key.as_str(), link.id.0.as_str())?;
    }
    Ok(())
}

/// Facts this fact supersedes (it is the `from` side of the edge).
pub fn supersedes_of(store: &Store, fact_id: &FactId) -> Result<Vec<FactLink>> {
    range_links(store, &tables::FACT_LINKS_BY_FROM, fact_id)
}

/// Facts that superseded this fact (it is the `to` side of the edge). Spec
/// allows more than one: two facts can both supersede the same stale one.
pub fn superseded_by_of(store: &Store, fact_id: &FactId) -> Result<Vec<FactLink>> {
    range_links(store, &tables::FACT_LINKS_BY_TO, fact_id)
}

fn range_links(
    store: &Store,
    index: &TableDefinition<&str, &str>,
    fact_id: &FactId,
) -> Result<Vec<FactLink>> {
    let txn = store.begin_read()?;
    let idx = txn.open_table(*index)?;
    let links = txn.open_table(tables::FACT_LINKS)?;
    let (start, end) = prefix_range(&format!("{}:", fact_id.0));
    let mut out = Vec::new();
    for entry in idx.range(start.as_str()..end.as_str())? {
        let (_, v) = entry?;
        if let Some(row) = links.get(v.value())? {
            out.push(serde_json::from_str(row.value())?);
        }
    }
    Ok(out)
}

pub fn insert_conflict(store: &Store, fact_a: FactId, fact_b: FactId, notes: String) -> Result<ConflictId> {
    let txn = store.begin_write()?;
    let conflict = Conflict {
        id: ConflictId::new(),
        fact_a,
        fact_b,
        status: ConflictStatus::Open,
        detected_at: Utc::now(),
        notes,
    };
    insert_conflict_in_txn(&txn, &conflict)?;
    txn.commit()?;
    Ok(conflict.id)
}

pub fn insert_conflict_in_txn(txn: &redb::WriteTransaction, conflict: &Conflict) -> Result<()> {
    {
        let mut conflicts = txn.open_table(tables::CONFLICTS)?;
        conflicts.insert(conflict.id.0.as_str(), serde_json::to_string(conflict)?.as_str())?;
    }
    let mut by_fact = txn.open_table(tables::CONFLICTS_BY_FACT)?;
    for fact_id in [&conflict.fact_a, &conflict.fact_b] {
        let key = format!("{}:{}", fact_id.0, conflict.id.0);
        by_fact.insert(key.as_str(), conflict.id.0.as_str())?;
    }
    Ok(())
}

/// Marks an open conflict resolved, either by operator action or because
/// the resolver later established a supersession between the pair.
pub fn resolve_conflict(store: &Store, conflict_id: &ConflictId) -> Result<Option<Conflict>> {
    let txn = store.begin_write()?;
    let mut conflicts = txn.open_table(tables::CONFLICTS)?;
    let Some(existing) = conflicts.get(conflict_id.0.as_str())?.map(|v| v.value().to_string()) else {
        return Ok(None);
    };
    let mut conflict: Conflict = serde_json::from_str(&existing)?;
    conflict.status = ConflictStatus::Resolved;
    conflicts.insert(conflict_id.0.as_str(), serde_json::to_string(&conflict)?.as_str())?;
    drop(conflicts);
    txn.commit()?;
    Ok(Some(conflict))
}

pub fn conflicts_for_fact(store: &Store, fact_id: &FactId) -> Result<Vec<Conflict>> {
    let txn = store.begin_read()?;
    let by_fact = txn.open_table(tables::CONFLICTS_BY_FACT)?;
    let conflicts = txn.open_table(tables::CONFLICTS)?;
    let (start, end) = prefix_range(&format!("{}:", fact_id.0));
    let mut out = Vec::new();
    for entry in by_fact.range(start.as_str()..end.as_str())? {
        let (_, v) = entry?;
        if let Some(row) = conflicts.get(v.value())? {
            out.push(serde_json::from_str(row.value())?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supersession_edge_is_visible_from_both_sides() {
        let store = Store::open_in_memory().unwrap();
        let old = FactId::new();
        let new = FactId::new();
        insert_fact_link(&store, new.clone(), old.clone(), LinkType::Supersedes).unwrap();
        assert_eq!(supersedes_of(&store, &new).unwrap().len(), 1);
        assert_eq!(superseded_by_of(&store, &old).unwrap().len(), 1);
    }

    #[test]
    fn two_facts_can_supersede_the_same_stale_fact() {
        let store = Store::open_in_memory().unwrap();
        let old = FactId::new();
        insert_fact_link(&store, FactId::new(), old.clone(), LinkType::Supersedes).unwrap();
        insert_fact_link(&store, FactId::new(), old.clone(), LinkType::Supersedes).unwrap();
        assert_eq!(superseded_by_of(&store, &old).unwrap().len(), 2);
    }

    #[test]
    fn conflict_lifecycle_open_to_resolved() {
        let store = Store::open_in_memory().unwrap();
        let a = FactId::new();
        let b = FactId::new();
        let id = insert_conflict(&store, a.clone(), b, "ambiguous auth method".to_string()).unwrap();
        assert_eq!(conflicts_for_fact(&store, &a).unwrap()[0].status, ConflictStatus::Open);
        let resolved = resolve_conflict(&store, &id).unwrap().unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
    }

    #[test]
    fn resolve_unknown_conflict_returns_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(resolve_conflict(&store, &ConflictId::new()).unwrap().is_none());
    }
}
