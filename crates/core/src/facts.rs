//! The fact store: temporally-bounded assertions, their state machine, and
//! the read projections the resolver and recall engine build on.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::entities::Entity;
use crate::error::Result;
use crate::ids::{EntityId, FactId};
use crate::persistence::{prefix_range, tables, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datatype {
    String,
    Number,
    Boolean,
    Date,
}

/// Either a reference to another entity, or a literal value with a datatype
/// tag. Equivalence on literals is case-insensitive after trimming; on
/// entity references it is by entity id — see `Value::matches`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Value {
    Entity(EntityId),
    Literal { value: String, datatype: Datatype },
}

impl Value {
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Entity(a), Value::Entity(b)) => a == b,
            (
                Value::Literal { value: a, .. },
                Value::Literal { value: b, .. },
            ) => a.trim().eq_ignore_ascii_case(b.trim()),
            _ => false,
        }
    }

    /// The text used to build a fact's signature and its searchable string.
    pub fn display_text(&self) -> String {
        match self {
            Value::Entity(id) => id.0.clone(),
            Value::Literal { value, .. } => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactStatus {
    Proposed,
    Active,
    Disputed,
    Superseded,
    Retracted,
}

/// Evidence strength, ordered `Stated > Inferred > Derived` — `Ord`'s
/// natural variant order matches declaration order here, so
/// `Strength::Stated > Strength::Inferred` holds without a custom impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    Derived,
    Inferred,
    Stated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    #[default]
    Project,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub id: FactId,
    pub subject_id: EntityId,
    pub predicate: String,
    pub object: Value,
    pub polarity: Polarity,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub status: FactStatus,
    pub confidence: f32,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub scope: Scope,
    pub project_path: Option<String>,
    pub has_embedding: bool,
}

impl Fact {
    pub fn is_active(&self) -> bool {
        matches!(self.status, FactStatus::Active) && self.valid_to.is_none()
    }

    /// The fact's identity for equivalence purposes, independent of id:
    /// (subject, predicate, object). Subject is compared by id here; the
    /// resolver substitutes canonical names where a human-readable
    /// signature is needed (e.g. recall dedup).
    pub fn signature(&self) -> (EntityId, String, String) {
        (
            self.subject_id.clone(),
            self.predicate.clone(),
            self.object.display_text().trim().to_lowercase(),
        )
    }
}

/// A `Fact` joined at read time with its subject's canonical display name,
/// so callers never pay for a denormalized column that can drift.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactWithSubjectName {
    pub fact: Fact,
    pub subject_name: String,
}

fn slot_key(subject_id: &EntityId, predicate: &str, fact_id: &FactId) -> String {
    format!("{}:{}:{}", subject_id.0, predicate, fact_id.0)
}

pub fn insert_fact(store: &Store, fact: Fact) -> Result<()> {
    let txn = store.begin_write()?;
    write_fact_in_txn(&txn, &fact)?;
    txn.commit()?;
    Ok(())
}

/// Shared by callers (the resolver) that need to write a fact as one step
/// of a larger transaction they already own.
pub fn write_fact_in_txn(txn: &redb::WriteTransaction, fact: &Fact) -> Result<()> {
    {
        let mut facts = txn.open_table(tables::FACTS)?;
        facts.insert(fact.id.0.as_str(), serde_json::to_string(fact)?.as_str())?;
    }
    {
        let mut by_slot = txn.open_table(tables::FACTS_BY_SLOT)?;
        let key = slot_key(&fact.subject_id, &fact.predicate, &fact.id);
        by_slot.insert(key.as_str(), fact.id.0.as_str())?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct FactUpdate {
    pub status: Option<FactStatus>,
    pub valid_to: Option<Option<DateTime<Utc>>>,
    pub scope: Option<Scope>,
    pub project_path: Option<Option<String>>,
    pub confidence: Option<f32>,
}

pub fn update_fact(store: &Store, fact_id: &FactId, update: FactUpdate) -> Result<Option<Fact>> {
    let txn = store.begin_write()?;
    let updated = update_fact_in_txn(&txn, fact_id, update)?;
    txn.commit()?;
    Ok(updated)
}

pub fn update_fact_in_txn(
    txn: &redb::WriteTransaction,
    fact_id: &FactId,
    update: FactUpdate,
) -> Result<Option<Fact>> {
    let mut facts = txn.open_table(tables::FACTS)?;
    let Some(existing) = facts.get(fact_id.0.as_str())?.map(|v| v.value().to_string()) else {
        return Ok(None);
    };
    let mut fact: Fact = serde_json::from_str(&existing)?;
    if let Some(status) = update.status {
        fact.status = status;
    }
    if let Some(valid_to) = update.valid_to {
        fact.valid_to = valid_to;
    }
    if let Some(scope) = update.scope {
        fact.scope = scope;
    }
    if let Some(project_path) = update.project_path {
        fact.project_path = project_path;
    }
    if let Some(confidence) = update.confidence {
        fact.confidence = confidence;
    }
    facts.insert(fact_id.0.as_str(), serde_json::to_string(&fact)?.as_str())?;
    Ok(Some(fact))
}

pub fn fact_by_id(store: &Store, fact_id: &FactId) -> Result<Option<Fact>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::FACTS)?;
    match table.get(fact_id.0.as_str())? {
        Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
        None => Ok(None),
    }
}

/// Batched fetch by id set — the second half of the mandatory two-step
/// lexical/vector query pattern. Missing ids are silently omitted.
pub fn facts_by_ids(store: &Store, ids: &[FactId]) -> Result<Vec<Fact>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::FACTS)?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(v) = table.get(id.0.as_str())? {
            out.push(serde_json::from_str(v.value())?);
        }
    }
    Ok(out)
}

/// All facts currently on a (subject, predicate) slot with the given
/// status, via the `facts_by_slot` prefix index — never a full-table scan.
pub fn facts_for_slot(
    store: &Store,
    subject_id: &EntityId,
    predicate: &str,
    status: Option<FactStatus>,
) -> Result<Vec<Fact>> {
    let txn = store.begin_read()?;
    let by_slot = txn.open_table(tables::FACTS_BY_SLOT)?;
    let facts = txn.open_table(tables::FACTS)?;
    let (start, end) = prefix_range(&format!("{}:{}:", subject_id.0, predicate));
    let mut out = Vec::new();
    for entry in by_slot.range(start.as_str()..end.as_str())? {
        let (_, v) = entry?;
        if let Some(row) = facts.get(v.value())? {
            let fact: Fact = serde_json::from_str(row.value())?;
            if status.map(|s| s as u8 == fact.status as u8).unwrap_or(true) {
                out.push(fact);
            }
        }
    }
    Ok(out)
}

/// Currently active facts for a slot — the read the resolver's decision
/// tree is built around.
pub fn active_facts_for_slot(
    store: &Store,
    subject_id: &EntityId,
    predicate: &str,
) -> Result<Vec<Fact>> {
    Ok(facts_for_slot(store, subject_id, predicate, Some(FactStatus::Active))?
        .into_iter()
        .filter(|f| f.is_active())
        .collect())
}

/// Same slot read as `active_facts_for_slot`, against an already-open write
/// transaction — so the resolver's per-candidate slot lookup sees its own
/// prior writes within the same `apply` call and the whole decision tree
/// commits atomically.
pub fn active_facts_for_slot_in_txn(
    txn: &redb::WriteTransaction,
    subject_id: &EntityId,
    predicate: &str,
) -> Result<Vec<Fact>> {
    let by_slot = txn.open_table(tables::FACTS_BY_SLOT)?;
    let facts = txn.open_table(tables::FACTS)?;
    let (start, end) = prefix_range(&format!("{}:{}:", subject_id.0, predicate));
    let mut out = Vec::new();
    for entry in by_slot.range(start.as_str()..end.as_str())? {
        let (_, v) = entry?;
        if let Some(row) = facts.get(v.value())? {
            let fact: Fact = serde_json::from_str(row.value())?;
            if fact.is_active() {
                out.push(fact);
            }
        }
    }
    Ok(out)
}

/// Every fact id in the store, for callers (lexical/vector corpus builders)
/// that need the whole id set to search over. A full scan; callers that
/// only need ids with embeddings should prefer `facts_with_embeddings`.
pub fn all_fact_ids(store: &Store) -> Result<Vec<FactId>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::FACTS)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (k, _) = entry?;
        out.push(FactId::from(k.value()));
    }
    Ok(out)
}

/// Every fact that has a stored embedding, for vector index rebuild on
/// open. A full scan is acceptable here: it runs once per process start,
/// not per query.
pub fn facts_with_embeddings(store: &Store) -> Result<Vec<FactId>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::FACTS)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_, v) = entry?;
        let fact: Fact = serde_json::from_str(v.value())?;
        if fact.has_embedding {
            out.push(fact.id);
        }
    }
    Ok(out)
}

/// Joins a batch of facts with their subjects' canonical names in one pass,
/// avoiding an N+1 entity lookup per fact.
pub fn join_subject_names(
    store: &Store,
    facts: Vec<Fact>,
) -> Result<Vec<FactWithSubjectName>> {
    let txn = store.begin_read()?;
    let entities = txn.open_table(tables::ENTITIES)?;
    let unique_ids: HashSet<&str> = facts.iter().map(|f| f.subject_id.0.as_str()).collect();
    let mut names = std::collections::HashMap::with_capacity(unique_ids.len());
    for id in unique_ids {
        if let Some(v) = entities.get(id)? {
            let entity: Entity = serde_json::from_str(v.value())?;
            names.insert(id.to_string(), entity.display_name);
        }
    }
    Ok(facts
        .into_iter()
        .map(|fact| {
            let subject_name = names
                .get(fact.subject_id.0.as_str())
                .cloned()
                .unwrap_or_else(|| fact.subject_id.0.clone());
            FactWithSubjectName { fact, subject_name }
        })
        .collect())
}

pub fn fact_with_subject_name(store: &Store, fact_id: &FactId) -> Result<Option<FactWithSubjectName>> {
    let Some(fact) = fact_by_id(store, fact_id)? else {
        return Ok(None);
    };
    Ok(join_subject_names(store, vec![fact])?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{find_or_create_entity, EntityType};

    fn sample_fact(subject_id: EntityId, predicate: &str, object: Value) -> Fact {
        Fact {
            id: FactId::new(),
            subject_id,
            predicate: predicate.to_string(),
            object,
            polarity: Polarity::Positive,
            valid_from: Utc::now(),
            valid_to: None,
            status: FactStatus::Active,
            confidence: 0.9,
            source: "test".to_string(),
            created_at: Utc::now(),
            scope: Scope::Project,
            project_path: Some("/repo".to_string()),
            has_embedding: false,
        }
    }

    #[test]
    fn insert_and_fetch_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let entity = find_or_create_entity(&store, EntityType::Database, "Postgres").unwrap();
        let fact = sample_fact(
            entity.id.clone(),
            "uses_database",
            Value::Literal { value: "Postgres".into(), datatype: Datatype::String },
        );
        insert_fact(&store, fact.clone()).unwrap();
        let fetched = fact_by_id(&store, &fact.id).unwrap().unwrap();
        assert_eq!(fetched, fact);
    }

    #[test]
    fn facts_for_slot_is_scoped_to_subject_and_predicate() {
        let store = Store::open_in_memory().unwrap();
        let alice = find_or_create_entity(&store, EntityType::Person, "Alice").unwrap();
        let bob = find_or_create_entity(&store, EntityType::Person, "Bob").unwrap();
        let f1 = sample_fact(
            alice.id.clone(),
            "auth_method",
            Value::Literal { value: "oauth".into(), datatype: Datatype::String },
        );
        let f2 = sample_fact(
            bob.id.clone(),
            "auth_method",
            Value::Literal { value: "saml".into(), datatype: Datatype::String },
        );
        insert_fact(&store, f1.clone()).unwrap();
        insert_fact(&store, f2).unwrap();
        let slot = facts_for_slot(&store, &alice.id, "auth_method", None).unwrap();
        assert_eq!(slot, vec![f1]);
    }

    #[test]
    fn update_fact_changes_status_and_valid_to() {
        let store = Store::open_in_memory().unwrap();
        let entity = find_or_create_entity(&store, EntityType::Database, "Postgres").unwrap();
        let fact = sample_fact(
            entity.id,
            "uses_database",
            Value::Literal { value: "Postgres".into(), datatype: Datatype::String },
        );
        insert_fact(&store, fact.clone()).unwrap();
        let now = Utc::now();
        let updated = update_fact(
            &store,
            &fact.id,
            FactUpdate {
                status: Some(FactStatus::Superseded),
                valid_to: Some(Some(now)),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(updated.status, FactStatus::Superseded);
        assert_eq!(updated.valid_to, Some(now));
        assert!(!updated.is_active());
    }

    #[test]
    fn update_fact_on_unknown_id_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let result = update_fact(&store, &FactId::new(), FactUpdate::default()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn literal_equivalence_is_case_insensitive_after_trim() {
        let a = Value::Literal { value: " Postgres ".into(), datatype: Datatype::String };
        let b = Value::Literal { value: "postgres".into(), datatype: Datatype::String };
        assert!(a.matches(&b));
    }

    #[test]
    fn entity_equivalence_is_by_id_not_by_text() {
        let a = Value::Entity(EntityId::from("e1"));
        let b = Value::Entity(EntityId::from("e2"));
        assert!(!a.matches(&b));
    }

    #[test]
    fn join_subject_names_avoids_missing_entity_panics() {
        let store = Store::open_in_memory().unwrap();
        let fact = sample_fact(
            EntityId::new(),
            "uses_database",
            Value::Literal { value: "Postgres".into(), datatype: Datatype::String },
        );
        insert_fact(&store, fact.clone()).unwrap();
        let joined = fact_with_subject_name(&store, &fact.id).unwrap().unwrap();
        assert_eq!(joined.subject_name, fact.subject_id.0);
    }

    #[test]
    fn strength_ordering_matches_spec() {
        assert!(Strength::Stated > Strength::Inferred);
        assert!(Strength::Inferred > Strength::Derived);
    }
}
