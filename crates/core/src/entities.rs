//! Entity registry: the canonical subject/object nodes facts point at, plus
//! the aliases the resolver uses to recognize that "Postgres" and
//! "PostgreSQL" name the same entity.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{AliasId, EntityId};
use crate::persistence::{prefix_range, tables, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Database,
    Framework,
    Language,
    Platform,
    Repo,
    Module,
    Person,
    Service,
    Other,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityType::Database => "database",
            EntityType::Framework => "framework",
            EntityType::Language => "language",
            EntityType::Platform => "platform",
            EntityType::Repo => "repo",
            EntityType::Module => "module",
            EntityType::Person => "person",
            EntityType::Service => "service",
            EntityType::Other => "other",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub display_name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityAlias {
    pub id: AliasId,
    pub entity_id: EntityId,
    pub alias: String,
    pub source: Option<String>,
    pub confidence: f32,
}

/// `"{type}:{lowercased-name-with-nonalphanumerics-as-single-underscore,
/// stripped of leading/trailing underscores}"` — the uniqueness key both
/// entity lookup and alias deduplication normalize against.
pub fn slugify(entity_type: EntityType, name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_was_underscore = false;
    for ch in name.trim().to_lowercase().chars() {
        if ch.is_alphanumeric() {
            normalized.push(ch);
            last_was_underscore = false;
        } else if !last_was_underscore {
            normalized.push('_');
            last_was_underscore = true;
        }
    }
    let trimmed = normalized.trim_matches('_');
    format!("{entity_type}:{trimmed}")
}

/// Looks up `(type, name)` by slug, creating a new entity if none exists.
///
/// Races between two writers creating the same slug are resolved by retry:
/// if the insert loses to a concurrent writer between the read and the
/// write (possible only across processes, since redb serializes writers
/// within one), the second attempt finds the just-created row and returns
/// it instead of erroring.
pub fn find_or_create_entity(store: &Store, entity_type: EntityType, name: &str) -> Result<Entity> {
    let txn = store.begin_write()?;
    let entity = find_or_create_entity_in_txn(&txn, entity_type, name)?;
    txn.commit()?;
    Ok(entity)
}

/// Same lookup-or-create as `find_or_create_entity`, against an
/// already-open transaction — the shape the resolver needs so entity
/// upsert and fact insertion commit atomically as one `apply` call.
pub fn find_or_create_entity_in_txn(
    txn: &redb::WriteTransaction,
    entity_type: EntityType,
    name: &str,
) -> Result<Entity> {
    Ok(find_or_create_entity_with_created_in_txn(txn, entity_type, name)?.0)
}

/// Same as `find_or_create_entity_in_txn`, also reporting whether this call
/// created the entity — the resolver's `entities_created` counter needs
/// this, nothing else does.
pub fn find_or_create_entity_with_created_in_txn(
    txn: &redb::WriteTransaction,
    entity_type: EntityType,
    name: &str,
) -> Result<(Entity, bool)> {
    let slug = slugify(entity_type, name);
    let existing = {
        let by_slug = txn.open_table(tables::ENTITIES_BY_SLUG)?;
        by_slug.get(slug.as_str())?.map(|v| v.value().to_string())
    };
    if let Some(entity_id) = existing {
        let entities = txn.open_table(tables::ENTITIES)?;
        let entity: Entity = entities
            .get(entity_id.as_str())?
            .map(|v| serde_json::from_str(v.value()))
            .transpose()?
            .expect("entities_by_slug row without a matching entities row");
        return Ok((entity, false));
    }

    let entity = Entity {
        id: EntityId::new(),
        entity_type,
        display_name: name.trim().to_string(),
        slug: slug.clone(),
        created_at: Utc::now(),
    };
    {
        let mut entities = txn.open_table(tables::ENTITIES)?;
        entities.insert(entity.id.0.as_str(), serde_json::to_string(&entity)?.as_str())?;
    }
    {
        let mut by_slug = txn.open_table(tables::ENTITIES_BY_SLUG)?;
        by_slug.insert(slug.as_str(), entity.id.0.as_str())?;
    }
    Ok((entity, true))
}

pub fn entity_by_id(store: &Store, id: &EntityId) -> Result<Option<Entity>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::ENTITIES)?;
    match table.get(id.0.as_str())? {
        Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
        None => Ok(None),
    }
}

/// Adds `alias` to `entity_id` if no existing alias normalizes the same
/// way. Aliases are not unique across entities by design — resolving an
/// ambiguous alias to a single entity is the resolver's job, not this
/// module's.
pub fn add_alias(
    store: &Store,
    entity_id: &EntityId,
    alias: &str,
    source: Option<String>,
    confidence: f32,
) -> Result<AliasId> {
    let normalized = alias.trim().to_lowercase();
    let txn = store.begin_write()?;
    let (start, end) = prefix_range(&format!("{}:", entity_id.0));
    let existing = {
        let table = txn.open_table(tables::ENTITY_ALIASES)?;
        table
            .range(start.as_str()..end.as_str())?
            .filter_map(|e| e.ok())
            .find_map(|(_, v)| {
                let row: EntityAlias = serde_json::from_str(v.value()).ok()?;
                (row.alias.trim().to_lowercase() == normalized).then_some(row.id)
            })
    };
    if let Some(id) = existing {
        txn.commit()?;
        return Ok(id);
    }

    let record = EntityAlias {
        id: AliasId::new(),
        entity_id: entity_id.clone(),
        alias: alias.trim().to_string(),
        source,
        confidence,
    };
    {
        let mut table = txn.open_table(tables::ENTITY_ALIASES)?;
        let key = format!("{}:{}", entity_id.0, record.id.0);
        table.insert(key.as_str(), serde_json::to_string(&record)?.as_str())?;
    }
    txn.commit()?;
    Ok(record.id.clone())
}

pub fn aliases_for(store: &Store, entity_id: &EntityId) -> Result<Vec<EntityAlias>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::ENTITY_ALIASES)?;
    let (start, end) = prefix_range(&format!("{}:", entity_id.0));
    let mut out = Vec::new();
    for entry in table.range(start.as_str()..end.as_str())? {
        let (_, v) = entry?;
        out.push(serde_json::from_str(v.value())?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_or_create_is_idempotent_across_casing_and_whitespace() {
        let store = Store::open_in_memory().unwrap();
        let a = find_or_create_entity(&store, EntityType::Database, "PostgreSQL").unwrap();
        let b = find_or_create_entity(&store, EntityType::Database, "  postgresql  ").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.slug, "database:postgresql");
    }

    #[test]
    fn slug_collapses_nonalphanumerics_and_strips_edges() {
        assert_eq!(slugify(EntityType::Service, "--My Service!!"), "service:my_service");
    }

    #[test]
    fn distinct_names_get_distinct_entities() {
        let store = Store::open_in_memory().unwrap();
        let a = find_or_create_entity(&store, EntityType::Database, "Postgres").unwrap();
        let b = find_or_create_entity(&store, EntityType::Database, "MySQL").unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn same_name_different_type_is_a_distinct_entity() {
        let store = Store::open_in_memory().unwrap();
        let a = find_or_create_entity(&store, EntityType::Database, "redis").unwrap();
        let b = find_or_create_entity(&store, EntityType::Service, "redis").unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn aliases_are_deduplicated_case_insensitively() {
        let store = Store::open_in_memory().unwrap();
        let e = find_or_create_entity(&store, EntityType::Database, "Postgres").unwrap();
        let first = add_alias(&store, &e.id, "Postgres DB", None, 0.9).unwrap();
        let second = add_alias(&store, &e.id, "postgres db", None, 0.9).unwrap();
        assert_eq!(first, second);
        assert_eq!(aliases_for(&store, &e.id).unwrap().len(), 1);
    }
}
