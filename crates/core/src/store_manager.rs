//! Dual-scope coordinator: the only component that owns the global and
//! project `Store` handles. Everything else borrows a `&Store` for the
//! duration of one call; nothing else holds one across calls.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, PathResolver};
use crate::entities::{entity_by_id, find_or_create_entity};
use crate::error::{Error, Result};
use crate::facts::{active_facts_for_slot, fact_by_id, insert_fact, join_subject_names, Fact, FactWithSubjectName, Scope};
use crate::ids::{FactId, ProvenanceId};
use crate::persistence::Store;
use crate::provenance::{insert_provenance, provenance_for_fact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadScope {
    Global,
    Project,
    All,
}

/// Owns the global and project databases, opening each lazily on first use.
pub struct StoreManager {
    global_path: PathBuf,
    project_path: PathBuf,
    busy_timeout: Duration,
    global: Option<Store>,
    project: Option<Store>,
}

impl StoreManager {
    pub fn new(paths: &impl PathResolver, config: &Config) -> Self {
        Self {
            global_path: paths.global_db_path(),
            project_path: paths.project_db_path(),
            busy_timeout: config.busy_timeout,
            global: None,
            project: None,
        }
    }

    pub fn ensure_global(&mut self) -> Result<&Store> {
        if self.global.is_none() {
            self.global = Some(Store::open(&self.global_path, self.busy_timeout)?);
        }
        Ok(self.global.as_ref().expect("just initialized"))
    }

    pub fn ensure_project(&mut self) -> Result<&Store> {
        if self.project.is_none() {
            self.project = Some(Store::open(&self.project_path, self.busy_timeout)?);
        }
        Ok(self.project.as_ref().expect("just initialized"))
    }

    pub fn ensure_both(&mut self) -> Result<(&Store, &Store)> {
        self.ensure_global()?;
        self.ensure_project()?;
        Ok((self.global.as_ref().expect("just initialized"), self.project.as_ref().expect("just initialized")))
    }

    pub fn store_for_scope(&mut self, scope: Scope) -> Result<&Store> {
        match scope {
            Scope::Global => self.ensure_global(),
            Scope::Project => self.ensure_project(),
        }
    }

    /// Runs `reader` against the store(s) implied by `scope`, joining
    /// subject names and, for `All`, merging project and global results:
    /// dedup by (subject name, predicate, object text), project wins ties.
    pub fn read_merged(
        &mut self,
        scope: ReadScope,
        mut reader: impl FnMut(&Store) -> Result<Vec<Fact>>,
    ) -> Result<Vec<FactWithSubjectName>> {
        match scope {
            ReadScope::Project => {
                let store = self.ensure_project()?;
                let facts = reader(store)?;
                join_subject_names(store, facts)
            }
            ReadScope::Global => {
                let store = self.ensure_global()?;
                let facts = reader(store)?;
                join_subject_names(store, facts)
            }
            ReadScope::All => {
                let (global, project) = self.ensure_both()?;
                let project_facts = reader(project)?;
                let global_facts = reader(global)?;
                let project_rows = join_subject_names(project, project_facts)?;
                let global_rows = join_subject_names(global, global_facts)?;
                Ok(dedupe_project_first(project_rows, global_rows))
            }
        }
    }

    /// Copies `project_fact_id` into the global store: upserts its subject
    /// entity there by slug, inserts a `scope = global` copy of the fact
    /// (or reuses an existing equivalent one), and copies every provenance
    /// receipt. Non-atomic across the two files by spec; idempotent on
    /// replay because the entity upsert is slug-keyed and the fact lookup
    /// is signature-checked before inserting a duplicate.
    pub fn promote_fact(&mut self, project_fact_id: &FactId) -> Result<Option<FactId>> {
        let project = self.ensure_project()?;
        let Some(project_fact) = fact_by_id(project, project_fact_id)? else {
            return Ok(None);
        };
        let subject = entity_by_id(project, &project_fact.subject_id)?.ok_or_else(|| {
            Error::NotFound(format!("entity {} for promoted fact", project_fact.subject_id))
        })?;
        let receipts = provenance_for_fact(project, project_fact_id)?;

        let global = self.ensure_global()?;
        let global_subject = find_or_create_entity(global, subject.entity_type, &subject.display_name)?;

        let existing = active_facts_for_slot(global, &global_subject.id, &project_fact.predicate)?
            .into_iter()
            .find(|f| f.object.matches(&project_fact.object) && f.polarity == project_fact.polarity);

        let global_fact_id = if let Some(existing) = existing {
            existing.id
        } else {
            let mut new_fact = project_fact.clone();
            new_fact.id = FactId::new();
            new_fact.subject_id = global_subject.id.clone();
            new_fact.scope = Scope::Global;
            new_fact.project_path = None;
            insert_fact(global, new_fact.clone())?;
            new_fact.id
        };

        for receipt in receipts {
            let mut copy = receipt.clone();
            copy.id = ProvenanceId::new();
            copy.fact_id = global_fact_id.clone();
            insert_provenance(global, copy)?;
        }

        Ok(Some(global_fact_id))
    }
}

fn dedupe_project_first(
    project: Vec<FactWithSubjectName>,
    global: Vec<FactWithSubjectName>,
) -> Vec<FactWithSubjectName> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(project.len() + global.len());
    for row in project.into_iter().chain(global.into_iter()) {
        let signature = (
            row.subject_name.trim().to_lowercase(),
            row.fact.predicate.clone(),
            row.fact.object.display_text().trim().to_lowercase(),
        );
        if seen.insert(signature) {
            out.push(row);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityType;
    use crate::facts::{facts_for_slot, Datatype, Polarity, Value};
    use chrono::Utc;
    use tempfile::tempdir;

    struct FixedPaths {
        global: PathBuf,
        project: PathBuf,
    }

    impl PathResolver for FixedPaths {
        fn global_db_path(&self) -> PathBuf {
            self.global.clone()
        }
        fn project_db_path(&self) -> PathBuf {
            self.project.clone()
        }
    }

    fn manager(dir: &tempfile::TempDir) -> StoreManager {
        let paths = FixedPaths {
            global: dir.path().join("global.redb"),
            project: dir.path().join("project.redb"),
        };
        StoreManager::new(&paths, &Config::default())
    }

    #[test]
    fn promote_fact_copies_entity_fact_and_receipts_into_global() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(&dir);
        let project = mgr.ensure_project().unwrap();
        let entity = find_or_create_entity(project, EntityType::Database, "Postgres").unwrap();
        let fact = Fact {
            id: FactId::new(),
            subject_id: entity.id,
            predicate: "uses_database".to_string(),
            object: Value::Literal { value: "Postgres".into(), datatype: Datatype::String },
            polarity: Polarity::Positive,
            valid_from: Utc::now(),
            valid_to: None,
            status: crate::facts::FactStatus::Active,
            confidence: 0.9,
            source: "test".to_string(),
            created_at: Utc::now(),
            scope: Scope::Project,
            project_path: Some("/repo".to_string()),
            has_embedding: false,
        };
        insert_fact(project, fact.clone()).unwrap();
        insert_provenance(
            project,
            crate::provenance::ProvenanceReceipt {
                id: ProvenanceId::new(),
                fact_id: fact.id.clone(),
                content_item_id: None,
                quote: "we use postgres".to_string(),
                attribution: None,
                strength: crate::facts::Strength::Stated,
                recorded_at: Utc::now(),
            },
        )
        .unwrap();

        let global_id = mgr.promote_fact(&fact.id).unwrap().unwrap();
        let global = mgr.ensure_global().unwrap();
        let global_fact = fact_by_id(global, &global_id).unwrap().unwrap();
        assert_eq!(global_fact.scope, Scope::Global);
        assert!(global_fact.project_path.is_none());
        assert_eq!(provenance_for_fact(global, &global_id).unwrap().len(), 1);
    }

    #[test]
    fn promote_fact_is_idempotent_on_replay() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(&dir);
        let project = mgr.ensure_project().unwrap();
        let entity = find_or_create_entity(project, EntityType::Database, "Postgres").unwrap();
        let fact = Fact {
            id: FactId::new(),
            subject_id: entity.id,
            predicate: "uses_database".to_string(),
            object: Value::Literal { value: "Postgres".into(), datatype: Datatype::String },
            polarity: Polarity::Positive,
            valid_from: Utc::now(),
            valid_to: None,
            status: crate::facts::FactStatus::Active,
            confidence: 0.9,
            source: "test".to_string(),
            created_at: Utc::now(),
            scope: Scope::Project,
            project_path: Some("/repo".to_string()),
            has_embedding: false,
        };
        insert_fact(project, fact.clone()).unwrap();

        let first = mgr.promote_fact(&fact.id).unwrap().unwrap();
        let second = mgr.promote_fact(&fact.id).unwrap().unwrap();
        assert_eq!(first, second);

        let global = mgr.ensure_global().unwrap();
        let global_entity_id = fact_by_id(global, &first).unwrap().unwrap().subject_id;
        assert_eq!(facts_for_slot(global, &global_entity_id, "uses_database", None).unwrap().len(), 1);
    }

    #[test]
    fn promote_unknown_fact_returns_none_and_makes_no_changes() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(&dir);
        assert!(mgr.promote_fact(&FactId::new()).unwrap().is_none());
    }
}
