//! The resolver: turns a distiller's `Extraction` into entity, fact,
//! provenance, link, and conflict writes, all inside one transaction.
//!
//! This is the hardest single piece of logic in the store — see the
//! decision tree in `resolve_candidate`, which implements the
//! equivalent/additive/supersedes/conflict priority order exactly as
//! specified, consulting `predicate_policy::classify` as the only source of
//! cardinality rules.

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::config::Config;
use crate::entities::{find_or_create_entity_with_created_in_txn, EntityType};
use crate::error::Result;
use crate::facts::{
    active_facts_for_slot_in_txn, update_fact_in_txn, write_fact_in_txn, Datatype, Fact,
    FactStatus, FactUpdate, Polarity, Scope, Strength, Value,
};
use crate::ids::{ConflictId, EntityId, FactId};
use crate::links::{insert_conflict_in_txn, insert_fact_link_in_txn, Conflict, ConflictStatus, FactLink, LinkType};
use crate::predicate_policy::{classify, Cardinality};
use crate::provenance::{insert_provenance_in_txn, ProvenanceReceipt};
use crate::persistence::Store;
use crate::ids::{ContentItemId, ProvenanceId};

#[derive(Debug, Clone)]
pub struct ExtractionEntity {
    pub entity_type: EntityType,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum ExtractionObject {
    Entity { entity_type: EntityType, name: String },
    Literal { value: String, datatype: Datatype },
}

#[derive(Debug, Clone)]
pub struct ExtractionFact {
    pub subject: String,
    pub subject_type: EntityType,
    pub predicate: String,
    pub object: ExtractionObject,
    pub polarity: Polarity,
    pub confidence: f32,
    pub quote: Option<String>,
    pub strength: Strength,
    pub scope_hint: Option<Scope>,
}

#[derive(Debug, Clone)]
pub struct ExtractionDecision {
    pub title: String,
    pub summary: String,
    pub status_hint: Option<FactStatus>,
}

/// Weak evidence: attached as a receipt to an existing fact on a matching
/// slot, discarded otherwise. Never creates a fact by itself.
#[derive(Debug, Clone)]
pub struct ExtractionSignal {
    pub subject: String,
    pub subject_type: EntityType,
    pub predicate: String,
    pub quote: String,
    pub attribution: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<ExtractionEntity>,
    pub facts: Vec<ExtractionFact>,
    pub decisions: Vec<ExtractionDecision>,
    pub signals: Vec<ExtractionSignal>,
    pub content_item_id: Option<ContentItemId>,
    pub occurred_at: DateTime<Utc>,
    pub project_path: Option<String>,
    pub scope_hint: Scope,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub entities_created: usize,
    pub facts_created: usize,
    pub facts_superseded: usize,
    pub conflicts_created: usize,
}

pub struct Resolver<'a> {
    config: &'a Config,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Applies an extraction as a single write transaction; any failure
    /// rolls the whole thing back, so readers never observe half-applied
    /// state.
    #[instrument(skip(self, store, extraction))]
    pub fn apply(&self, store: &Store, extraction: Extraction) -> Result<ResolveStats> {
        let txn = store.begin_write()?;
        let mut stats = ResolveStats::default();
        let mut entity_ids: std::collections::HashMap<(String, String), EntityId> =
            std::collections::HashMap::new();

        for e in &extraction.entities {
            let (entity, created) =
                find_or_create_entity_with_created_in_txn(&txn, e.entity_type, &e.name)?;
            if created {
                stats.entities_created += 1;
            }
            entity_ids.insert(slot_key(e.entity_type, &e.name), entity.id);
        }

        let mut resolve_entity = |txn: &redb::WriteTransaction,
                                   entity_type: EntityType,
                                   name: &str,
                                   stats: &mut ResolveStats|
         -> Result<EntityId> {
            if let Some(id) = entity_ids.get(&slot_key(entity_type, name)) {
                return Ok(id.clone());
            }
            let (entity, created) = find_or_create_entity_with_created_in_txn(txn, entity_type, name)?;
            if created {
                stats.entities_created += 1;
            }
            entity_ids.insert(slot_key(entity_type, name), entity.id.clone());
            Ok(entity.id)
        };

        // Within-extraction intra-slot tie-break: when two candidates would
        // land on the same (subject, predicate) slot, only the strongest
        // survives as a real decision; the rest become conflicts against it.
        let mut by_slot: std::collections::HashMap<(EntityId, String), Vec<&ExtractionFact>> =
            std::collections::HashMap::new();
        for f in &extraction.facts {
            let subject_id = resolve_entity(&txn, f.subject_type, &f.subject, &mut stats)?;
            by_slot.entry((subject_id, f.predicate.clone())).or_default().push(f);
        }

        for ((subject_id, predicate), mut candidates) in by_slot {
            // Processing strongest-first means a weaker same-extraction
            // candidate sees the stronger one as the slot's existing active
            // fact and naturally loses through the ordinary
            // supersede-or-conflict path below — no separate tie-break
            // machinery needed.
            candidates.sort_by(|a, b| {
                b.strength.cmp(&a.strength).then_with(|| b.confidence.total_cmp(&a.confidence))
            });
            for candidate in candidates {
                resolve_candidate(
                    &txn,
                    self.config,
                    &subject_id,
                    &predicate,
                    candidate,
                    &mut resolve_entity,
                    &mut stats,
                    extraction.content_item_id.clone(),
                    extraction.occurred_at,
                    extraction.project_path.clone(),
                    extraction.scope_hint,
                )?;
            }
        }

        for decision in &extraction.decisions {
            let fact = Fact {
                id: FactId::new(),
                subject_id: EntityId::new(),
                predicate: "decision".to_string(),
                object: Value::Literal {
                    value: format!("{}: {}", decision.title, decision.summary),
                    datatype: Datatype::String,
                },
                polarity: Polarity::Positive,
                valid_from: extraction.occurred_at,
                valid_to: None,
                status: decision.status_hint.unwrap_or(FactStatus::Active),
                confidence: 1.0,
                source: "decision".to_string(),
                created_at: Utc::now(),
                scope: extraction.scope_hint,
                project_path: extraction.project_path.clone(),
                has_embedding: false,
            };
            write_fact_in_txn(&txn, &fact)?;
            stats.facts_created += 1;
            insert_provenance_in_txn(
                &txn,
                &ProvenanceReceipt {
                    id: ProvenanceId::new(),
                    fact_id: fact.id,
                    content_item_id: extraction.content_item_id.clone(),
                    quote: decision.summary.clone(),
                    attribution: None,
                    strength: Strength::Stated,
                    recorded_at: Utc::now(),
                },
            )?;
        }

        for signal in &extraction.signals {
            let subject_id = resolve_entity(&txn, signal.subject_type, &signal.subject, &mut stats)?;
            let matches = active_facts_for_slot_in_txn(&txn, &subject_id, &signal.predicate)?;
            for m in matches {
                insert_provenance_in_txn(
                    &txn,
                    &ProvenanceReceipt {
                        id: ProvenanceId::new(),
                        fact_id: m.id,
                        content_item_id: extraction.content_item_id.clone(),
                        quote: signal.quote.clone(),
                        attribution: signal.attribution.as_deref().map(EntityId::from),
                        strength: Strength::Derived,
                        recorded_at: Utc::now(),
                    },
                )?;
            }
        }

        txn.commit()?;
        info!(
            entities_created = stats.entities_created,
            facts_created = stats.facts_created,
            facts_superseded = stats.facts_superseded,
            conflicts_created = stats.conflicts_created,
            "extraction applied"
        );
        Ok(stats)
    }
}

fn slot_key(entity_type: EntityType, name: &str) -> (String, String) {
    (entity_type.to_string(), name.trim().to_lowercase())
}

#[allow(clippy::too_many_arguments)]
fn resolve_candidate(
    txn: &redb::WriteTransaction,
    config: &Config,
    subject_id: &EntityId,
    predicate: &str,
    candidate: &ExtractionFact,
    resolve_entity: &mut impl FnMut(
        &redb::WriteTransaction,
        EntityType,
        &str,
        &mut ResolveStats,
    ) -> Result<EntityId>,
    stats: &mut ResolveStats,
    content_item_id: Option<ContentItemId>,
    occurred_at: DateTime<Utc>,
    project_path: Option<String>,
    scope_hint: Scope,
) -> Result<Option<FactId>> {
    let object = match &candidate.object {
        ExtractionObject::Entity { entity_type, name } => {
            Value::Entity(resolve_entity(txn, *entity_type, name, stats)?)
        }
        ExtractionObject::Literal { value, datatype } => {
            Value::Literal { value: value.clone(), datatype: *datatype }
        }
    };
    let scope = candidate.scope_hint.unwrap_or(scope_hint);
    let active = active_facts_for_slot_in_txn(txn, subject_id, predicate)?;

    if let Some(existing) = active
        .iter()
        .find(|f| f.object.matches(&object) && f.polarity == candidate.polarity)
    {
        insert_provenance_in_txn(
            txn,
            &ProvenanceReceipt {
                id: ProvenanceId::new(),
                fact_id: existing.id.clone(),
                content_item_id,
                quote: candidate.quote.clone().unwrap_or_default(),
                attribution: None,
                strength: candidate.strength,
                recorded_at: Utc::now(),
            },
        )?;
        if candidate.confidence > existing.confidence {
            update_fact_in_txn(
                txn,
                &existing.id,
                FactUpdate { confidence: Some(candidate.confidence), ..Default::default() },
            )?;
        }
        return Ok(Some(existing.id.clone()));
    }

    let policy = classify(predicate);

    if policy == Cardinality::MultiValued {
        let fact = new_candidate_fact(
            subject_id.clone(),
            predicate.to_string(),
            object,
            candidate,
            occurred_at,
            scope,
            project_path,
            FactStatus::Active,
        );
        write_fact_in_txn(txn, &fact)?;
        stats.facts_created += 1;
        insert_provenance_in_txn(
            txn,
            &ProvenanceReceipt {
                id: ProvenanceId::new(),
                fact_id: fact.id.clone(),
                content_item_id,
                quote: candidate.quote.clone().unwrap_or_default(),
                attribution: None,
                strength: candidate.strength,
                recorded_at: Utc::now(),
            },
        )?;
        return Ok(Some(fact.id));
    }

    // Single-valued slot: at most one active fact survives.
    if let Some(existing) = active.first() {
        let supersedes = candidate.strength >= existing.strength
            && candidate.confidence >= existing.confidence - config.confidence_epsilon;
        if supersedes {
            let fact = new_candidate_fact(
                subject_id.clone(),
                predicate.to_string(),
                object,
                candidate,
                occurred_at,
                scope,
                project_path,
                FactStatus::Active,
            );
            write_fact_in_txn(txn, &fact)?;
            stats.facts_created += 1;
            update_fact_in_txn(
                txn,
                &existing.id,
                FactUpdate {
                    status: Some(FactStatus::Superseded),
                    valid_to: Some(Some(occurred_at)),
                    ..Default::default()
                },
            )?;
            stats.facts_superseded += 1;
            insert_fact_link_in_txn(
                txn,
                &FactLink {
                    id: crate::ids::FactLinkId::new(),
                    from_fact_id: fact.id.clone(),
                    to_fact_id: existing.id.clone(),
                    link_type: LinkType::Supersedes,
                    created_at: Utc::now(),
                },
            )?;
            insert_provenance_in_txn(
                txn,
                &ProvenanceReceipt {
                    id: ProvenanceId::new(),
                    fact_id: fact.id.clone(),
                    content_item_id,
                    quote: candidate.quote.clone().unwrap_or_default(),
                    attribution: None,
                    strength: candidate.strength,
                    recorded_at: Utc::now(),
                },
            )?;
            return Ok(Some(fact.id));
        }

        let fact = new_candidate_fact(
            subject_id.clone(),
            predicate.to_string(),
            object,
            candidate,
            occurred_at,
            scope,
            project_path,
            FactStatus::Proposed,
        );
        write_fact_in_txn(txn, &fact)?;
        stats.facts_created += 1;
        insert_provenance_in_txn(
            txn,
            &ProvenanceReceipt {
                id: ProvenanceId::new(),
                fact_id: fact.id.clone(),
                content_item_id,
                quote: candidate.quote.clone().unwrap_or_default(),
                attribution: None,
                strength: candidate.strength,
                recorded_at: Utc::now(),
            },
        )?;
        insert_conflict_in_txn(
            txn,
            &Conflict {
                id: ConflictId::new(),
                fact_a: existing.id.clone(),
                fact_b: fact.id.clone(),
                status: ConflictStatus::Open,
                detected_at: Utc::now(),
                notes: format!("unranked candidates on slot {predicate}"),
            },
        )?;
        stats.conflicts_created += 1;
        return Ok(Some(fact.id));
    }

    // Single-valued slot with no existing active fact: plain insert.
    let fact = new_candidate_fact(
        subject_id.clone(),
        predicate.to_string(),
        object,
        candidate,
        occurred_at,
        scope,
        project_path,
        FactStatus::Active,
    );
    write_fact_in_txn(txn, &fact)?;
    stats.facts_created += 1;
    insert_provenance_in_txn(
        txn,
        &ProvenanceReceipt {
            id: ProvenanceId::new(),
            fact_id: fact.id.clone(),
            content_item_id,
            quote: candidate.quote.clone().unwrap_or_default(),
            attribution: None,
            strength: candidate.strength,
            recorded_at: Utc::now(),
        },
    )?;
    Ok(Some(fact.id))
}

#[allow(clippy::too_many_arguments)]
fn new_candidate_fact(
    subject_id: EntityId,
    predicate: String,
    object: Value,
    candidate: &ExtractionFact,
    occurred_at: DateTime<Utc>,
    scope: Scope,
    project_path: Option<String>,
    status: FactStatus,
) -> Fact {
    Fact {
        id: FactId::new(),
        subject_id,
        predicate,
        object,
        polarity: candidate.polarity,
        valid_from: occurred_at,
        valid_to: None,
        status,
        confidence: candidate.confidence,
        source: "extraction".to_string(),
        created_at: Utc::now(),
        scope,
        project_path: if matches!(scope, Scope::Global) { None } else { project_path },
        has_embedding: false,
    }
}
