//! The hybrid recall engine: lexical + vector retrieval fused by
//! Reciprocal Rank Fusion, exposed as three progressively detailed read
//! shapes, plus a shortcut registry and a batched `explain`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::content_log::all_content_item_ids;
use crate::embedding::EmbeddingGenerator;
use crate::error::Result;
use crate::facts::{
    all_fact_ids, fact_by_id, facts_by_ids, join_subject_names, Fact, FactStatus, FactWithSubjectName, Scope,
};
use crate::ids::{ConflictId, FactId};
use crate::lexical::{search_content, search_facts};
use crate::links::{conflicts_for_fact, superseded_by_of, supersedes_of};
use crate::persistence::Store;
use crate::provenance::{provenance_for_content_items, provenance_for_fact, ProvenanceReceipt};
use crate::store_manager::{ReadScope, StoreManager};
use crate::vector::{query_two_step, VectorIndex};

/// Layer 1 of progressive disclosure: enough to decide what's relevant
/// before paying for the full fact and its receipts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexHit {
    pub id: FactId,
    pub subject: String,
    pub predicate: String,
    pub object_preview: String,
    pub status: FactStatus,
    pub scope: Scope,
    pub confidence: f32,
    pub token_estimate: u32,
    pub source: String,
}

/// Legacy full shape: the complete fact plus its receipts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FullResult {
    pub fact: Fact,
    pub subject_name: String,
    pub receipts: Vec<ProvenanceReceipt>,
    pub source: String,
    pub similarity: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FactRelationships {
    pub supersedes: Vec<FactId>,
    pub superseded_by: Vec<FactId>,
    pub conflicts: Vec<ConflictId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecallDetail {
    pub fact: FactWithSubjectName,
    pub receipts: Vec<ProvenanceReceipt>,
    pub relationships: FactRelationships,
}

/// `explain`'s response. A missing fact is the null object:
/// `status = "not_found"`, `fact = None`, every collection empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Explanation {
    pub fact: Option<Fact>,
    pub status: String,
    pub receipts: Vec<ProvenanceReceipt>,
    pub supersedes: Vec<FactId>,
    pub superseded_by: Vec<FactId>,
    pub conflicts: Vec<ConflictId>,
}

impl Explanation {
    fn not_found() -> Self {
        Self {
            fact: None,
            status: "not_found".to_string(),
            receipts: Vec::new(),
            supersedes: Vec::new(),
            superseded_by: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

/// A named canned query the assistant can invoke without composing its own
/// free-text search — centralized here rather than as one method per
/// shortcut name, so adding one is a data change, not a code change.
pub struct Shortcut {
    pub name: &'static str,
    pub query_text: &'static str,
    pub scope: ReadScope,
    pub default_limit: usize,
}

const SHORTCUTS: &[Shortcut] = &[
    Shortcut { name: "decisions", query_text: "decision", scope: ReadScope::All, default_limit: 20 },
    Shortcut { name: "conventions", query_text: "convention", scope: ReadScope::All, default_limit: 20 },
    Shortcut { name: "architecture", query_text: "architecture design pattern", scope: ReadScope::All, default_limit: 20 },
    Shortcut { name: "project_config", query_text: "uses_database auth_method deployment_platform", scope: ReadScope::Project, default_limit: 20 },
];

pub fn shortcut(name: &str) -> Option<&'static Shortcut> {
    SHORTCUTS.iter().find(|s| s.name == name)
}

/// Roughly 1 token per 4 characters of whitespace-normalized text.
fn estimate_tokens(text: &str) -> u32 {
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    ((normalized.chars().count() as f32 / 4.0).ceil() as u32).max(1)
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

fn fact_signature(row: &FactWithSubjectName) -> (String, String, String) {
    (
        row.subject_name.trim().to_lowercase(),
        row.fact.predicate.clone(),
        row.fact.object.display_text().trim().to_lowercase(),
    )
}

/// Layer 1: `query_index`. Answers in three batched round trips per
/// involved store: (a) lexical search over content items, (b) one batched
/// provenance fetch for the matching content ids, (c) one batched fact
/// fetch (plus its subject-name join) for the fact ids those receipts
/// point at. No per-hit query is ever issued.
pub fn query_index(store_manager: &mut StoreManager, scope: ReadScope, text: &str, limit: usize) -> Result<Vec<IndexHit>> {
    let mut hits = Vec::new();
    if matches!(scope, ReadScope::Project | ReadScope::All) {
        hits.extend(query_index_one(store_manager.ensure_project()?, text, limit, Scope::Project)?);
    }
    if matches!(scope, ReadScope::Global | ReadScope::All) {
        hits.extend(query_index_one(store_manager.ensure_global()?, text, limit, Scope::Global)?);
    }
    hits.sort_by(|a: &IndexHit, b: &IndexHit| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
    hits.truncate(limit);
    Ok(hits)
}

fn query_index_one(store: &Store, text: &str, limit: usize, scope: Scope) -> Result<Vec<IndexHit>> {
    // (a)
    let all_content_ids = all_content_item_ids(store)?;
    let content_hits = search_content(store, &all_content_ids, text, limit.max(10))?;
    if content_hits.is_empty() {
        return Ok(Vec::new());
    }
    let content_ids: Vec<_> = content_hits.iter().map(|(id, _)| id.clone()).collect();
    let content_scores: HashMap<_, _> = content_hits.into_iter().collect();

    // (b)
    let receipts = provenance_for_content_items(store, &content_ids)?;
    let mut fact_score: HashMap<FactId, f32> = HashMap::new();
    for receipt in &receipts {
        let Some(content_id) = &receipt.content_item_id else { continue };
        let Some(&score) = content_scores.get(content_id) else { continue };
        fact_score.entry(receipt.fact_id.clone()).and_modify(|s| *s = s.max(score)).or_insert(score);
    }

    // (c)
    let fact_ids: Vec<FactId> = fact_score.keys().cloned().collect();
    let facts = facts_by_ids(store, &fact_ids)?;
    let joined = join_subject_names(store, facts)?;

    let mut out: Vec<IndexHit> = joined
        .into_iter()
        .map(|row| {
            let searchable =
                format!("{} {} {}", row.subject_name, row.fact.predicate.replace('_', " "), row.fact.object.display_text());
            IndexHit {
                id: row.fact.id.clone(),
                subject: row.subject_name,
                predicate: row.fact.predicate.clone(),
                object_preview: preview(&row.fact.object.display_text(), 50),
                status: row.fact.status,
                scope,
                confidence: row.fact.confidence,
                token_estimate: estimate_tokens(&searchable),
                source: row.fact.source.clone(),
            }
        })
        .collect();

    out.sort_by(|a, b| {
        let sa = fact_score.get(&a.id).copied().unwrap_or(0.0);
        let sb = fact_score.get(&b.id).copied().unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
    });
    out.truncate(limit);
    Ok(out)
}

/// One vector index per store the caller cares about, built once at store
/// open (`VectorIndex::rebuild_from_store`) and handed in by reference —
/// recall never rebuilds an index per query.
pub struct ScopedVectorIndex<'a> {
    pub project: Option<&'a VectorIndex>,
    pub global: Option<&'a VectorIndex>,
}

fn rrf_fuse(lists: &[(&[FactId], f32)], k: f32) -> HashMap<FactId, f32> {
    let mut scores: HashMap<FactId, f32> = HashMap::new();
    for (ids, weight) in lists {
        for (rank, id) in ids.iter().enumerate() {
            *scores.entry(id.clone()).or_insert(0.0) += weight / (k + rank as f32 + 1.0);
        }
    }
    scores
}

fn top_rank_bonus(lists: &[&[FactId]], id: &FactId) -> f32 {
    let best_rank = lists.iter().filter_map(|ids| ids.iter().position(|x| x == id)).min();
    match best_rank {
        Some(0) => 0.05,
        Some(1) | Some(2) => 0.02,
        _ => 0.0,
    }
}

/// Performance hook: skip vector search when the top lexical hit is
/// strong and clearly separated from the runner-up.
fn smart_expansion_skip(lexical_hits: &[(FactId, f32)]) -> bool {
    match lexical_hits {
        [] => false,
        [only] => only.1 >= 0.85,
        [top, second, ..] => top.1 >= 0.85 && (top.1 - second.1) >= 0.15,
    }
}

type ScoredRow = (FactWithSubjectName, Scope, f32, Option<f32>);

fn hybrid_for_store(
    store: &Store,
    vector_index: Option<&VectorIndex>,
    embedder: &dyn EmbeddingGenerator,
    text: &str,
    limit: usize,
    rrf_k: f32,
    scope: Scope,
) -> Result<Vec<ScoredRow>> {
    let all_ids = all_fact_ids(store)?;
    if all_ids.is_empty() {
        return Ok(Vec::new());
    }
    let over_fetch = (limit * 4).max(20);

    let lexical_hits = search_facts(store, &all_ids, text, over_fetch)?;
    let lexical_ids: Vec<FactId> = lexical_hits.iter().map(|(id, _)| id.clone()).collect();

    let mut similarity: HashMap<FactId, f32> = HashMap::new();
    let vector_ids: Vec<FactId> = if smart_expansion_skip(&lexical_hits) {
        Vec::new()
    } else if let Some(index) = vector_index {
        let embedding = embedder.generate(text)?;
        let valid: HashSet<FactId> = all_ids.iter().cloned().collect();
        query_two_step(store, index, &embedding, over_fetch, &valid)?
            .into_iter()
            .map(|(fact, score)| {
                similarity.insert(fact.id.clone(), score);
                fact.id
            })
            .collect()
    } else {
        Vec::new()
    };

    let scores = rrf_fuse(&[(&lexical_ids, 1.0), (&vector_ids, 1.0)], rrf_k);
    let lists: [&[FactId]; 2] = [&lexical_ids, &vector_ids];

    let mut scored: Vec<(FactId, f32)> = scores
        .into_iter()
        .map(|(id, score)| {
            let bonus = top_rank_bonus(&lists, &id);
            (id, score + bonus)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(over_fetch);

    let ids: Vec<FactId> = scored.iter().map(|(id, _)| id.clone()).collect();
    let score_by_id: HashMap<FactId, f32> = scored.into_iter().collect();
    let facts = facts_by_ids(store, &ids)?;
    let joined = join_subject_names(store, facts)?;

    Ok(joined
        .into_iter()
        .map(|row| {
            let score = score_by_id.get(&row.fact.id).copied().unwrap_or(0.0);
            let sim = similarity.get(&row.fact.id).copied();
            (row, scope, score, sim)
        })
        .collect())
}

fn dedupe_keep_highest(rows: Vec<ScoredRow>) -> Vec<ScoredRow> {
    let mut best: HashMap<(String, String, String), usize> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        let sig = fact_signature(&row.0);
        match best.get(&sig) {
            Some(&existing) if rows[existing].2 >= row.2 => {}
            _ => {
                best.insert(sig, i);
            }
        }
    }
    let mut indices: Vec<usize> = best.into_values().collect();
    indices.sort_unstable();
    indices.into_iter().map(|i| rows[i].clone()).collect()
}

fn scope_rank(scope: Scope) -> u8 {
    match scope {
        Scope::Project => 0,
        Scope::Global => 1,
    }
}

/// Layer 2: `query`, the legacy full shape. Runs the hybrid lexical+vector
/// pipeline per involved store, fuses by RRF, dedupes by fact signature,
/// then applies the scope tie-break (project beats global, then score,
/// then recency).
pub fn query(
    store_manager: &mut StoreManager,
    indexes: &ScopedVectorIndex,
    embedder: &dyn EmbeddingGenerator,
    scope: ReadScope,
    text: &str,
    limit: usize,
    config: &Config,
) -> Result<Vec<FullResult>> {
    let mut combined: Vec<ScoredRow> = Vec::new();

    if matches!(scope, ReadScope::Project | ReadScope::All) {
        let store = store_manager.ensure_project()?;
        combined.extend(hybrid_for_store(store, indexes.project, embedder, text, limit, config.rrf_k, Scope::Project)?);
    }
    if matches!(scope, ReadScope::Global | ReadScope::All) {
        let store = store_manager.ensure_global()?;
        combined.extend(hybrid_for_store(store, indexes.global, embedder, text, limit, config.rrf_k, Scope::Global)?);
    }

    let mut ranked = dedupe_keep_highest(combined);
    ranked.sort_by(|a, b| {
        scope_rank(a.1)
            .cmp(&scope_rank(b.1))
            .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal))
            .then_with(|| b.0.fact.created_at.cmp(&a.0.fact.created_at))
    });
    ranked.truncate(limit);

    let mut out = Vec::with_capacity(ranked.len());
    for (row, fact_scope, _score, similarity) in ranked {
        let store = store_manager.store_for_scope(fact_scope)?;
        let receipts = provenance_for_fact(store, &row.fact.id)?;
        out.push(FullResult {
            subject_name: row.subject_name,
            source: row.fact.source.clone(),
            fact: row.fact,
            receipts,
            similarity,
        });
    }
    Ok(out)
}

/// Layer 3: `recall_details`. Batched fact fetch, then per-fact receipts
/// and relationship edges — still never a query per candidate id up
/// front, only the (already cheap, index-backed) per-fact detail reads.
pub fn recall_details(store_manager: &mut StoreManager, fact_ids: &[FactId], scope: Scope) -> Result<Vec<RecallDetail>> {
    let store = store_manager.store_for_scope(scope)?;
    let facts = facts_by_ids(store, fact_ids)?;
    let joined = join_subject_names(store, facts)?;

    let mut out = Vec::with_capacity(joined.len());
    for row in joined {
        let receipts = provenance_for_fact(store, &row.fact.id)?;
        let relationships = FactRelationships {
            supersedes: supersedes_of(store, &row.fact.id)?.into_iter().map(|l| l.to_fact_id).collect(),
            superseded_by: superseded_by_of(store, &row.fact.id)?.into_iter().map(|l| l.from_fact_id).collect(),
            conflicts: conflicts_for_fact(store, &row.fact.id)?.into_iter().map(|c| c.id).collect(),
        };
        out.push(RecallDetail { fact: row, receipts, relationships });
    }
    Ok(out)
}

/// `explain`: one fact row, one receipts query, one query per supersession
/// direction, one conflicts query. Unknown id is the null object, never a
/// failure.
pub fn explain(store_manager: &mut StoreManager, fact_id: &FactId, scope: Scope) -> Result<Explanation> {
    let store = store_manager.store_for_scope(scope)?;
    let Some(fact) = fact_by_id(store, fact_id)? else {
        return Ok(Explanation::not_found());
    };
    let receipts = provenance_for_fact(store, fact_id)?;
    let supersedes = supersedes_of(store, fact_id)?.into_iter().map(|l| l.to_fact_id).collect();
    let superseded_by = superseded_by_of(store, fact_id)?.into_iter().map(|l| l.from_fact_id).collect();
    let conflicts = conflicts_for_fact(store, fact_id)?.into_iter().map(|c| c.id).collect();
    Ok(Explanation { fact: Some(fact), status: "ok".to_string(), receipts, supersedes, superseded_by, conflicts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FixedPaths};
    use crate::content_log::{upsert_content_item, ContentItem};
    use crate::entities::{find_or_create_entity, EntityType};
    use crate::facts::{insert_fact, Datatype, Polarity, Value};
    use crate::ids::{ContentItemId, EntityId, ProvenanceId};
    use crate::provenance::insert_provenance;
    use chrono::Utc;
    use tempfile::tempdir;

    fn manager(dir: &tempfile::TempDir) -> StoreManager {
        let paths = FixedPaths {
            global: dir.path().join("global.redb"),
            project: dir.path().join("project.redb"),
        };
        StoreManager::new(&paths, &Config::default())
    }

    fn seed_fact_with_content(store: &Store, subject: &str, predicate: &str, object: &str, quote: &str) -> FactId {
        let entity = find_or_create_entity(store, EntityType::Repo, subject).unwrap();
        let fact = Fact {
            id: FactId::new(),
            subject_id: entity.id,
            predicate: predicate.to_string(),
            object: Value::Literal { value: object.to_string(), datatype: Datatype::String },
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
        };
        insert_fact(store, fact.clone()).unwrap();
        let content_id = ContentItemId::new();
        upsert_content_item(
            store,
            ContentItem {
                id: content_id.clone(),
                source: "transcript".to_string(),
                session_id: "s1".to_string(),
                transcript_path: "/tmp/t.jsonl".to_string(),
                project_path: None,
                occurred_at: Utc::now(),
                ingested_at: Utc::now(),
                content_hash: quote.to_string(),
                byte_len: quote.len() as u64,
                raw_text: quote.to_string(),
                metadata: serde_json::json!({}),
                git_branch: None,
                working_dir: None,
                tool_version: None,
                thinking_level: None,
                source_modified_at: None,
                processed: false,
            },
        )
        .unwrap();
        insert_provenance(
            store,
            ProvenanceReceipt {
                id: ProvenanceId::new(),
                fact_id: fact.id.clone(),
                content_item_id: Some(content_id),
                quote: quote.to_string(),
                attribution: None,
                strength: crate::facts::Strength::Stated,
                recorded_at: Utc::now(),
            },
        )
        .unwrap();
        fact.id
    }

    #[test]
    fn query_index_returns_matching_facts_with_bounded_preview() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(&dir);
        let project = mgr.ensure_project().unwrap();
        seed_fact_with_content(project, "repo", "uses_database", "PostgreSQL", "we use Postgres for storage");

        let hits = query_index(&mut mgr, ReadScope::Project, "postgres", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].object_preview.chars().count() <= 50);
        assert!(hits[0].token_estimate > 0);
    }

    #[test]
    fn explain_on_unknown_fact_returns_null_object() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(&dir);
        mgr.ensure_project().unwrap();
        let explanation = explain(&mut mgr, &FactId::new(), Scope::Project).unwrap();
        assert_eq!(explanation.status, "not_found");
        assert!(explanation.fact.is_none());
        assert!(explanation.receipts.is_empty());
    }

    #[test]
    fn explain_on_known_fact_reports_relationships() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(&dir);
        let project = mgr.ensure_project().unwrap();
        let fact_id = seed_fact_with_content(project, "repo", "uses_database", "PostgreSQL", "we use Postgres");

        let explanation = explain(&mut mgr, &fact_id, Scope::Project).unwrap();
        assert_eq!(explanation.status, "ok");
        assert_eq!(explanation.receipts.len(), 1);
        assert!(explanation.supersedes.is_empty());
    }

    #[test]
    fn recall_details_silently_omits_missing_ids() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(&dir);
        let project = mgr.ensure_project().unwrap();
        let fact_id = seed_fact_with_content(project, "repo", "uses_database", "PostgreSQL", "we use Postgres");

        let details = recall_details(&mut mgr, &[fact_id.clone(), FactId::new()], Scope::Project).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].fact.fact.id, fact_id);
    }

    #[test]
    fn shortcut_registry_resolves_known_names_only() {
        assert!(shortcut("decisions").is_some());
        assert!(shortcut("not_a_real_shortcut").is_none());
    }

    #[test]
    fn empty_corpus_query_index_returns_empty() {
        let dir = tempdir().unwrap();
        let mut mgr = manager(&dir);
        mgr.ensure_project().unwrap();
        assert!(query_index(&mut mgr, ReadScope::Project, "anything", 10).unwrap().is_empty());
    }

    #[test]
    fn dedupe_keeps_the_highest_scored_signature_match() {
        let entity_id = EntityId::new();
        let make = |score: f32, confidence: f32| {
            let fact = Fact {
                id: FactId::new(),
                subject_id: entity_id.clone(),
                predicate: "uses_database".to_string(),
                object: Value::Literal { value: "Postgres".into(), datatype: Datatype::String },
                polarity: Polarity::Positive,
                valid_from: Utc::now(),
                valid_to: None,
                status: FactStatus::Active,
                confidence,
                source: "test".to_string(),
                created_at: Utc::now(),
                scope: Scope::Project,
                project_path: Some("/repo".to_string()),
                has_embedding: false,
            };
            (FactWithSubjectName { fact, subject_name: "repo".to_string() }, Scope::Project, score, None)
        };
        let rows = vec![make(0.2, 0.5), make(0.8, 0.9)];
        let deduped = dedupe_keep_highest(rows);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].2, 0.8);
    }
}
