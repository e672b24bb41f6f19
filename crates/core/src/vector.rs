//! Per-fact embedding storage and similarity search.
//!
//! Two index backends, selected at `VectorIndex::rebuild_from_store` time:
//! the default flat/brute-force scan (grounded directly on the teacher's
//! `VectorIndex`), and an optional HNSW-backed native k-NN index
//! (`native-vector-index` feature, grounded on the `hnsw_rs` usage in the
//! `axiograph` example repo). Both honor the same mandatory two-step
//! contract: fetch `k*3` nearest `{fact_id, score}` pairs from the index,
//! then one batched fact lookup by id set — never a query that joins the
//! vector index with the fact table in a single step.

use std::collections::HashSet;

use redb::ReadableTable;

use crate::error::{Error, Result};
use crate::facts::{facts_by_ids, Fact};
use crate::ids::FactId;
use crate::persistence::{tables, Store};

#[derive(Debug, Clone)]
struct Entry {
    id: FactId,
    embedding: Vec<f32>,
}

/// Flat, in-memory cosine-similarity index. Rebuilt from redb on process
/// start; never persisted in its own right.
#[derive(Debug, Default, Clone)]
struct FlatIndex {
    entries: Vec<Entry>,
    dim: Option<usize>,
}

impl FlatIndex {
    fn insert(&mut self, id: FactId, embedding: Vec<f32>) -> Result<()> {
        if embedding.is_empty() {
            return Err(Error::VectorDimensionMismatch { expected: self.dim.unwrap_or(0), actual: 0 });
        }
        match self.dim {
            None => self.dim = Some(embedding.len()),
            Some(d) if d != embedding.len() => {
                return Err(Error::VectorDimensionMismatch { expected: d, actual: embedding.len() });
            }
            _ => {}
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.embedding = embedding;
        } else {
            self.entries.push(Entry { id, embedding });
        }
        Ok(())
    }

    /// Embeddings are never evicted on invalidation by design: historical
    /// point-in-time vector search needs the embedding of a fact that was
    /// valid then, even if it is not valid now. `valid_ids` is how callers
    /// exclude it from a given query instead.
    fn search(&self, query: &[f32], k: usize, valid_ids: &HashSet<FactId>) -> Vec<(FactId, f32)> {
        if k == 0 || valid_ids.is_empty() || self.entries.is_empty() {
            return Vec::new();
        }
        let query_norm = l2_norm(query);
        if query_norm == 0.0 {
            return Vec::new();
        }
        let mut scored: Vec<(FactId, f32)> = self
            .entries
            .iter()
            .filter(|e| valid_ids.contains(&e.id))
            .map(|e| (e.id.clone(), cosine_similarity(query, &e.embedding, query_norm)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    fn dim(&self) -> Option<usize> {
        self.dim
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_similarity(a: &[f32], b: &[f32], a_norm: f32) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let b_norm = l2_norm(b);
    if b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

#[cfg(feature = "native-vector-index")]
mod native {
    use super::*;
    use hnsw_rs::prelude::{DistL2, Hnsw};

    /// Cosine rank order over L2 distance of L2-normalized vectors is
    /// identical to cosine similarity order, so normalizing on insert lets
    /// `hnsw_rs`'s `DistL2` metric stand in for cosine without a custom
    /// `Distance` impl.
    fn normalize(v: &[f32]) -> Vec<f32> {
        let norm = l2_norm(v);
        if norm == 0.0 {
            v.to_vec()
        } else {
            v.iter().map(|x| x / norm).collect()
        }
    }

    pub struct NativeIndex {
        ids: Vec<FactId>,
        hnsw: Hnsw<'static, f32, DistL2>,
        dim: usize,
    }

    impl NativeIndex {
        pub fn build(entries: &[(FactId, Vec<f32>)]) -> Option<Self> {
            let dim = entries.first()?.1.len();
            let m = 16;
            let ef_construction = 200;
            let nb_elem = entries.len().max(1);
            let max_layer = 16.min((nb_elem as f32).ln().trunc() as usize).max(1);
            let hnsw = Hnsw::<f32, DistL2>::new(m, nb_elem, max_layer, ef_construction, DistL2 {});
            let mut ids = Vec::with_capacity(entries.len());
            for (i, (id, embedding)) in entries.iter().enumerate() {
                let normalized = normalize(embedding);
                hnsw.insert((&normalized, i));
                ids.push(id.clone());
            }
            Some(Self { ids, hnsw, dim })
        }

        pub fn dim(&self) -> usize {
            self.dim
        }

        pub fn search(&self, query: &[f32], k: usize) -> Vec<(FactId, f32)> {
            if k == 0 || self.ids.is_empty() {
                return Vec::new();
            }
            let ef_search = 64.max(k * 2);
            let normalized = normalize(query);
            self.hnsw
                .search(&normalized, k, ef_search)
                .into_iter()
                .filter_map(|n| self.ids.get(n.d_id).map(|id| (id.clone(), 1.0 - n.distance)))
                .collect()
        }
    }
}

/// Unified handle over whichever backend this deployment uses. Construction
/// is the only place the two modes differ; `search` always returns the same
/// shape.
pub enum VectorIndex {
    Flat(FlatIndex),
    #[cfg(feature = "native-vector-index")]
    Native(native::NativeIndex),
}

impl VectorIndex {
    /// Rebuilds the index from the `embeddings` table — called once at
    /// `Store` open, not per query.
    pub fn rebuild_from_store(store: &Store) -> Result<Self> {
        let entries = all_embeddings(store)?;
        #[cfg(feature = "native-vector-index")]
        {
            if let Some(native) = native::NativeIndex::build(&entries) {
                return Ok(VectorIndex::Native(native));
            }
        }
        let mut flat = FlatIndex::default();
        for (id, embedding) in entries {
            flat.insert(id, embedding)?;
        }
        Ok(VectorIndex::Flat(flat))
    }

    pub fn dim(&self) -> Option<usize> {
        match self {
            VectorIndex::Flat(f) => f.dim(),
            #[cfg(feature = "native-vector-index")]
            VectorIndex::Native(n) => Some(n.dim()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VectorIndex::Flat(f) => f.len(),
            #[cfg(feature = "native-vector-index")]
            VectorIndex::Native(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Step (a) of the mandatory two-step pattern: nearest `{fact_id,
    /// score}` pairs, over-fetched by the caller and not yet filtered
    /// against `valid_ids` for the native backend (the caller applies that
    /// filter itself, since HNSW has no temporal-filter hook).
    fn nearest(&self, query: &[f32], k: usize, valid_ids: &HashSet<FactId>) -> Vec<(FactId, f32)> {
        match self {
            VectorIndex::Flat(f) => f.search(query, k, valid_ids),
            #[cfg(feature = "native-vector-index")]
            VectorIndex::Native(n) => n
                .search(query, k)
                .into_iter()
                .filter(|(id, _)| valid_ids.contains(id))
                .collect(),
        }
    }
}

fn embedding_key(fact_id: &FactId) -> &str {
    fact_id.0.as_str()
}

fn all_embeddings(store: &Store) -> Result<Vec<(FactId, Vec<f32>)>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::EMBEDDINGS)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        let embedding: Vec<f32> = v
            .value()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        out.push((FactId::from(k.value()), embedding));
    }
    Ok(out)
}

/// Writes the embedding dimension check-and-set and the raw embedding bytes
/// as one step of an already-open write transaction, so callers (the
/// resolver inserting a new fact with an embedding) get atomicity with the
/// fact row for free. Mixing dimensions is a fatal configuration error, not
/// a retryable one.
pub fn persist_embedding_in_txn(
    txn: &redb::WriteTransaction,
    fact_id: &FactId,
    embedding: &[f32],
) -> Result<()> {
    if embedding.is_empty() {
        return Err(Error::VectorDimensionMismatch { expected: 0, actual: 0 });
    }
    {
        let mut meta = txn.open_table(tables::EMBEDDING_META)?;
        let stored_dim: Option<u64> = meta.get("dim")?.map(|g| g.value());
        match stored_dim {
            None => {
                meta.insert("dim", embedding.len() as u64)?;
            }
            Some(d) if d as usize != embedding.len() => {
                return Err(Error::VectorDimensionMismatch {
                    expected: d as usize,
                    actual: embedding.len(),
                });
            }
            _ => {}
        }
    }
    let bytes: Vec<u8> = embedding.iter().flat_map(|x| x.to_le_bytes()).collect();
    let mut table = txn.open_table(tables::EMBEDDINGS)?;
    table.insert(embedding_key(fact_id), bytes.as_slice())?;
    Ok(())
}

pub fn embedding_dim(store: &Store) -> Result<Option<usize>> {
    let txn = store.begin_read()?;
    let meta = txn.open_table(tables::EMBEDDING_META)?;
    Ok(meta.get("dim")?.map(|v| v.value() as usize))
}

/// Step (a)+(b) of the mandatory two-step query pattern, run together:
/// over-fetch `k*3` nearest ids from the index, then one batched
/// `facts_by_ids` call, merged in process. Never a per-hit fact fetch.
pub fn query_two_step(
    store: &Store,
    index: &VectorIndex,
    query: &[f32],
    k: usize,
    valid_ids: &HashSet<FactId>,
) -> Result<Vec<(Fact, f32)>> {
    if let Some(d) = index.dim() {
        if query.len() != d {
            return Err(Error::VectorDimensionMismatch { expected: d, actual: query.len() });
        }
    }
    let over_fetched = index.nearest(query, k.saturating_mul(3), valid_ids);
    let ids: Vec<FactId> = over_fetched.iter().map(|(id, _)| id.clone()).collect();
    let scores: std::collections::HashMap<FactId, f32> = over_fetched.into_iter().collect();
    let mut facts = facts_by_ids(store, &ids)?;
    facts.sort_by(|a, b| {
        scores[&b.id].partial_cmp(&scores[&a.id]).unwrap_or(std::cmp::Ordering::Equal)
    });
    facts.truncate(k);
    Ok(facts.into_iter().map(|f| { let s = scores[&f.id]; (f, s) }).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{insert_fact, Datatype, Fact, FactStatus, Polarity, Scope, Value};
    use chrono::Utc;

    fn fact_with_id(id: FactId) -> Fact {
        Fact {
            id,
            subject_id: crate::ids::EntityId::new(),
            predicate: "interest".to_string(),
            object: Value::Literal { value: "Rust".into(), datatype: Datatype::String },
            polarity: Polarity::Positive,
            valid_from: Utc::now(),
            valid_to: None,
            status: FactStatus::Active,
            confidence: 0.9,
            source: "test".into(),
            created_at: Utc::now(),
            scope: Scope::Project,
            project_path: None,
            has_embedding: true,
        }
    }

    #[test]
    fn flat_index_ranks_by_cosine_similarity() {
        let mut idx = FlatIndex::default();
        let ids: Vec<FactId> = (0..3).map(|_| FactId::new()).collect();
        idx.insert(ids[0].clone(), vec![1.0, 0.0, 0.0]).unwrap();
        idx.insert(ids[1].clone(), vec![0.0, 1.0, 0.0]).unwrap();
        idx.insert(ids[2].clone(), vec![-1.0, 0.0, 0.0]).unwrap();
        let valid: HashSet<FactId> = ids.iter().cloned().collect();
        let results = idx.search(&[1.0, 0.0, 0.0], 3, &valid);
        assert_eq!(results[0].0, ids[0]);
        assert_eq!(results[2].0, ids[2]);
    }

    #[test]
    fn flat_index_rejects_dimension_mismatch() {
        let mut idx = FlatIndex::default();
        idx.insert(FactId::new(), vec![1.0, 0.0]).unwrap();
        let err = idx.insert(FactId::new(), vec![1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, Error::VectorDimensionMismatch { .. }));
    }

    #[test]
    fn query_two_step_merges_index_hits_with_batched_fact_fetch() {
        let store = Store::open_in_memory().unwrap();
        let fact = fact_with_id(FactId::new());
        insert_fact(&store, fact.clone()).unwrap();
        let txn = store.begin_write().unwrap();
        persist_embedding_in_txn(&txn, &fact.id, &[1.0, 0.0, 0.0]).unwrap();
        txn.commit().unwrap();

        let index = VectorIndex::rebuild_from_store(&store).unwrap();
        let valid: HashSet<FactId> = [fact.id.clone()].into_iter().collect();
        let results = query_two_step(&store, &index, &[1.0, 0.0, 0.0], 5, &valid).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, fact.id);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn query_rejects_dimension_mismatch_against_established_index() {
        let store = Store::open_in_memory().unwrap();
        let fact = fact_with_id(FactId::new());
        insert_fact(&store, fact.clone()).unwrap();
        let txn = store.begin_write().unwrap();
        persist_embedding_in_txn(&txn, &fact.id, &[1.0, 0.0]).unwrap();
        txn.commit().unwrap();
        let index = VectorIndex::rebuild_from_store(&store).unwrap();
        let err = query_two_step(&store, &index, &[1.0, 0.0, 0.0], 5, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::VectorDimensionMismatch { .. }));
    }

    #[test]
    fn empty_corpus_search_returns_empty() {
        let store = Store::open_in_memory().unwrap();
        let index = VectorIndex::rebuild_from_store(&store).unwrap();
        let results = query_two_step(&store, &index, &[1.0, 0.0], 5, &HashSet::new()).unwrap();
        assert!(results.is_empty());
    }
}
