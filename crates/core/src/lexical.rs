//! Full-text search over content item text and over a synthetic per-fact
//! searchable string (subject name, predicate, object, receipt quotes).
//!
//! Builds an in-memory `tantivy` index at query time from the whole
//! corpus, the same Phase-0 shape the teacher's `TemporalGraph::search`
//! uses — the index cost is one scan-and-build per query, not maintained
//! incrementally. Unlike the teacher's `TEXT` field (tokenize + lowercase,
//! no stemming), the analyzer here is a named pipeline with an explicit
//! English stemmer, since recall must match "uses" against "using".

use std::collections::HashMap;

use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, QueryParser};
use tantivy::schema::{Field, Schema, TextFieldIndexing, TextOptions, Value as _, STORED, STRING};
use tantivy::tokenizer::{Language, LowerCaser, SimpleTokenizer, Stemmer, TextAnalyzer};
use tantivy::{doc, Index, Term};

use crate::content_log::content_item_by_id;
use crate::error::Result;
use crate::facts::{fact_by_id, join_subject_names, Fact};
use crate::ids::{ContentItemId, FactId};
use crate::persistence::Store;
use crate::provenance::provenance_for_fact;

const EN_STEM: &str = "en_stem";

fn register_tokenizer(index: &Index) {
    let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(Stemmer::new(Language::English))
        .build();
    index.tokenizers().register(EN_STEM, analyzer);
}

fn stemmed_text_options() -> TextOptions {
    TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(EN_STEM)
            .set_index_option(tantivy::schema::IndexRecordOption::WithFreqsAndPositions),
    )
}

fn build_index(docs: &[(&str, &str)]) -> Result<(Index, Field, Field)> {
    let mut schema_builder = Schema::builder();
    let id_field = schema_builder.add_text_field("id", STRING | STORED);
    let content_field = schema_builder.add_text_field("content", stemmed_text_options());
    let schema = schema_builder.build();
    let index = Index::create_in_ram(schema);
    register_tokenizer(&index);

    let mut writer = index.writer(50_000_000)?;
    for (id, content) in docs {
        writer.add_document(doc!(id_field => *id, content_field => *content))?;
    }
    writer.commit()?;
    Ok((index, id_field, content_field))
}

fn build_fuzzy_query(query: &str, content_field: Field) -> BooleanQuery {
    let terms: Vec<(Occur, Box<dyn Query>)> = query
        .split_whitespace()
        .filter(|token| !token.is_empty())
        .map(|token| {
            let term = Term::from_field_text(content_field, &token.to_lowercase());
            (Occur::Should, Box::new(FuzzyTermQuery::new(term, 1, true)) as Box<dyn Query>)
        })
        .collect();
    BooleanQuery::new(terms)
}

fn run_search(
    docs: &[(&str, &str)],
    query_text: &str,
    limit: usize,
) -> Result<Vec<(String, f32)>> {
    if query_text.trim().is_empty() || limit == 0 || docs.is_empty() {
        return Ok(Vec::new());
    }

    let (index, id_field, content_field) = build_index(docs)?;
    let reader = index.reader()?;
    let searcher = reader.searcher();

    let parser = QueryParser::for_index(&index, vec![content_field]);
    let parsed = parser.parse_query(query_text)?;
    let mut top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit))?;

    if top_docs.is_empty() {
        let fuzzy = build_fuzzy_query(query_text, content_field);
        top_docs = searcher.search(&fuzzy, &TopDocs::with_limit(limit))?;
    }

    let mut out = Vec::with_capacity(top_docs.len());
    for (score, addr) in top_docs {
        let retrieved = searcher.doc::<tantivy::schema::TantivyDocument>(addr)?;
        if let Some(id_val) = retrieved.get_first(id_field).and_then(|v| v.as_str()) {
            out.push((id_val.to_string(), score));
        }
    }
    Ok(out)
}

/// Free-text search over every content item's raw text.
pub fn search_content(
    store: &Store,
    all_content_ids: &[ContentItemId],
    query_text: &str,
    limit: usize,
) -> Result<Vec<(ContentItemId, f32)>> {
    let mut owned = Vec::with_capacity(all_content_ids.len());
    for id in all_content_ids {
        if let Some(item) = content_item_by_id(store, id)? {
            owned.push((id.0.clone(), item.raw_text));
        }
    }
    let docs: Vec<(&str, &str)> = owned.iter().map(|(id, text)| (id.as_str(), text.as_str())).collect();
    let hits = run_search(&docs, query_text, limit)?;
    Ok(hits.into_iter().map(|(id, score)| (ContentItemId::from(id), score)).collect())
}

/// Free-text search over the synthetic per-fact string: subject display
/// name, predicate (underscores expanded to spaces so "uses database"
/// matches `uses_database`), object text, and every receipt's quote.
pub fn search_facts(store: &Store, all_fact_ids: &[FactId], query_text: &str, limit: usize) -> Result<Vec<(FactId, f32)>> {
    let facts: Vec<Fact> = all_fact_ids
        .iter()
        .filter_map(|id| fact_by_id(store, id).ok().flatten())
        .collect();
    let joined = join_subject_names(store, facts)?;

    let mut owned: Vec<(String, String)> = Vec::with_capacity(joined.len());
    for row in &joined {
        let mut parts = vec![row.subject_name.clone(), row.fact.predicate.replace('_', " ")];
        parts.push(row.fact.object.display_text());
        for receipt in provenance_for_fact(store, &row.fact.id)? {
            parts.push(receipt.quote);
        }
        owned.push((row.fact.id.0.clone(), parts.join(" ")));
    }

    let docs: Vec<(&str, &str)> = owned.iter().map(|(id, text)| (id.as_str(), text.as_str())).collect();
    let hits = run_search(&docs, query_text, limit)?;
    let by_id: HashMap<&str, &FactId> = joined.iter().map(|r| (r.fact.id.0.as_str(), &r.fact.id)).collect();
    Ok(hits
        .into_iter()
        .filter_map(|(id, score)| by_id.get(id.as_str()).map(|fact_id| ((*fact_id).clone(), score)))
        .collect())
}
