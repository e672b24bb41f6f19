use anyhow::{Context, Result};
use archivist_core::config::{Config, FixedPaths};
use archivist_core::embedding::EmbeddingGenerator;
use archivist_core::entities::EntityType;
use archivist_core::facts::{Datatype, FactUpdate, Polarity, Scope, Strength};
use archivist_core::ids::FactId;
use archivist_core::recall::{self, ScopedVectorIndex};
use archivist_core::resolver::{Extraction, ExtractionFact, ExtractionObject, Resolver};
use archivist_core::store_manager::{ReadScope, StoreManager};
use archivist_core::vector::VectorIndex;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{error, info};

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_TEXT_BYTES: usize = 32 * 1024; // 32 KiB
const MAX_QUERY_BYTES: usize = 8 * 1024; // 8 KiB
const MAX_RECALL_LIMIT: usize = 200;
const EMBEDDING_DIM: usize = 64;

/// Deterministic, dependency-free placeholder for a real embedding model:
/// byte-hashes the text into a fixed-length vector. A production deployment
/// swaps this for a call into whatever model the operator configures;
/// nothing downstream of `EmbeddingGenerator` knows the difference.
struct HashEmbedder;

impl EmbeddingGenerator for HashEmbedder {
    fn generate(&self, text: &str) -> archivist_core::Result<Vec<f32>> {
        let mut vec = vec![0.0f32; EMBEDDING_DIM];
        for (i, byte) in text.bytes().enumerate() {
            vec[i % EMBEDDING_DIM] += byte as f32;
        }
        Ok(vec)
    }

    fn dim(&self) -> usize {
        EMBEDDING_DIM
    }
}

struct AppState {
    manager: StoreManager,
    config: Config,
    embedder: HashEmbedder,
}

impl AppState {
    fn open() -> Result<Self> {
        let global = env::var("ARCHIVIST_GLOBAL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Config::global_config_dir().join("global.redb"));
        let project = env::var("ARCHIVIST_PROJECT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.archivist/project.redb"));
        let paths = FixedPaths { global, project };
        let config = Config::default();
        let manager = StoreManager::new(&paths, &config);
        Ok(Self { manager, config, embedder: HashEmbedder })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut state = AppState::open().context("failed to open archivist stores")?;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Malformed framing should not kill the server — return JSON-RPC
                // parse error (-32700) and continue reading the next message.
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&mut state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!("Content-Length {} exceeds max allowed {} bytes", len, MAX_MESSAGE_BYTES);
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &mut AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "archivist-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": { "tools": tools_schema() }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => {
                    error!(error = %err, "tool call failed");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": {
                            "content": [{ "type": "text", "text": format!("tool error: {err}") }],
                            "isError": true
                        }
                    })
                }
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": { "code": -32601, "message": format!("method not found: {method}") }
            })
        }),
    }
}

fn tools_schema() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "assert_fact",
            "description": "Assert a direct fact about an entity, resolved against existing facts on the same slot.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "subject": {"type": "string"},
                    "subject_type": {"type": "string"},
                    "predicate": {"type": "string"},
                    "object": {"type": "string"},
                    "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                    "quote": {"type": "string"},
                    "scope": {"type": "string", "enum": ["global", "project"]}
                },
                "required": ["subject", "subject_type", "predicate", "object"]
            }
        }),
        json!({
            "name": "query_index",
            "description": "Progressive-disclosure recall: cheap index hits (subject, predicate, object preview, token estimate) before paying for full facts.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_RECALL_LIMIT},
                    "scope": {"type": "string", "enum": ["global", "project", "all"]}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "recall",
            "description": "Full hybrid recall: lexical + vector search fused by Reciprocal Rank Fusion.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_RECALL_LIMIT},
                    "scope": {"type": "string", "enum": ["global", "project", "all"]}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "explain",
            "description": "Explain a fact: its receipts, what it supersedes, what superseded it, and its open conflicts.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "fact_id": {"type": "string"},
                    "scope": {"type": "string", "enum": ["global", "project"]}
                },
                "required": ["fact_id", "scope"]
            }
        }),
        json!({
            "name": "retract_fact",
            "description": "Retract a fact by id, preserving its history rather than deleting it.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "fact_id": {"type": "string"},
                    "scope": {"type": "string", "enum": ["global", "project"]}
                },
                "required": ["fact_id", "scope"]
            }
        }),
        json!({
            "name": "promote_fact",
            "description": "Copy a project-scoped fact (and its receipts) into the global store.",
            "inputSchema": {
                "type": "object",
                "properties": { "fact_id": {"type": "string"} },
                "required": ["fact_id"]
            }
        }),
    ]
}

fn call_tool(state: &mut AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params.and_then(|v| v.get("name")).and_then(JsonValue::as_str).context("missing tool name")?;
    let args = params.and_then(|v| v.get("arguments")).cloned().unwrap_or_else(|| json!({}));

    match name {
        "assert_fact" => assert_fact(state, &args),
        "query_index" => tool_query_index(state, &args),
        "recall" => tool_recall(state, &args),
        "explain" => tool_explain(state, &args),
        "retract_fact" => tool_retract_fact(state, &args),
        "promote_fact" => tool_promote_fact(state, &args),
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

fn parse_entity_type(s: &str) -> Result<EntityType> {
    Ok(match s {
        "database" => EntityType::Database,
        "framework" => EntityType::Framework,
        "language" => EntityType::Language,
        "platform" => EntityType::Platform,
        "repo" => EntityType::Repo,
        "module" => EntityType::Module,
        "person" => EntityType::Person,
        "service" => EntityType::Service,
        "other" => EntityType::Other,
        other => anyhow::bail!("unknown entity type: {other}"),
    })
}

fn parse_read_scope(s: Option<&str>) -> ReadScope {
    match s {
        Some("global") => ReadScope::Global,
        Some("project") => ReadScope::Project,
        _ => ReadScope::All,
    }
}

fn parse_scope(s: Option<&str>) -> Scope {
    match s {
        Some("global") => Scope::Global,
        _ => Scope::Project,
    }
}

fn assert_fact(state: &mut AppState, args: &JsonValue) -> Result<JsonValue> {
    let subject = args.get("subject").and_then(JsonValue::as_str).context("subject is required")?;
    let subject_type = parse_entity_type(
        args.get("subject_type").and_then(JsonValue::as_str).context("subject_type is required")?,
    )?;
    let predicate = args.get("predicate").and_then(JsonValue::as_str).context("predicate is required")?;
    let object = args.get("object").and_then(JsonValue::as_str).context("object is required")?;
    let confidence = args.get("confidence").and_then(JsonValue::as_f64).unwrap_or(0.8) as f32;
    let quote = args.get("quote").and_then(JsonValue::as_str).map(str::to_string);
    let scope = parse_scope(args.get("scope").and_then(JsonValue::as_str));

    let extraction = Extraction {
        facts: vec![ExtractionFact {
            subject: subject.to_string(),
            subject_type,
            predicate: predicate.to_string(),
            object: ExtractionObject::Literal { value: object.to_string(), datatype: Datatype::String },
            polarity: Polarity::Positive,
            confidence,
            quote,
            strength: Strength::Stated,
            scope_hint: Some(scope),
        }],
        occurred_at: Utc::now(),
        project_path: None,
        scope_hint: scope,
        ..Default::default()
    };

    let store = state.manager.store_for_scope(scope)?;
    let stats = Resolver::new(&state.config).apply(store, extraction)?;
    info!(facts_created = stats.facts_created, facts_superseded = stats.facts_superseded, "assert_fact applied");
    Ok(json!({
        "content": [{ "type": "text", "text": format!("{} fact(s) created, {} superseded, {} conflicts", stats.facts_created, stats.facts_superseded, stats.conflicts_created) }],
        "structuredContent": {
            "facts_created": stats.facts_created,
            "facts_superseded": stats.facts_superseded,
            "conflicts_created": stats.conflicts_created,
        }
    }))
}

fn tool_query_index(state: &mut AppState, args: &JsonValue) -> Result<JsonValue> {
    let query = args.get("query").and_then(JsonValue::as_str).context("query is required")?;
    if query.len() > MAX_QUERY_BYTES {
        anyhow::bail!("query exceeds max allowed size ({} bytes)", MAX_QUERY_BYTES);
    }
    let limit = args.get("limit").and_then(JsonValue::as_u64).unwrap_or(10) as usize;
    if limit > MAX_RECALL_LIMIT {
        anyhow::bail!("limit exceeds max allowed value ({MAX_RECALL_LIMIT})");
    }
    let scope = parse_read_scope(args.get("scope").and_then(JsonValue::as_str));
    let hits = recall::query_index(&mut state.manager, scope, query, limit)?;
    Ok(json!({
        "content": [{ "type": "text", "text": format!("found {} hit(s)", hits.len()) }],
        "structuredContent": { "hits": hits }
    }))
}

fn tool_recall(state: &mut AppState, args: &JsonValue) -> Result<JsonValue> {
    let query = args.get("query").and_then(JsonValue::as_str).context("query is required")?;
    if query.len() > MAX_QUERY_BYTES {
        anyhow::bail!("query exceeds max allowed size ({} bytes)", MAX_QUERY_BYTES);
    }
    let limit = args.get("limit").and_then(JsonValue::as_u64).unwrap_or(10) as usize;
    if limit > MAX_RECALL_LIMIT {
        anyhow::bail!("limit exceeds max allowed value ({MAX_RECALL_LIMIT})");
    }
    let scope = parse_read_scope(args.get("scope").and_then(JsonValue::as_str));

    // Rebuilt per call: this binary is a thin demonstration boundary, not
    // the long-lived tool-server process the store files are designed for,
    // so there is no resident index to keep warm across calls.
    let project_index = if matches!(scope, ReadScope::Project | ReadScope::All) {
        Some(VectorIndex::rebuild_from_store(state.manager.ensure_project()?)?)
    } else {
        None
    };
    let global_index = if matches!(scope, ReadScope::Global | ReadScope::All) {
        Some(VectorIndex::rebuild_from_store(state.manager.ensure_global()?)?)
    } else {
        None
    };
    let indexes = ScopedVectorIndex { project: project_index.as_ref(), global: global_index.as_ref() };

    let results = recall::query(&mut state.manager, &indexes, &state.embedder, scope, query, limit, &state.config)?;
    Ok(json!({
        "content": [{ "type": "text", "text": format!("found {} fact(s)", results.len()) }],
        "structuredContent": { "results": results }
    }))
}

fn tool_explain(state: &mut AppState, args: &JsonValue) -> Result<JsonValue> {
    let fact_id = args.get("fact_id").and_then(JsonValue::as_str).context("fact_id is required")?;
    let scope = parse_scope(args.get("scope").and_then(JsonValue::as_str));
    let explanation = recall::explain(&mut state.manager, &FactId::from(fact_id), scope)?;
    Ok(json!({
        "content": [{ "type": "text", "text": format!("status: {}", explanation.status) }],
        "structuredContent": explanation
    }))
}

fn tool_retract_fact(state: &mut AppState, args: &JsonValue) -> Result<JsonValue> {
    let fact_id = args.get("fact_id").and_then(JsonValue::as_str).context("fact_id is required")?;
    let scope = parse_scope(args.get("scope").and_then(JsonValue::as_str));
    let store = state.manager.store_for_scope(scope)?;
    let updated = archivist_core::facts::update_fact(
        store,
        &FactId::from(fact_id),
        FactUpdate {
            status: Some(archivist_core::facts::FactStatus::Retracted),
            valid_to: Some(Some(Utc::now())),
            ..Default::default()
        },
    )?;
    match updated {
        Some(fact) => Ok(json!({
            "content": [{ "type": "text", "text": format!("retracted fact {fact_id}") }],
            "structuredContent": { "fact": fact }
        })),
        None => Ok(json!({
            "content": [{ "type": "text", "text": format!("no such fact: {fact_id}") }],
            "structuredContent": { "status": "not_found" }
        })),
    }
}

fn tool_promote_fact(state: &mut AppState, args: &JsonValue) -> Result<JsonValue> {
    let fact_id = args.get("fact_id").and_then(JsonValue::as_str).context("fact_id is required")?;
    let promoted = state.manager.promote_fact(&FactId::from(fact_id))?;
    match promoted {
        Some(global_id) => Ok(json!({
            "content": [{ "type": "text", "text": format!("promoted {fact_id} -> {}", global_id.0) }],
            "structuredContent": { "global_fact_id": global_id.0 }
        })),
        None => Ok(json!({
            "content": [{ "type": "text", "text": format!("no such project fact: {fact_id}") }],
            "structuredContent": { "status": "not_found" }
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn temp_state(dir: &tempfile::TempDir) -> AppState {
        let paths = FixedPaths {
            global: dir.path().join("global.redb"),
            project: dir.path().join("project.redb"),
        };
        let config = Config::default();
        AppState { manager: StoreManager::new(&paths, &config), config, embedder: HashEmbedder }
    }

    #[test]
    fn assert_then_recall_finds_the_fact() {
        let dir = tempdir().unwrap();
        let mut state = temp_state(&dir);
        let _ = call_tool(
            &mut state,
            Some(&json!({
                "name": "assert_fact",
                "arguments": {
                    "subject": "MyApp", "subject_type": "repo", "predicate": "uses_database",
                    "object": "Postgres", "scope": "project"
                }
            })),
        )
        .unwrap();

        let out = call_tool(
            &mut state,
            Some(&json!({
                "name": "recall",
                "arguments": { "query": "postgres", "limit": 10, "scope": "project" }
            })),
        )
        .unwrap();
        let results = out.get("structuredContent").and_then(|v| v.get("results")).and_then(JsonValue::as_array).unwrap();
        assert!(!results.is_empty());
    }

    #[test]
    fn explain_on_unknown_fact_reports_not_found() {
        let dir = tempdir().unwrap();
        let mut state = temp_state(&dir);
        let out = call_tool(
            &mut state,
            Some(&json!({
                "name": "explain",
                "arguments": { "fact_id": "01UNKNOWNFACT0000000000000", "scope": "project" }
            })),
        )
        .unwrap();
        assert_eq!(out["structuredContent"]["status"], "not_found");
    }

    #[test]
    fn read_message_rejects_oversized_frame() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut cursor = Cursor::new(raw.into_bytes());
        let err = read_message(&mut cursor).expect_err("oversized frame must fail");
        assert!(err.to_string().contains("exceeds max allowed"));
    }

    #[test]
    fn recall_rejects_excessive_limit() {
        let dir = tempdir().unwrap();
        let mut state = temp_state(&dir);
        let err = call_tool(
            &mut state,
            Some(&json!({
                "name": "query_index",
                "arguments": { "query": "alice", "limit": MAX_RECALL_LIMIT + 1 }
            })),
        )
        .expect_err("excessive limit must fail");
        assert!(err.to_string().contains("limit exceeds max"));
    }

    #[test]
    fn promote_fact_tool_reports_not_found_for_unknown_id() {
        let dir = tempdir().unwrap();
        let mut state = temp_state(&dir);
        let out = call_tool(
            &mut state,
            Some(&json!({
                "name": "promote_fact",
                "arguments": { "fact_id": "01UNKNOWNFACT0000000000000" }
            })),
        )
        .unwrap();
        assert_eq!(out["structuredContent"]["status"], "not_found");
    }
}
