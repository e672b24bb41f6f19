use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use tempfile::tempdir;

fn write_mcp_message(stdin: &mut impl Write, payload: &Value) {
    let body = serde_json::to_vec(payload).unwrap();
    write!(stdin, "Content-Length: {}\r\n\r\n", body.len()).unwrap();
    stdin.write_all(&body).unwrap();
    stdin.flush().unwrap();
}

fn read_mcp_message(stdout: &mut impl BufRead) -> Value {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = stdout.read_line(&mut line).unwrap();
        assert!(n > 0, "unexpected EOF");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.trim().parse::<usize>().unwrap());
            }
        }
    }
    let len = content_length.expect("missing Content-Length");
    let mut buf = vec![0_u8; len];
    stdout.read_exact(&mut buf).unwrap();
    serde_json::from_slice(&buf).unwrap()
}

#[test]
fn stdio_server_assert_then_recall() {
    let dir = tempdir().unwrap();
    let bin = env!("CARGO_BIN_EXE_archivist-mcp");
    let mut child = Command::new(bin)
        .env("ARCHIVIST_GLOBAL_DB_PATH", dir.path().join("global.redb"))
        .env("ARCHIVIST_PROJECT_DB_PATH", dir.path().join("project.redb"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {}
        }),
    );
    let init = read_mcp_message(&mut stdout);
    assert_eq!(init["id"], 1);
    assert_eq!(init["result"]["serverInfo"]["name"], "archivist-mcp");

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {
                "name": "assert_fact",
                "arguments": {
                    "subject": "MyApp",
                    "subject_type": "repo",
                    "predicate": "uses_database",
                    "object": "Postgres",
                    "scope": "project"
                }
            }
        }),
    );
    let asserted = read_mcp_message(&mut stdout);
    assert_eq!(asserted["id"], 2);
    assert_eq!(asserted["result"]["structuredContent"]["facts_created"], 1);

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": "recall",
                "arguments": { "query": "postgres", "limit": 10, "scope": "project" }
            }
        }),
    );
    let recall = read_mcp_message(&mut stdout);
    assert_eq!(recall["id"], 3);
    let results = recall["result"]["structuredContent"]["results"].as_array().unwrap();
    assert!(!results.is_empty());

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {
                "name": "query_index",
                "arguments": { "query": "postgres", "limit": 10, "scope": "project" }
            }
        }),
    );
    let indexed = read_mcp_message(&mut stdout);
    assert_eq!(indexed["id"], 4);
    assert!(indexed["result"]["structuredContent"]["hits"].is_array());

    drop(stdin);
    let _ = child.wait();
}
