//! CLI Integration Tests
//!
//! These tests verify that the CLI commands work correctly end-to-end.
//! They test the actual binary behavior, not just the library.
//!
//! Run with:
//! ```bash
//! cargo test --test cli_integration
//! ```

use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

/// Run iavl command and return (stdout, stderr, success)
fn run_iavl(args: &[&str], db_path: &str) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_iavl"))
        .args(["-d", db_path, "-f", "json", "--config"])
        .arg(Path::new(db_path).with_extension("options.json"))
        .args(args)
        .output()
        .expect("Failed to execute iavl");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn parse(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| panic!("bad JSON {:?}: {}", stdout, e))
}

// ============================================================================
// Database Initialization Tests
// ============================================================================

#[test]
fn test_cli_init_creates_database() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db_str = db_path.to_str().unwrap();

    let (stdout, _stderr, success) = run_iavl(&["init"], db_str);

    assert!(success, "init should succeed");
    assert_eq!(parse(&stdout)["status"], "ok");
    assert!(db_path.exists(), "database file should be created");
}

#[test]
fn test_cli_default_path() {
    let output = Command::new(env!("CARGO_BIN_EXE_iavl"))
        .args(["--help"])
        .output()
        .expect("Failed to execute iavl");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("[default: state.iavl]"),
        "Default database path should be state.iavl, got: {}",
        stdout
    );
}

// ============================================================================
// Read/Write Tests
// ============================================================================

#[test]
fn test_cli_set_get_remove() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db = db_path.to_str().unwrap();

    let (stdout, stderr, success) = run_iavl(&["set", "alice=100", "bob=50"], db);
    assert!(success, "set failed: {}", stderr);
    let out = parse(&stdout);
    assert_eq!(out["version"], 1);
    assert_eq!(out["inserted"], 2);

    let (stdout, _, success) = run_iavl(&["get", "alice"], db);
    assert!(success);
    assert_eq!(parse(&stdout)["value"], "100");

    let (stdout, _, success) = run_iavl(&["remove", "bob"], db);
    assert!(success);
    assert_eq!(parse(&stdout)["version"], 2);

    let (_, _, success) = run_iavl(&["get", "bob"], db);
    assert!(!success, "removed key should not be found");

    let (stdout, _, success) = run_iavl(&["get", "bob", "--version", "1"], db);
    assert!(success);
    assert_eq!(parse(&stdout)["value"], "50");
}

#[test]
fn test_cli_hex_keys() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db = db_path.to_str().unwrap();

    let (_, stderr, success) = run_iavl(&["--hex", "set", "00ff=beef"], db);
    assert!(success, "set failed: {}", stderr);
    let (stdout, _, success) = run_iavl(&["--hex", "get", "00ff"], db);
    assert!(success);
    assert_eq!(parse(&stdout)["value"], "beef");

    let (_, _, success) = run_iavl(&["--hex", "set", "zz=00"], db);
    assert!(!success, "invalid hex should be rejected");
}

#[test]
fn test_cli_range() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db = db_path.to_str().unwrap();

    run_iavl(&["set", "a=1", "b=2", "c=3", "d=4"], db);
    let (stdout, _, success) = run_iavl(&["range", "--start", "b", "--end", "d"], db);
    assert!(success);
    let out = parse(&stdout);
    assert_eq!(out["count"], 2);
    assert_eq!(out["entries"][0]["key"], "b");

    let (stdout, _, _) = run_iavl(&["range", "--descending", "--limit", "1"], db);
    assert_eq!(parse(&stdout)["entries"][0]["key"], "d");
}

// ============================================================================
// Proof Tests
// ============================================================================

#[test]
fn test_cli_proof_and_verify() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db = db_path.to_str().unwrap();

    run_iavl(&["set", "a=1", "b=2", "c=3"], db);

    let (stdout, _, success) = run_iavl(&["proof", "b"], db);
    assert!(success);
    let out = parse(&stdout);
    assert_eq!(out["exists"], true);
    let root = out["root"].as_str().unwrap().to_string();
    let proof_path = dir.path().join("proof.json");
    std::fs::write(&proof_path, &stdout).unwrap();

    let (stdout, _, success) = run_iavl(
        &["verify", "b", "--root", &root, "--proof", proof_path.to_str().unwrap()],
        db,
    );
    assert!(success);
    assert_eq!(parse(&stdout)["valid"], true);

    // same proof, different key
    let (stdout, _, success) = run_iavl(
        &["verify", "c", "--root", &root, "--proof", proof_path.to_str().unwrap()],
        db,
    );
    assert!(!success);
    assert_eq!(parse(&stdout)["valid"], false);

    let (stdout, _, _) = run_iavl(&["proof", "bb"], db);
    let out = parse(&stdout);
    assert_eq!(out["exists"], false);
    std::fs::write(&proof_path, &stdout).unwrap();
    let (_, _, success) = run_iavl(
        &["verify", "bb", "--root", &root, "--proof", proof_path.to_str().unwrap()],
        db,
    );
    assert!(success, "absence proof should verify");
}

// ============================================================================
// Version Tests
// ============================================================================

#[test]
fn test_cli_versions_and_prune() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db = db_path.to_str().unwrap();

    for i in 0..4 {
        let pair = format!("k={}", i);
        run_iavl(&["set", &pair], db);
    }
    let (stdout, _, _) = run_iavl(&["versions"], db);
    assert_eq!(parse(&stdout)["versions"], serde_json::json!([1, 2, 3, 4]));

    let (_, _, success) = run_iavl(&["prune", "4"], db);
    assert!(!success, "latest version cannot be pruned");

    let (stdout, stderr, success) = run_iavl(&["prune", "--to", "2"], db);
    assert!(success, "prune failed: {}", stderr);
    assert_eq!(parse(&stdout)["versions"], serde_json::json!([3, 4]));

    let (stdout, _, success) = run_iavl(&["get", "k", "--version", "3"], db);
    assert!(success);
    assert_eq!(parse(&stdout)["value"], "2");
}

#[test]
fn test_cli_rewind() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db = db_path.to_str().unwrap();

    run_iavl(&["set", "a=1"], db);
    run_iavl(&["set", "b=2"], db);
    run_iavl(&["set", "c=3"], db);

    let (stdout, _, success) = run_iavl(&["rewind", "1"], db);
    assert!(success);
    assert_eq!(parse(&stdout)["version"], 1);

    let (stdout, _, _) = run_iavl(&["set", "d=4"], db);
    assert_eq!(parse(&stdout)["version"], 2);
    let (_, _, success) = run_iavl(&["get", "b"], db);
    assert!(!success);
}

#[test]
fn test_cli_info_and_dump() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db = db_path.to_str().unwrap();

    run_iavl(&["set", "a=1", "b=2", "c=3"], db);
    let (stdout, _, success) = run_iavl(&["info"], db);
    assert!(success);
    let out = parse(&stdout);
    assert_eq!(out["version"], 1);
    assert_eq!(out["size"], 3);
    assert_eq!(out["nodes"], 5);

    let (stdout, _, success) = run_iavl(&["dump"], db);
    assert!(success);
    assert_eq!(parse(&stdout)["tree"].as_array().unwrap().len(), 5);
}

#[test]
fn test_cli_export_import() {
    let dir = tempdir().unwrap();
    let src_path = dir.path().join("src.iavl");
    let dst_path = dir.path().join("dst.iavl");
    let src = src_path.to_str().unwrap();
    let dst = dst_path.to_str().unwrap();
    let export = dir.path().join("export.jsonl");

    run_iavl(&["set", "a=1", "b=2", "c=3"], src);
    run_iavl(&["set", "d=4"], src);
    let (stdout, _, _) = run_iavl(&["info"], src);
    let src_hash = parse(&stdout)["hash"].clone();

    let (_, stderr, success) = run_iavl(&["export", export.to_str().unwrap()], src);
    assert!(success, "export failed: {}", stderr);
    let (stdout, stderr, success) = run_iavl(
        &["import", export.to_str().unwrap(), "--version", "2"],
        dst,
    );
    assert!(success, "import failed: {}", stderr);
    assert_eq!(parse(&stdout)["hash"], src_hash);
}

#[test]
fn test_cli_compact_keeps_data() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("state.iavl");
    let db = db_path.to_str().unwrap();

    for i in 0..5 {
        let pair = format!("k={}", i);
        run_iavl(&["set", &pair], db);
    }
    run_iavl(&["prune", "--to", "4"], db);
    let (stdout, _, success) = run_iavl(&["compact"], db);
    assert!(success);
    let out = parse(&stdout);
    assert!(out["bytes_after"].as_u64().unwrap() <= out["bytes_before"].as_u64().unwrap());

    let (stdout, _, _) = run_iavl(&["get", "k"], db);
    assert_eq!(parse(&stdout)["value"], "4");
}
