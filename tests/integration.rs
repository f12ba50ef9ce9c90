use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn csync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("csync");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    // Two collections under the collection root
    let docs = root.join("collections").join("docs");
    fs::create_dir_all(docs.join("guide")).unwrap();
    fs::write(
        docs.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt covers cargo and crates.",
    )
    .unwrap();
    fs::write(
        docs.join("guide").join("deploy.txt"),
        "Deployment notes.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(docs.join("ignored.bin"), "not a text file").unwrap();

    let notes = root.join("collections").join("notes");
    fs::create_dir_all(&notes).unwrap();
    fs::write(
        notes.join("python.md"),
        "# Python\n\nMachine learning with PyTorch.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/meta.sqlite"

[index]
backend = "sqlite"
path = "{root}/data/vectors.sqlite"

[collections]
root = "{root}/collections"
include_globs = ["**/*.md", "**/*.txt"]

[chunking]
max_tokens = 128

[embedding]
provider = "hash"
dims = 64

[search]
score_threshold = -1.0
"#,
        root = root.display()
    );

    let config_path = config_dir.join("csync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_csync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = csync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run csync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("invalid JSON ({}): {}", e, stdout))
}

#[test]
fn test_init() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_csync(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("ok"));

    // Idempotent
    let (_, stderr, ok) = run_csync(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_sync_then_status() {
    let (_tmp, config) = setup_test_env();
    run_csync(&config, &["init"]);

    let (stdout, stderr, ok) = run_csync(&config, &["sync", "docs", "--json", "--progress", "off"]);
    assert!(ok, "sync failed: {}", stderr);
    let value = json(&stdout);
    assert_eq!(value["outcome"]["status"], "completed");
    assert_eq!(value["outcome"]["files_processed"], 2);
    assert_eq!(value["status"]["file_count"], 2);

    let (stdout, stderr, ok) = run_csync(&config, &["status", "docs", "--json"]);
    assert!(ok, "status failed: {}", stderr);
    let status = json(&stdout);
    assert_eq!(status["status"], "completed");
    assert_eq!(status["changed_files_count"], 0);
    assert_eq!(status["vector_count"], status["indexed_vectors"]);

    // Nothing changed: nothing processed
    let (stdout, _, ok) = run_csync(&config, &["sync", "docs", "--json", "--progress", "off"]);
    assert!(ok);
    assert_eq!(json(&stdout)["outcome"]["files_processed"], 0);
}

#[test]
fn test_sync_picks_up_edits_and_deletions() {
    let (tmp, config) = setup_test_env();
    run_csync(&config, &["init"]);
    run_csync(&config, &["sync", "docs", "--progress", "off"]);

    let docs = tmp.path().join("collections").join("docs");
    fs::write(docs.join("alpha.md"), "# Alpha\n\nRewritten entirely.").unwrap();
    fs::remove_file(docs.join("guide").join("deploy.txt")).unwrap();

    let (stdout, stderr, ok) = run_csync(&config, &["sync", "docs", "--json", "--progress", "off"]);
    assert!(ok, "sync failed: {}", stderr);
    let value = json(&stdout);
    assert_eq!(value["outcome"]["files_processed"], 2);
    assert_eq!(value["status"]["file_count"], 1);

    let (stdout, _, ok) = run_csync(&config, &["drift", "docs", "--json"]);
    assert!(ok);
    let kinds: Vec<String> = json(&stdout)
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap().to_string())
        .collect();
    assert!(kinds.contains(&"modified".to_string()));
    assert!(kinds.contains(&"deleted".to_string()));
}

#[test]
fn test_json_progress_goes_to_stderr() {
    let (_tmp, config) = setup_test_env();
    run_csync(&config, &["init"]);

    let (_, stderr, ok) = run_csync(&config, &["sync", "notes", "--progress", "json"]);
    assert!(ok, "sync failed: {}", stderr);
    let events: Vec<serde_json::Value> = stderr
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .filter(|v: &serde_json::Value| v.get("event").is_some())
        .collect();
    assert_eq!(events.first().unwrap()["event"], "started");
    assert_eq!(events.last().unwrap()["event"], "finished");
}

#[test]
fn test_search_scoped_to_collection() {
    let (_tmp, config) = setup_test_env();
    run_csync(&config, &["init"]);
    run_csync(&config, &["sync", "docs", "--progress", "off"]);
    run_csync(&config, &["sync", "notes", "--progress", "off"]);

    let (stdout, stderr, ok) = run_csync(
        &config,
        &["search", "kubernetes docker", "--collection", "docs", "--json"],
    );
    assert!(ok, "search failed: {}", stderr);
    let hits = json(&stdout);
    let hits = hits.as_array().unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0]["file_path"], "guide/deploy.txt");
    assert!(hits.iter().all(|h| h["collection_name"] == "docs"));
    assert!(hits.iter().all(|h| h["collection_status"] == "completed"));

    let (_, _, ok) = run_csync(&config, &["search", "anything", "--collection", "missing"]);
    assert!(!ok);
}

#[test]
fn test_collections_listing() {
    let (_tmp, config) = setup_test_env();
    run_csync(&config, &["init"]);
    run_csync(&config, &["sync", "docs", "--progress", "off"]);

    let (stdout, stderr, ok) = run_csync(&config, &["collections", "--json"]);
    assert!(ok, "collections failed: {}", stderr);
    let list = json(&stdout);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 2);
    let docs = list.iter().find(|c| c["name"] == "docs").unwrap();
    assert_eq!(docs["status"]["status"], "completed");
    let notes = list.iter().find(|c| c["name"] == "notes").unwrap();
    assert_eq!(notes["status"]["status"], "never_synced");
}

#[test]
fn test_delete_vectors_and_forget() {
    let (_tmp, config) = setup_test_env();
    run_csync(&config, &["init"]);
    run_csync(&config, &["sync", "docs", "--progress", "off"]);

    let (stdout, stderr, ok) = run_csync(&config, &["delete-vectors", "docs"]);
    assert!(ok, "delete-vectors failed: {}", stderr);
    assert!(stdout.contains("deleted"));

    let (stdout, _, _) = run_csync(&config, &["status", "docs", "--json"]);
    let status = json(&stdout);
    assert_eq!(status["status"], "never_synced");
    assert_eq!(status["indexed_vectors"], 0);

    run_csync(&config, &["sync", "docs", "--progress", "off"]);
    let (stdout, stderr, ok) = run_csync(&config, &["forget", "docs"]);
    assert!(ok, "forget failed: {}", stderr);
    assert!(stdout.contains("forgot docs"));

    let (stdout, _, _) = run_csync(&config, &["forget", "docs"]);
    assert!(stdout.contains("nothing stored"));
}

#[test]
fn test_unknown_collection_fails() {
    let (_tmp, config) = setup_test_env();
    run_csync(&config, &["init"]);
    let (_, stderr, ok) = run_csync(&config, &["sync", "nope", "--progress", "off"]);
    assert!(!ok);
    assert!(stderr.contains("nope"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, _, ok) = run_csync(&tmp.path().join("absent.toml"), &["collections"]);
    assert!(!ok);
}
