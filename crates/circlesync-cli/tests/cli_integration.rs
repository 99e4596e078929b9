//! CLI Integration Tests
//!
//! These tests drive the `circlesync` binary against a temporary data
//! directory. Only offline commands are exercised.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("circlesync").expect("Failed to find circlesync binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// First "  ID: <value>" line of the output
fn extract_id(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("  ID: "))
        .map(|id| id.trim().to_string())
}

fn run(data_dir: &TempDir, args: &[&str]) -> String {
    let output = cli_cmd(data_dir).args(args).output().unwrap();
    assert!(
        output.status.success(),
        "command {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

fn onboarded(name: &str) -> TempDir {
    let data_dir = TempDir::new().unwrap();
    run(&data_dir, &["identity", "set-name", name]);
    data_dir
}

// ============================================================================
// Info / Identity
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("CircleSync"))
        .stdout(predicate::str::contains("Name: (not set)"))
        .stdout(predicate::str::contains("Manifest version: 0"));
}

#[test]
fn test_node_id_is_stable_across_runs() {
    let data_dir = TempDir::new().unwrap();

    let first = extract_id(&run(&data_dir, &["info"])).unwrap();
    let second = extract_id(&run(&data_dir, &["info"])).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 64);
}

#[test]
fn test_set_name_shows_in_info() {
    let data_dir = onboarded("alice");

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Name: alice"))
        .stdout(predicate::str::contains("Circles: 1"));
}

// ============================================================================
// Circles
// ============================================================================

#[test]
fn test_circle_create_requires_identity() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["circle", "create", "friends"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No identity yet"));
}

#[test]
fn test_circle_create_and_list() {
    let data_dir = onboarded("alice");

    let output = run(&data_dir, &["circle", "create", "friends"]);
    assert!(output.contains("Created circle:"));
    assert!(extract_id(&output).is_some());

    cli_cmd(&data_dir)
        .args(["circle", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Circles (2):"))
        .stdout(predicate::str::contains("Everyone (everyone)"))
        .stdout(predicate::str::contains("friends"));
}

// ============================================================================
// Posts
// ============================================================================

#[test]
fn test_post_create_and_list() {
    let data_dir = onboarded("alice");
    let circle = extract_id(&run(&data_dir, &["circle", "create", "friends"])).unwrap();

    let output = run(&data_dir, &["post", "create", &circle, "hello friends"]);
    assert!(output.contains("Created post:"));
    assert!(output.contains("Files: 0"));

    cli_cmd(&data_dir)
        .args(["post", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Posts (1):"))
        .stdout(predicate::str::contains("alice: hello friends"))
        .stdout(predicate::str::contains("(unpublished)"));
}

#[test]
fn test_post_with_attachment() {
    let data_dir = onboarded("alice");
    let circle = extract_id(&run(&data_dir, &["circle", "create", "friends"])).unwrap();

    let file = data_dir.path().join("note.txt");
    std::fs::write(&file, b"attached").unwrap();

    cli_cmd(&data_dir)
        .args(["post", "create", &circle, "with file", "--file"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("Files: 1"));
}

#[test]
fn test_post_into_unknown_circle_fails() {
    let data_dir = onboarded("alice");

    cli_cmd(&data_dir)
        .args(["post", "create", "999", "nowhere"])
        .assert()
        .failure();
}

#[test]
fn test_publish_seals_pending_posts() {
    let data_dir = onboarded("alice");
    let circle = extract_id(&run(&data_dir, &["circle", "create", "friends"])).unwrap();
    run(&data_dir, &["post", "create", &circle, "sealed soon"]);

    cli_cmd(&data_dir)
        .arg("publish")
        .assert()
        .success()
        .stdout(predicate::str::contains("Version: 1"));

    let listing = run(&data_dir, &["post", "list"]);
    assert!(listing.contains("sealed soon"));
    assert!(!listing.contains("(unpublished)"));

    cli_cmd(&data_dir)
        .arg("publish")
        .assert()
        .success()
        .stdout(predicate::str::contains("Version: 2"));
}

// ============================================================================
// Peers
// ============================================================================

#[test]
fn test_peer_introduce_and_list() {
    let alice = onboarded("alice");
    let bob = TempDir::new().unwrap();
    let bob_id = extract_id(&run(&bob, &["info"])).unwrap();

    cli_cmd(&alice)
        .args(["peer", "introduce", &bob_id, "--addr", "127.0.0.1:4433"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Introduced peer:"))
        .stdout(predicate::str::contains(bob_id.as_str()));

    cli_cmd(&alice)
        .args(["peer", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Peers (1):"))
        .stdout(predicate::str::contains("never synced"));

    // The introduced peer joins "everyone"
    cli_cmd(&alice)
        .args(["circle", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Everyone (everyone) - 1 members"));
}

#[test]
fn test_peer_introduce_rejects_bad_node_id() {
    let data_dir = onboarded("alice");

    cli_cmd(&data_dir)
        .args(["peer", "introduce", "not-hex"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid node ID"));
}

#[test]
fn test_peer_introduce_self_fails() {
    let data_dir = onboarded("alice");
    let me = extract_id(&run(&data_dir, &["info"])).unwrap();

    cli_cmd(&data_dir)
        .args(["peer", "introduce", &me])
        .assert()
        .failure();
}
