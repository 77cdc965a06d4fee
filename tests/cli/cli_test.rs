//! Admin CLI against a temporary SQLite store.

use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;

use crate::common::REGISTRY_TOML;

const SECRET: &str = "cli-test-secret-0123456789abcdefghij";

fn leasegate(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("leasegate").expect("binary builds");
    cmd.current_dir(dir)
        .env_remove("RUST_LOG")
        .env("LEASEGATE_CONFIG_PATH", dir.join("absent.toml"))
        .env("LEASEGATE_SQLITE_PATH", dir.join("state.db"))
        .env("LEASEGATE_AUDIT_LOG", dir.join("audit.jsonl"))
        .env("LEASEGATE_HMAC_SECRET", SECRET)
        .env("LEASEGATE_LOG_LEVEL", "warn");
    cmd
}

fn json_out(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("stdout is JSON")
}

#[test]
fn mode_persists_between_invocations() {
    let dir = tempfile::tempdir().expect("tempdir");

    let initial = json_out(leasegate(dir.path()).args(["mode", "get"]));
    assert_eq!(initial["mode"], "permission");

    json_out(leasegate(dir.path()).args(["mode", "set", "read-only"]));
    let after = json_out(leasegate(dir.path()).args(["mode", "get"]));
    assert_eq!(after["mode"], "read_only");

    let audit = std::fs::read_to_string(dir.path().join("audit.jsonl")).expect("audit");
    assert!(audit.contains("mode_changed"));
}

#[test]
fn unknown_mode_is_rejected_by_the_parser() {
    let dir = tempfile::tempdir().expect("tempdir");
    leasegate(dir.path())
        .args(["mode", "set", "chaos"])
        .assert()
        .failure();
}

#[test]
fn lease_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");

    let lease = json_out(leasegate(dir.path()).args([
        "lease", "grant", "A", "read_file", "--ttl", "60", "--calls", "2",
    ]));
    assert_eq!(lease["calls_remaining"], 2);
    assert_eq!(lease["mode_at_issue"], "permission");
    assert!(lease["capability_token"].is_string());

    let shown = json_out(leasegate(dir.path()).args(["lease", "show", "A", "read_file"]));
    assert_eq!(shown["client_id"], "A");

    for _ in 0..2 {
        json_out(leasegate(dir.path()).args(["lease", "revoke", "A", "read_file"]));
    }
    let gone = json_out(leasegate(dir.path()).args(["lease", "show", "A", "read_file"]));
    assert!(gone.is_null());

    let audit = std::fs::read_to_string(dir.path().join("audit.jsonl")).expect("audit");
    let events: Vec<Value> = audit
        .lines()
        .map(|line| serde_json::from_str(line).expect("audit line is JSON"))
        .collect();
    let granted: Vec<&Value> = events
        .iter()
        .filter(|e| e["event_type"] == "lease_granted")
        .collect();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0]["fields"]["client_id"], "A");
    let revoked: Vec<&Value> = events
        .iter()
        .filter(|e| e["event_type"] == "lease_revoked")
        .collect();
    assert_eq!(revoked.len(), 2);
    assert_eq!(revoked[0]["fields"]["existed"], true);
    assert_eq!(revoked[1]["fields"]["existed"], false);
}

#[test]
fn zero_call_lease_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    leasegate(dir.path())
        .args(["lease", "grant", "A", "X", "--ttl", "60", "--calls", "0"])
        .assert()
        .failure();
}

#[test]
fn token_issue_and_verify() {
    let dir = tempfile::tempdir().expect("tempdir");
    let issued = json_out(leasegate(dir.path()).args([
        "token", "issue", "A", "write_file", "--ttl", "60", "--context", "/tmp/a",
    ]));
    let token = issued["token"].as_str().expect("token").to_owned();

    let ok = json_out(leasegate(dir.path()).args([
        "token", "verify", &token, "--client", "A", "--tool", "write_file", "--context", "/tmp/a",
    ]));
    assert_eq!(ok["valid"], true);
    assert_eq!(ok["payload"]["context_key"], "/tmp/a");

    let output = leasegate(dir.path())
        .args(["token", "verify", &token, "--client", "B", "--tool", "write_file"])
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let rejected: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(rejected["valid"], false);
    assert_eq!(rejected["category"], "token_binding_mismatch");
    assert!(!String::from_utf8_lossy(&output).contains(SECRET));
}

#[test]
fn token_from_another_secret_is_tampered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let issued = json_out(leasegate(dir.path()).args(["token", "issue", "A", "X", "--ttl", "60"]));
    let token = issued["token"].as_str().expect("token").to_owned();

    let output = leasegate(dir.path())
        .env("LEASEGATE_HMAC_SECRET", "some-other-secret-0123456789abcdef")
        .args(["token", "verify", &token, "--client", "A", "--tool", "X"])
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let rejected: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(rejected["category"], "token_tampered");
}

#[test]
fn elevations_and_purge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let revoked = json_out(leasegate(dir.path()).args(["elevations", "revoke-all"]));
    assert_eq!(revoked["revoked"], 0);
    let purged = json_out(leasegate(dir.path()).arg("purge"));
    assert!(purged["purged"].is_u64());
}

#[test]
fn tools_search_never_prints_schemas() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = dir.path().join("tools.toml");
    std::fs::write(&registry, REGISTRY_TOML).expect("write registry");

    let found = json_out(
        leasegate(dir.path())
            .env("LEASEGATE_REGISTRY_PATH", &registry)
            .args(["tools", "search", "write"]),
    );
    let names: Vec<&str> = found
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, vec!["write_file"]);
    assert!(!found.to_string().contains("SECRET-SCHEMA-MARKER"));
}

#[test]
fn production_refuses_the_development_secret() {
    let dir = tempfile::tempdir().expect("tempdir");
    leasegate(dir.path())
        .env_remove("LEASEGATE_HMAC_SECRET")
        .args(["--production", "mode", "get"])
        .assert()
        .failure();
}
