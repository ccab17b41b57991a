//! End-to-end tests of the commands that need no running group.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use std::fs;

use assert_cmd::Command;
use paxlog_storage::LogRecord;
use paxlog_types::{PeerId, Scn, Value, ValueId};
use predicates::prelude::*;
use tempfile::TempDir;

const TWO_NODES: &str = r#"
[node]
id = 1
listen = "127.0.0.1:7401"

[[peers]]
id = 0
address = "127.0.0.1:7400"

[[peers]]
id = 1
address = "127.0.0.1:7401"

[paxos]
pipeline_depth = 3
"#;

fn paxlog() -> Command {
    let mut cmd = Command::cargo_bin("paxlog").unwrap();
    cmd.arg("--no-color");
    cmd
}

// ============================================================================
// Help and version
// ============================================================================

#[test]
fn help_lists_commands() {
    paxlog()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("dump"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn version_flag_shows_name() {
    paxlog()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("paxlog"));
}

#[test]
fn dump_requires_path() {
    paxlog()
        .arg("dump")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

// ============================================================================
// config
// ============================================================================

#[test]
fn config_prints_merged_toml() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("paxlog.toml"), TWO_NODES).unwrap();

    paxlog()
        .args(["config", "--config-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("pipeline_depth = 3"))
        .stdout(predicate::str::contains("127.0.0.1:7400"));
}

#[test]
fn config_local_file_overrides_project_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("paxlog.toml"), TWO_NODES).unwrap();
    fs::write(
        dir.path().join("paxlog.local.toml"),
        "[paxos]\npipeline_depth = 5\n",
    )
    .unwrap();

    paxlog()
        .args(["config", "--format", "json", "--config-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pipeline_depth\": 5"));
}

#[test]
fn config_rejects_local_node_missing_from_peers() {
    let dir = TempDir::new().unwrap();
    let config = TWO_NODES.replace("id = 1\nlisten", "id = 7\nlisten");
    fs::write(dir.path().join("paxlog.toml"), config).unwrap();

    paxlog()
        .args(["config", "--config-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn config_rejects_unknown_format() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("paxlog.toml"), TWO_NODES).unwrap();

    paxlog()
        .args(["config", "--format", "yaml", "--config-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown format"));
}

// ============================================================================
// dump
// ============================================================================

#[test]
fn dump_prints_every_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("paxos.log");
    let id = ValueId::new(PeerId::new(0), 42);
    let records = [
        LogRecord::Decide {
            scn: Scn::new(1),
            value: Value::data(id, &b"first"[..]),
        },
        LogRecord::Decide {
            scn: Scn::new(2),
            value: Value::Nop,
        },
        LogRecord::Prune { scn: Scn::new(2) },
    ];
    let mut bytes = Vec::new();
    for record in &records {
        bytes.extend(record.to_bytes().unwrap());
    }
    fs::write(&path, bytes).unwrap();

    paxlog()
        .arg("dump")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("scn=1 kind=decide value=data["))
        .stdout(predicate::str::contains("scn=2 kind=decide value=nop"))
        .stdout(predicate::str::contains("scn=2 kind=prune"))
        .stdout(predicate::str::contains("decided: 2"));
}

#[test]
fn dump_of_missing_file_fails() {
    let dir = TempDir::new().unwrap();

    paxlog()
        .arg("dump")
        .arg(dir.path().join("absent.log"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read paxos log"));
}
