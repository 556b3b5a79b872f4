#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn lillia() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("lillia"))
}

#[test]
fn port_prints_a_free_port() {
    lillia()
        .args(["port", "--start", "40000", "--attempts", "50"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^4\d{4}\n$").unwrap());
}

#[test]
fn check_accepts_valid_config() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = temp.path().join("lillia.yaml");
    fs::write(
        &config_path,
        r#"version: "1"
control_plane:
  path: "bin/pmhq"
  headless: true
bot_runtime:
  node_path: "node"
  script_path: "bot/index.js"
supervisor:
  graceful_stop_ms: 2000
"#,
    )
    .expect("failed to write config");

    lillia()
        .args(["check", "--config", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("bridge"))
        .stdout(predicate::str::contains("bot-runtime"));
}

#[test]
fn check_rejects_missing_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let missing = temp.path().join("absent.yaml");

    lillia()
        .args(["check", "--config", missing.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.yaml"));
}

#[test]
fn check_rejects_empty_control_plane_path() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = temp.path().join("lillia.yaml");
    fs::write(
        &config_path,
        "version: \"1\"\ncontrol_plane:\n  path: \"\"\n",
    )
    .expect("failed to write config");

    lillia()
        .args(["check", "--config", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("control_plane.path"));
}

#[cfg(unix)]
#[test]
fn run_fails_when_control_plane_exits_at_startup() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = temp.path().join("lillia.yaml");
    fs::write(
        &config_path,
        "version: \"1\"\ncontrol_plane:\n  path: \"/bin/false\"\n  base_port: 41000\n",
    )
    .expect("failed to write config");

    lillia()
        .args(["run", "--no-bot", "--config", config_path.to_str().unwrap()])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to start"));
}

#[test]
fn invalid_log_level_is_rejected() {
    lillia()
        .args(["--log-level", "loud", "port"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid log level"));
}
