//! CLI integration tests for routewise
//!
//! Tests the routewise CLI commands end-to-end using assert_cmd. Every test
//! points the config directory (and with it the database) at a fresh temp dir.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command isolated to `dir`
#[allow(deprecated)]
fn routewise_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("routewise").unwrap();
    cmd.current_dir(dir.path());
    cmd.env("ROUTEWISE_CONFIG_DIR", dir.path());
    cmd.env_remove("RUST_LOG");
    cmd
}

fn report(dir: &TempDir, candidate: &str, failed: bool) {
    let mut args = vec![
        "report",
        "--tenant",
        "acme",
        "--feature",
        "chat",
        "--purpose",
        "answer",
        "--candidate",
        candidate,
        "--latency-ms",
        "250",
        "--cost-per-1k",
        "0.002",
        "--quality",
        "85",
        "--cost-usd",
        "0.01",
    ];
    if failed {
        args.push("--failed");
    }
    routewise_cmd(dir).args(&args).assert().success();
}

#[test]
fn test_init_creates_config_and_database() {
    let dir = TempDir::new().unwrap();

    routewise_cmd(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("routewise.db"));

    assert!(dir.path().join("config.toml").exists());
    assert!(dir.path().join("routewise.db").exists());
}

#[test]
fn test_config_path_uses_env_override() {
    let dir = TempDir::new().unwrap();
    routewise_cmd(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"))
        .stdout(predicate::str::contains(
            dir.path().to_string_lossy().to_string(),
        ));
}

#[test]
fn test_config_set_and_get() {
    let dir = TempDir::new().unwrap();

    routewise_cmd(&dir)
        .args(["config", "set", "routing.default_strategy", "thompson"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set routing.default_strategy"));

    routewise_cmd(&dir)
        .args(["config", "get", "routing.default_strategy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("thompson"));

    routewise_cmd(&dir)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("guard.diversity_threshold_pct"));
}

#[test]
fn test_config_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();

    routewise_cmd(&dir)
        .args(["config", "set", "routing.default_strategy", "random"])
        .assert()
        .failure();

    routewise_cmd(&dir)
        .args(["config", "set", "weights.balanced", "1, 2, 3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("five comma-separated weights"));

    routewise_cmd(&dir)
        .args(["config", "get", "no.such.key"])
        .assert()
        .failure();
}

#[test]
fn test_config_reset() {
    let dir = TempDir::new().unwrap();
    routewise_cmd(&dir)
        .args(["config", "set", "sla.default_penalty_minutes", "30"])
        .assert()
        .success();
    routewise_cmd(&dir)
        .args(["config", "reset"])
        .assert()
        .success();
    routewise_cmd(&dir)
        .args(["config", "get", "sla.default_penalty_minutes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("10"));
}

#[test]
fn test_rank_outputs_json() {
    let dir = TempDir::new().unwrap();

    routewise_cmd(&dir)
        .args([
            "--format",
            "json",
            "rank",
            "-t",
            "acme",
            "-f",
            "chat",
            "-p",
            "answer",
            "-c",
            "openai:gpt-4o",
            "-c",
            "anthropic:claude-sonnet",
            "--strategy",
            "cost_aware",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"strategy\": \"cost_aware\""))
        .stdout(predicate::str::contains("\"ranked\""))
        .stdout(predicate::str::contains("claude-sonnet"));
}

#[test]
fn test_quiet_rank_prints_only_selection() {
    let dir = TempDir::new().unwrap();

    routewise_cmd(&dir)
        .args([
            "--quiet", "rank", "-t", "acme", "-f", "chat", "-p", "answer", "-c", "openai:gpt-4o",
        ])
        .assert()
        .success()
        .stdout(predicate::eq("openai/gpt-4o\n"));
}

#[test]
fn test_rank_requires_candidates() {
    let dir = TempDir::new().unwrap();
    routewise_cmd(&dir)
        .args(["rank", "-t", "acme", "-f", "chat", "-p", "answer"])
        .assert()
        .failure();

    routewise_cmd(&dir)
        .args(["rank", "-t", "acme", "-f", "chat", "-p", "answer", "-c", "openai"])
        .assert()
        .failure();
}

#[test]
fn test_report_rejects_negative_latency() {
    let dir = TempDir::new().unwrap();
    routewise_cmd(&dir)
        .args([
            "report",
            "-t",
            "acme",
            "-f",
            "chat",
            "-p",
            "answer",
            "-c",
            "openai:gpt-4o",
            "--latency-ms=-5",
            "--cost-per-1k",
            "0.002",
            "--quality",
            "80",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("latency_ms"));
}

#[test]
fn test_report_then_aggregate_and_show_forecast() {
    let dir = TempDir::new().unwrap();
    report(&dir, "openai:gpt-4o", false);
    report(&dir, "openai:gpt-4o", true);
    report(&dir, "gemini:gemini-pro", false);

    routewise_cmd(&dir)
        .args(["--format", "json", "aggregate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cost_rows\": 2"))
        .stdout(predicate::str::contains("\"performance_rows\": 2"))
        .stdout(predicate::str::contains("\"forecast_states\": 1"))
        .stdout(predicate::str::contains("\"events_pruned\": 0"))
        .stdout(predicate::str::contains("\"errors\": []"));

    routewise_cmd(&dir)
        .args(["forecast", "show", "--tenant", "acme"])
        .assert()
        .success()
        .stdout(predicate::str::contains("acme/chat"))
        .stdout(predicate::str::contains("SLA risk low"));
}

#[test]
fn test_forecast_show_when_empty() {
    let dir = TempDir::new().unwrap();
    routewise_cmd(&dir)
        .args(["forecast", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No forecasts yet"));
}

#[test]
fn test_sla_violation_and_budget() {
    let dir = TempDir::new().unwrap();

    routewise_cmd(&dir)
        .args(["sla-violation", "--provider", "gemini", "-f", "chat"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Penalized gemini on chat by 0.7"));

    routewise_cmd(&dir)
        .args([
            "budget",
            "set",
            "acme",
            "--monthly-budget",
            "100",
            "--usage",
            "150",
            "--mode",
            "performance",
        ])
        .assert()
        .success();

    routewise_cmd(&dir)
        .args([
            "rank", "-t", "acme", "-f", "chat", "-p", "answer", "-c", "gemini:gemini-pro", "-c",
            "openai:gpt-4o", "-s", "cost_aware",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Mode: cost_saver"))
        .stdout(predicate::str::contains("budget=hard_limit"));
}
