#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use rusqlite::Connection;
use serde_json::{json, Value};

fn pk_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pk"))
}

fn temp_path(label: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "pk-cli-{label}-{}.{extension}",
        ulid::Ulid::new().to_string().to_lowercase()
    ))
}

fn pk_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(pk_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run pk command {:?}: {err}", args),
    }
}

fn pk_with_stdin(db_path: &Path, args: &[&str], stdin: &str) -> Output {
    let mut command = Command::new(pk_binary_path());
    command
        .arg("--db")
        .arg(db_path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => panic!("failed to spawn pk: {err}"),
    };
    match child.stdin.take() {
        Some(mut pipe) => {
            if let Err(err) = pipe.write_all(stdin.as_bytes()) {
                panic!("failed to write pk stdin: {err}");
            }
        }
        None => panic!("pk stdin was not piped"),
    }
    match child.wait_with_output() {
        Ok(output) => output,
        Err(err) => panic!("failed to wait for pk: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "pk failed: status={:?}\nstderr={}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn tool(db_path: &Path, request: &Value) -> Value {
    let output = pk_output(db_path, &["tool", "--request", &request.to_string()]);
    assert_success(&output);
    stdout_json(&output)
}

fn register_workspace(db_path: &Path, path: &str) -> String {
    let output = pk_output(db_path, &["workspace", "register", "--path", path]);
    assert_success(&output);
    match stdout_json(&output)["id"].as_str() {
        Some(id) => id.to_string(),
        None => panic!("workspace register did not return an id"),
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(pk_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["migrate", "tool", "workspace", "plan", "program", "sessions", "events"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn migrate_is_idempotent() {
    let db_path = temp_path("migrate", "sqlite3");

    let first = pk_output(&db_path, &["migrate"]);
    assert_success(&first);
    let first = stdout_json(&first);

    let second = pk_output(&db_path, &["migrate"]);
    assert_success(&second);
    let second = stdout_json(&second);

    assert_eq!(second["applied_now"], json!([]));
    assert_eq!(first["migrations"], second["migrations"]);
    assert!(first["migrations"]
        .as_array()
        .is_some_and(|migrations| !migrations.is_empty()));
}

#[test]
fn tool_round_trip_creates_and_shows_a_plan() {
    let db_path = temp_path("plan", "sqlite3");
    let workspace_id = register_workspace(&db_path, "/srv/cli-plan");

    let created = tool(
        &db_path,
        &json!({
            "action": "create_plan",
            "workspace_id": workspace_id,
            "title": "Ship the CLI",
            "steps": [
                { "phase": "build", "task": "Write commands", "type": "code" },
                { "phase": "verify", "task": "Drive the binary", "type": "test" }
            ]
        }),
    );
    assert_eq!(created["success"], json!(true));
    let plan_id = match created["data"]["id"].as_str() {
        Some(id) => id.to_string(),
        None => panic!("create_plan returned no id: {created}"),
    };

    let updated = tool(
        &db_path,
        &json!({
            "action": "update_step",
            "workspace_id": workspace_id,
            "plan_id": plan_id,
            "index": 0,
            "status": "done"
        }),
    );
    assert_eq!(updated["data"]["completed_phases"], json!(["build"]));
    assert_eq!(updated["data"]["phase_reports"], json!([]));

    let shown = pk_output(&db_path, &["plan", "show", "--plan-id", &plan_id]);
    assert_success(&shown);
    let shown = stdout_json(&shown);
    assert_eq!(shown["title"], json!("Ship the CLI"));
    assert_eq!(shown["steps"][0]["status"], json!("done"));
    assert_eq!(shown["current_phase"], json!("verify"));

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let events: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM plan_events WHERE plan_id = ?1",
        [&plan_id],
        |row| row.get(0),
    ) {
        Ok(count) => count,
        Err(err) => panic!("failed to count events: {err}"),
    };
    assert!(events >= 2, "expected create and update events, got {events}");
}

#[test]
fn tool_reads_requests_from_stdin() {
    let db_path = temp_path("stdin", "sqlite3");
    let workspace_id = register_workspace(&db_path, "/srv/cli-stdin");

    let output = pk_with_stdin(&db_path, &["tool"], r#"{"action":"list_workspaces"}"#);
    assert_success(&output);
    let response = stdout_json(&output);
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["data"][0]["id"], json!(workspace_id));
}

#[test]
fn tool_failures_use_the_error_envelope() {
    let db_path = temp_path("errors", "sqlite3");
    let workspace_id = register_workspace(&db_path, "/srv/cli-errors");

    let missing = tool(
        &db_path,
        &json!({ "action": "get_plan", "workspace_id": workspace_id, "plan_id": "plan_missing" }),
    );
    assert_eq!(missing["success"], json!(false));
    assert_eq!(missing["error"]["code"], json!("not_found"));
    assert_eq!(missing["error"]["retryable"], json!(false));
    assert!(missing.get("data").is_none());

    let malformed = tool(&db_path, &json!({ "action": "create_plan" }));
    assert_eq!(malformed["error"]["code"], json!("validation"));
}

#[test]
fn invalid_config_fails_startup() {
    let db_path = temp_path("bad-config", "sqlite3");
    let config_path = temp_path("bad-config", "json");
    if let Err(err) = std::fs::write(&config_path, r#"{"lock_retry_attempts": 0}"#) {
        panic!("failed to write config: {err}");
    }
    let config_arg = config_path.display().to_string();

    let output = pk_output(&db_path, &["--config", &config_arg, "migrate"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("configuration"),
        "expected configuration error; stderr={stderr}"
    );
}

#[test]
fn sessions_sweep_reports_flagged_ids() {
    let db_path = temp_path("sweep", "sqlite3");
    let output = pk_output(&db_path, &["sessions", "sweep"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output), json!({ "flagged": [] }));
}

#[test]
fn sessions_sweep_rejects_unrepresentable_window() {
    let db_path = temp_path("sweep-range", "sqlite3");
    let output = pk_output(
        &db_path,
        &["sessions", "sweep", "--stale-after-minutes", "9223372036854775807"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("stale_after_minutes"),
        "expected validation error; stderr={stderr}"
    );
}
