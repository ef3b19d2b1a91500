#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn changelog_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_changelog"))
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("changelog-cli-{}.sqlite3", Ulid::new()))
}

fn changelog_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(changelog_binary());
    command.env_remove("CHANGELOG_DB").arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run changelog command {:?}: {err}", args),
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

fn data_str<'a>(value: &'a Value, field: &str) -> &'a str {
    match value.get("data").and_then(|data| data.get(field)).and_then(Value::as_str) {
        Some(text) => text,
        None => panic!("missing data.{field} in {value}"),
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(changelog_binary()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["save-file", "create", "show", "show-path", "update", "delete", "list"] {
        assert!(stdout.contains(required), "help output missing `{required}`:\n{stdout}");
    }
}

#[test]
fn save_file_twice_keeps_one_document() {
    let db_path = temp_db_path();

    let first = changelog_output(
        &db_path,
        &[
            "save-file",
            "--path",
            "/change-logs/CHANGELOG.md",
            "--author",
            "alice",
            "--content",
            "v1",
        ],
    );
    assert!(first.status.success(), "stderr={}", String::from_utf8_lossy(&first.stderr));
    let first = stdout_json(&first);
    assert_eq!(first.get("success"), Some(&Value::Bool(true)));
    assert_eq!(data_str(&first, "name"), "CHANGELOG.md");
    assert_eq!(data_str(&first, "version"), "1.0.0");

    let second = changelog_output(
        &db_path,
        &[
            "save-file",
            "--path",
            "/change-logs/CHANGELOG.md",
            "--author",
            "bob",
            "--content",
            "v2",
        ],
    );
    assert!(second.status.success());
    let second = stdout_json(&second);
    assert_eq!(data_str(&second, "id"), data_str(&first, "id"));
    assert_eq!(data_str(&second, "createdBy"), "alice");
    assert_eq!(data_str(&second, "lastModifiedBy"), "bob");

    let listed = stdout_json(&changelog_output(&db_path, &["list"]));
    assert_eq!(listed.get("data").and_then(Value::as_array).map(Vec::len), Some(1));

    let shown = stdout_json(&changelog_output(
        &db_path,
        &["show-path", "--path", "/change-logs/CHANGELOG.md"],
    ));
    assert_eq!(data_str(&shown, "content"), "v2");

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn content_file_is_read_into_document() {
    let db_path = temp_db_path();
    let content_path = std::env::temp_dir().join(format!("changelog-cli-{}.md", Ulid::new()));
    if let Err(err) = std::fs::write(&content_path, "# Release notes\n") {
        panic!("failed to write content fixture: {err}");
    }
    let content_arg = content_path.to_string_lossy().to_string();

    let output = changelog_output(
        &db_path,
        &["create", "--path", "/notes.md", "--author", "carol", "--content-file", &content_arg],
    );
    assert!(output.status.success(), "stderr={}", String::from_utf8_lossy(&output.stderr));
    let created = stdout_json(&output);
    assert_eq!(data_str(&created, "content"), "# Release notes\n");
    assert_eq!(data_str(&created, "size"), "0.0 KB");

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&content_path);
}

#[test]
fn create_conflict_prints_failure_envelope_and_exits_non_zero() {
    let db_path = temp_db_path();
    let args = ["create", "--path", "/a.md", "--author", "bob", "--content", "x"];

    assert!(changelog_output(&db_path, &args).status.success());
    let output = changelog_output(&db_path, &args);
    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value.get("success"), Some(&Value::Bool(false)));
    assert_eq!(value.get("code").and_then(Value::as_str), Some("conflict"));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn update_then_delete_flow() {
    let db_path = temp_db_path();
    let created = stdout_json(&changelog_output(
        &db_path,
        &["create", "--path", "/a.md", "--author", "bob", "--version", "3.1.0", "--content", ""],
    ));
    let id = data_str(&created, "id").to_string();

    let output = changelog_output(
        &db_path,
        &["update", "--id", &id, "--author", "dana", "--content", "patched", "--active", "false"],
    );
    assert!(output.status.success(), "stderr={}", String::from_utf8_lossy(&output.stderr));
    let updated = stdout_json(&output);
    assert_eq!(data_str(&updated, "version"), "3.1.0");
    assert_eq!(data_str(&updated, "content"), "patched");
    assert_eq!(
        updated.get("data").and_then(|data| data.get("isActive")),
        Some(&Value::Bool(false))
    );

    let deleted = changelog_output(&db_path, &["delete", "--id", &id]);
    assert!(deleted.status.success());

    let again = changelog_output(&db_path, &["delete", "--id", &id]);
    assert!(!again.status.success());
    assert_eq!(stdout_json(&again).get("code").and_then(Value::as_str), Some("not_found"));

    let shown = changelog_output(&db_path, &["show", "--id", &id]);
    assert!(!shown.status.success());

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn save_file_without_content_fails_and_keeps_stored_body() {
    let db_path = temp_db_path();
    let first = changelog_output(
        &db_path,
        &["save-file", "--path", "/a.md", "--author", "bob", "--content", "important body"],
    );
    assert!(first.status.success(), "stderr={}", String::from_utf8_lossy(&first.stderr));

    let missing = changelog_output(&db_path, &["save-file", "--path", "/a.md", "--author", "eve"]);
    assert!(!missing.status.success());
    assert!(
        String::from_utf8_lossy(&missing.stderr).contains("--content"),
        "stderr={}",
        String::from_utf8_lossy(&missing.stderr)
    );

    let shown = stdout_json(&changelog_output(&db_path, &["show-path", "--path", "/a.md"]));
    assert_eq!(data_str(&shown, "content"), "important body");
    assert_eq!(data_str(&shown, "lastModifiedBy"), "bob");

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn malformed_id_is_a_validation_error() {
    let db_path = temp_db_path();
    let output = changelog_output(&db_path, &["show", "--id", "not-a-ulid"]);

    assert!(!output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value.get("code").and_then(Value::as_str), Some("validation_error"));

    let _ = std::fs::remove_file(&db_path);
}
