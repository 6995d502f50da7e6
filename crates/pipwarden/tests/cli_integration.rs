//! CLI integration tests for the pipwarden command-line interface.
//!
//! Every test points the user config directory and the working directory at
//! a temp dir so no real configuration or log directory is touched.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the pipwarden binary, isolated in `dir`.
fn pipwarden(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pipwarden").unwrap();
    cmd.current_dir(dir.path())
        .env("PIPWARDEN_CONFIG_DIR", dir.path().join("config"));
    cmd
}

/// Write a journal in the on-disk record format.
fn write_journal(path: &Path, entries: &[&str]) {
    let mut data = Vec::new();
    for entry in entries {
        let units: Vec<u16> = entry.encode_utf16().collect();
        data.extend_from_slice(&(units.len() as u32).to_le_bytes());
        for unit in units {
            data.extend_from_slice(&unit.to_le_bytes());
        }
    }
    std::fs::write(path, data).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    pipwarden(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("journal"))
        .stdout(predicate::str::contains("manifest"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_displays() {
    let dir = TempDir::new().unwrap();
    pipwarden(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pipwarden"));
}

#[test]
fn test_exec_requires_info_and_result() {
    let dir = TempDir::new().unwrap();
    pipwarden(&dir)
        .args(["exec", "--info", "info.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--result"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Journal
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_journal_replays_in_write_order() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("pip.sharedopaque");
    write_journal(&journal, &["/out/b", "/out/a", "/out/b"]);

    pipwarden(&dir)
        .arg("journal")
        .arg(&journal)
        .assert()
        .success()
        .stdout("/out/b\n/out/a\n/out/b\n");
}

#[test]
fn test_journal_sort_dedupe_json() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("pip.sharedopaque");
    write_journal(&journal, &["/out/b", "/out/a", "/out/b"]);

    let output = pipwarden(&dir)
        .args(["--json", "journal", "--sort", "--dedupe"])
        .arg(&journal)
        .output()
        .unwrap();
    assert!(output.status.success());
    let paths: Vec<String> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(paths, vec!["/out/a", "/out/b"]);
}

#[test]
fn test_journal_truncated_tail_is_ignored() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("pip.sharedopaque");
    write_journal(&journal, &["/out/a"]);
    let mut data = std::fs::read(&journal).unwrap();
    data.extend_from_slice(&[9, 0, 0, 0, b'/', 0]);
    std::fs::write(&journal, data).unwrap();

    pipwarden(&dir)
        .arg("journal")
        .arg(&journal)
        .assert()
        .success()
        .stdout("/out/a\n");
}

#[test]
fn test_journal_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    pipwarden(&dir)
        .args(["journal", "missing.sharedopaque"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read journal"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Manifest
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_manifest_encode_then_inspect() {
    let dir = TempDir::new().unwrap();
    let manifest = dir.path().join("m/pip.manifest");

    pipwarden(&dir)
        .args(["manifest", "encode", "--pip", "42"])
        .args(["--read", "/src", "--write", "/out"])
        .arg("--output")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));

    let output = pipwarden(&dir)
        .args(["--json", "manifest", "inspect"])
        .arg(&manifest)
        .output()
        .unwrap();
    assert!(output.status.success());
    let dump: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(dump["pip_id"], "Pip000000000000002A");
    let declared = dump["declared"].as_array().unwrap();
    let paths: Vec<&str> = declared
        .iter()
        .map(|d| d["path"].as_str().unwrap())
        .collect();
    assert!(paths.contains(&"/src"));
    assert!(paths.contains(&"/out"));
}

#[test]
fn test_manifest_encode_rejects_relative_path() {
    let dir = TempDir::new().unwrap();
    pipwarden(&dir)
        .args(["manifest", "encode", "--read", "src", "--output", "m.bin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid read path"));
}

#[test]
fn test_manifest_inspect_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("garbage.manifest");
    std::fs::write(&file, b"not a manifest").unwrap();
    pipwarden(&dir)
        .args(["manifest", "inspect"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to decode manifest"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_defaults() {
    let dir = TempDir::new().unwrap();
    pipwarden(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("No config files loaded"));
}

#[test]
fn test_config_reads_project_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("pipwarden.toml"),
        "[sandbox]\nkind = \"ptrace\"\n\n[logging]\nfile = false\n",
    )
    .unwrap();

    pipwarden(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("pipwarden.toml"))
        .stdout(predicate::str::contains("Ptrace"));
}

#[test]
fn test_config_which_json() {
    let dir = TempDir::new().unwrap();
    let output = pipwarden(&dir)
        .args(["--json", "config", "which"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let sources: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let sources = sources.as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert!(sources.iter().all(|s| s["loaded"] == false));
}

// ─────────────────────────────────────────────────────────────────────────────
// Exec (external helper)
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn test_exec_writes_result_for_failing_tool() {
    let dir = TempDir::new().unwrap();
    let info = dir.path().join("info.json");
    let result = dir.path().join("result.json");
    std::fs::write(
        &info,
        serde_json::json!({
            "pip_id": 7,
            "tool_path": "/bin/sh",
            "args": ["-c", "echo built; exit 3"],
            "working_dir": dir.path(),
        })
        .to_string(),
    )
    .unwrap();

    pipwarden(&dir)
        .arg("exec")
        .arg("--info")
        .arg(&info)
        .arg("--result")
        .arg(&result)
        .assert()
        .success();

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&result).unwrap()).unwrap();
    assert_eq!(written["pip_id"], 7);
    assert_eq!(written["exit_code"], 3);
    assert_eq!(written["stdout"], "built\n");
}

#[test]
fn test_exec_bad_info_fails() {
    let dir = TempDir::new().unwrap();
    let info = dir.path().join("info.json");
    std::fs::write(&info, "{}").unwrap();
    pipwarden(&dir)
        .arg("exec")
        .arg("--info")
        .arg(&info)
        .arg("--result")
        .arg(dir.path().join("result.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to execute invocation"));
    assert!(!dir.path().join("result.json").exists());
}
