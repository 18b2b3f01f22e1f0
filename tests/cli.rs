//! Tests driving the real `upd` binary.

use std::fs;
use std::process::{Command, Output};

use serde_json::json;

fn upd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_upd"))
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn project_with_manifest() -> tempfile::TempDir {
    let temp = tempfile::tempdir().unwrap();
    fs::write(temp.path().join(".updroot"), "").unwrap();
    let manifest = json!({
        "command_line_templates": [
            {
                "binary_path": "/bin/cp",
                "arguments": [ { "variables": ["input_files", "output_file"] } ]
            }
        ],
        "source_patterns": ["src/(*).c"],
        "rules": [
            {
                "command_line_ix": 0,
                "inputs": [ { "source_ix": 0 } ],
                "output": "dist/($1).o"
            }
        ]
    });
    fs::write(
        temp.path().join("updfile.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    fs::create_dir_all(temp.path().join("src")).unwrap();
    fs::write(temp.path().join("src/a.c"), "int a;").unwrap();
    temp
}

#[test]
fn prints_the_version() {
    let output = upd().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_of(&output), format!("upd version {}\n", env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_usage_help() {
    let output = upd().arg("--help").output().unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).starts_with("Usage: upd"));
}

#[test]
fn rejects_unknown_options() {
    let output = upd().arg("--frobnicate").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("invalid argument"));
}

#[test]
fn rejects_conflicting_actions() {
    let output = upd().args(&["--root", "--version"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("are in conflict"));
}

#[test]
fn rejects_targets_combined_with_all() {
    let temp = project_with_manifest();
    let output = upd()
        .args(&["--all", "dist/a.o"])
        .current_dir(temp.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains("cannot have both explicit targets and `--all`"));
}

#[test]
fn prints_the_discovered_root() {
    let temp = project_with_manifest();
    fs::create_dir_all(temp.path().join("src/deep")).unwrap();
    let output = upd()
        .arg("--root")
        .current_dir(temp.path().join("src/deep"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let printed = stdout_of(&output);
    let printed = printed.trim_end();
    assert_eq!(
        fs::canonicalize(printed).unwrap(),
        fs::canonicalize(temp.path()).unwrap()
    );
}

#[test]
fn fails_without_a_root_marker() {
    let temp = tempfile::tempdir().unwrap();
    let output = upd().arg("--root").current_dir(temp.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains(".updroot"));
}

#[test]
fn init_creates_the_root_marker() {
    let temp = tempfile::tempdir().unwrap();
    let output = upd().arg("--init").current_dir(temp.path()).output().unwrap();
    assert!(output.status.success());
    assert!(temp.path().join(".updroot").is_file());
}

#[test]
fn updates_targets_end_to_end() {
    let temp = project_with_manifest();
    let output = upd().arg("dist/a.o").current_dir(temp.path()).output().unwrap();
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert!(stdout_of(&output).contains("updating: dist/a.o"));
    assert_eq!(
        fs::read_to_string(temp.path().join("dist/a.o")).unwrap(),
        "int a;"
    );

    // Second invocation has nothing to do.
    let output = upd().arg("dist/a.o").current_dir(temp.path()).output().unwrap();
    assert!(output.status.success());
    assert!(!stdout_of(&output).contains("updating:"));
}

#[test]
fn print_commands_echoes_the_command_line() {
    let temp = project_with_manifest();
    let output = upd()
        .args(&["--print-commands", "dist/a.o"])
        .current_dir(temp.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("$ /bin/cp src/a.c dist/a.o"));
}

#[test]
fn reports_unknown_targets() {
    let temp = project_with_manifest();
    let output = upd().arg("dist/nope.o").current_dir(temp.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains("unknown output file"));
}

#[test]
fn requires_at_least_one_target() {
    let temp = project_with_manifest();
    let output = upd().current_dir(temp.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains("specify at least one target"));
}

#[test]
fn emits_a_dot_graph() {
    let temp = project_with_manifest();
    let output = upd()
        .args(&["--dot-graph", "--all"])
        .current_dir(temp.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let rendered = stdout_of(&output);
    assert!(rendered.contains("digraph upd {"));
    assert!(rendered.contains("\"src/a.c\" -> \"dist/a.o\" [label=\"/bin/cp\"];"));
    // Graphing must not run anything.
    assert!(!temp.path().join("dist/a.o").exists());
}

#[test]
fn emits_a_shell_script() {
    let temp = project_with_manifest();
    let output = upd()
        .args(&["--shell-script", "--all"])
        .current_dir(temp.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let rendered = stdout_of(&output);
    assert!(rendered.starts_with("#!/bin/bash"));
    assert!(rendered.contains("mkdir -p dist"));
    assert!(rendered.contains("/bin/cp src/a.c dist/a.o"));
    assert!(!temp.path().join("dist/a.o").exists());
}

#[test]
fn failing_subprocesses_exit_nonzero() {
    let temp = project_with_manifest();
    let manifest = json!({
        "command_line_templates": [
            {
                "binary_path": "/bin/sh",
                "arguments": [
                    { "literals": ["-c", "echo boom >&2; exit 1"] },
                    { "variables": ["input_files", "output_file"] }
                ]
            }
        ],
        "source_patterns": ["src/(*).c"],
        "rules": [
            {
                "command_line_ix": 0,
                "inputs": [ { "source_ix": 0 } ],
                "output": "dist/($1).o"
            }
        ]
    });
    fs::write(
        temp.path().join("updfile.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    let output = upd().arg("dist/a.o").current_dir(temp.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = stderr_of(&output);
    assert!(stderr.contains("boom"));
    assert!(stderr.contains("non-zero exit code"));
}

#[test]
fn reports_manifest_errors_with_location() {
    let temp = tempfile::tempdir().unwrap();
    fs::write(temp.path().join(".updroot"), "").unwrap();
    fs::write(temp.path().join("updfile.json"), "{\n  \"rules\": [,]\n}").unwrap();
    let output = upd().arg("x").current_dir(temp.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains("invalid manifest, line 2"));
}

#[test]
fn reports_missing_manifests() {
    let temp = tempfile::tempdir().unwrap();
    fs::write(temp.path().join(".updroot"), "").unwrap();
    let output = upd().arg("x").current_dir(temp.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains("updfile.json"));
}

#[test]
fn out_of_root_targets_are_rejected() {
    let temp = project_with_manifest();
    let output = upd().arg("../outside.o").current_dir(temp.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr_of(&output).contains("out of the project root"));
}
