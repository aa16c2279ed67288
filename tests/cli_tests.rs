//! Integration tests for the tessera CLI

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn tessera(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tessera"))
        .args(args)
        .env_remove("TESSERA_LOG")
        .env_remove("TESSERA_CONFIG")
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to execute tessera")
}

/// Helper to create a file in a temporary directory
fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).expect("Failed to write temp file");
    path
}

fn demo(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_render_text() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "page.tess", r#"<q:set name="n" value="2"/><p>{n * 21}</p>"#);

    let output = tessera(&["render", file.to_str().unwrap()]);
    assert!(output.status.success(), "render should succeed: {}", stderr(&output));
    assert_eq!(stdout(&output).trim_end(), "<p>42</p>");
}

#[test]
fn test_render_with_vars_and_component() {
    let dir = TempDir::new().unwrap();
    let file = write(
        &dir,
        "card.tess",
        r#"<q:component name="card"><q:param name="title" default="none"/><q:param name="count" type="integer"/><h1>{title} x{count + 1}</h1></q:component>"#,
    );

    let output = tessera(&[
        "render",
        file.to_str().unwrap(),
        "--component",
        "card",
        "--var",
        "title=News",
        "--var",
        "count=41",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output).trim_end(), "<h1>News x42</h1>");
}

#[test]
fn test_render_json_output() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "vars.tess", r#"<q:set name="greeting" value="hi"/>{greeting}"#);

    let output = tessera(&["render", file.to_str().unwrap(), "--format", "json"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("valid JSON");
    assert_eq!(json["body"], "hi");
    assert_eq!(json["variables"]["greeting"], "hi");
}

#[test]
fn test_render_compiled_matches_interpreted() {
    let fixtures = demo("fixtures.json");
    let file = demo("dashboard.tess");
    let interpreted = tessera(&["render", &file, "--fixtures", &fixtures]);
    let compiled = tessera(&["render", &file, "--fixtures", &fixtures, "--compiled"]);
    assert!(interpreted.status.success(), "{}", stderr(&interpreted));
    assert!(compiled.status.success(), "{}", stderr(&compiled));
    assert_eq!(stdout(&interpreted), stdout(&compiled));
    assert!(stdout(&compiled).contains("Users (3)"));
}

#[test]
fn test_render_parse_error_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "bad.tess", "<p>\n<q:set name=\"a\"/>\n</p>");

    let output = tessera(&["render", file.to_str().unwrap()]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("Set requires 'value' attribute"), "{}", err);
    assert!(err.contains(":2:"), "diagnostic should point at line 2: {}", err);
}

#[test]
fn test_render_runtime_error_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "loop.tess", r#"<q:loop from="1" to="3" step="{0}">x</q:loop>"#);

    let output = tessera(&["render", file.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Loop 'step' cannot be zero"));
}

#[test]
fn test_parse_json_tree() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "tree.tess", r#"<div><q:set name="a" value="1"/></div>"#);

    let output = tessera(&["parse", file.to_str().unwrap(), "--format", "json"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("valid JSON");
    assert_eq!(json["nodes"][0]["tag"], "div");
}

#[test]
fn test_check_reports_each_failure() {
    let dir = TempDir::new().unwrap();
    write(&dir, "good.tess", "<p>ok</p>");
    write(&dir, "bad.tess", "<q:frobnicate/>");
    write(&dir, "ignored.txt", "<div>");

    let output = tessera(&["check", dir.path().to_str().unwrap()]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("bad.tess"));
    assert!(err.contains("unknown language tag '<q:frobnicate>'"));
    assert!(err.contains("1 error(s), 1 file(s) passed"));
    assert!(!err.contains("ignored.txt"));
}

#[test]
fn test_check_demos_pass() {
    let pattern = format!("{}/demos/*.tess", env!("CARGO_MANIFEST_DIR"));
    let output = tessera(&["check", &pattern]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("file(s) checked"));
}

#[test]
fn test_bench_reports_both_backends() {
    let output = tessera(&["bench", &demo("basics.tess"), "--iterations", "3"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("interpreted"));
    assert!(out.contains("compiled"));
}

#[test]
fn test_invalid_var_is_rejected() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "p.tess", "<p>x</p>");
    let output = tessera(&["render", file.to_str().unwrap(), "--var", "novalue"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("expected NAME=VALUE"));
}
