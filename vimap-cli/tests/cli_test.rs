//! Runs the `vimap` binary end to end, with real worker processes

use std::io::Write;
use std::process::{Command, Output, Stdio};

use serde_json::Value as JsonValue;
use tempfile::TempDir;

fn vimap() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vimap"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn run_with_stdin(args: &[&str], stdin: &str) -> Output {
    let mut child = vimap()
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to start vimap");

    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .unwrap();

    child.wait_with_output().unwrap()
}

fn pairs(output: &Output) -> Vec<(JsonValue, JsonValue)> {
    let mut pairs: Vec<(JsonValue, JsonValue)> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| {
            let value: JsonValue = serde_json::from_str(line).unwrap();
            (value["input"].clone(), value["output"].clone())
        })
        .collect();
    pairs.sort_by_key(|(input, _)| input.to_string());
    pairs
}

#[test]
fn test_run_upper_with_two_workers() {
    let output = run_with_stdin(
        &["run", "--transform", "upper", "--workers", "2"],
        "alpha\nbeta\ngamma\n",
    );

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        pairs(&output),
        vec![
            ("alpha".into(), "ALPHA".into()),
            ("beta".into(), "BETA".into()),
            ("gamma".into(), "GAMMA".into()),
        ]
    );
}

#[test]
fn test_run_eager_with_init_args() {
    let output = run_with_stdin(
        &[
            "run",
            "--transform",
            "add",
            "--json",
            "--eager",
            "--init-args",
            "[1, 2]",
        ],
        "1\n10\n",
    );

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let outputs: Vec<f64> = pairs(&output)
        .into_iter()
        .map(|(_, out)| out.as_f64().unwrap())
        .collect();
    assert_eq!(outputs, vec![4.0, 13.0]);
}

#[test]
fn test_run_stops_after_worker_failure() {
    let output = run_with_stdin(
        &[
            "run",
            "--transform",
            "fail-after",
            "--workers",
            "1",
            "--init-kwargs",
            r#"{"n": 2}"#,
        ],
        "a\nb\nc\nd\n",
    );

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        pairs(&output),
        vec![("a".into(), "a".into()), ("b".into(), "b".into())]
    );
}

#[test]
fn test_run_from_file() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "x\nyy\n").unwrap();

    let output = vimap()
        .args(["run", "--transform", "length", "--input"])
        .arg(&input)
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        pairs(&output),
        vec![("x".into(), 1.into()), ("yy".into(), 2.into())]
    );
}

#[test]
fn test_unknown_transform_is_rejected() {
    let output = run_with_stdin(&["run", "--transform", "nope"], "a\n");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown transform"));
}

#[test]
fn test_transforms_listing() {
    let output = vimap().arg("transforms").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    for name in ["identity", "upper", "prefix", "fail-after"] {
        assert!(stdout.contains(name), "missing {}", name);
    }
}

#[test]
fn test_config_generate_then_validate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vimap.yaml");

    let generated = vimap()
        .args(["config", "generate", "--output"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(generated.status.success());
    assert!(path.exists());

    let again = vimap()
        .args(["config", "generate", "--output"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!again.status.success());

    let validated = vimap()
        .args(["config", "validate", "--config-file"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(validated.status.success());
}

#[test]
fn test_config_validate_rejects_zero_workers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.yaml");
    std::fs::write(&path, "pool:\n  worker_count: 0\n").unwrap();

    let output = vimap()
        .args(["config", "validate", "--config-file"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
}
