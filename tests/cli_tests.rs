//! Integration tests for the tracerelay binary
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

mod utils;

use predicates::prelude::*;
use std::path::PathBuf;
use utils::{two_thread_trace, TraceBuilder};

fn write_trace(dir: &tempfile::TempDir, builder: &TraceBuilder) -> PathBuf {
    let path = dir.path().join("cli.trace");
    builder.write(&path);
    path
}

#[test]
fn test_help_exits_zero() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--snapshot-prefix"))
        .stdout(predicate::str::contains("--singlethread"));
}

#[test]
fn test_missing_trace_argument_exits_one() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.assert().code(1);
}

#[test]
fn test_unknown_flag_exits_one() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("--no-such-flag").arg("x.trace");
    cmd.assert().code(1);
}

#[test]
fn test_nonexistent_trace_exits_one() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("/nonexistent/never.trace");
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to open trace"));
}

#[test]
fn test_replay_prints_summary() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_trace(&dir, &two_thread_trace(2));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Rendered 2 frames in"))
        .stdout(predicate::str::contains("fps"));
}

#[test]
fn test_benchmark_mode_is_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_trace(&dir, &two_thread_trace(2));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("-b").arg(&path);
    cmd.assert().success().stdout(predicate::str::is_empty());
}

#[test]
fn test_hash_snapshots_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_trace(&dir, &two_thread_trace(3));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("-s")
        .arg("-")
        .arg("--snapshot-format")
        .arg("hash")
        .arg(&path);
    let output = cmd.output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in &lines {
        assert_eq!(line.len(), 64);
        assert!(line.chars().all(|c| c.is_ascii_hexdigit()));
    }
    // Each frame renders differently.
    assert_ne!(lines[0], lines[1]);
}

#[test]
fn test_loop_count_replays_extra_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_trace(&dir, &two_thread_trace(2));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("--loop").arg("--loop-count").arg("3").arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Rendered 5 frames"));
}

#[test]
fn test_loop_count_without_loop_exits_one() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("--loop-count").arg("3").arg("x.trace");
    cmd.assert().code(1);
}

#[test]
fn test_dump_state_writes_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_trace(&dir, &two_thread_trace(2));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("-D").arg("2").arg(&path);
    let output = cmd.output().unwrap();
    assert!(output.status.success());

    let dump: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(dump["frames"], 0);
    assert_eq!(dump["drawable"]["width"], 64);
}

#[test]
fn test_dump_state_skips_remaining_traces() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_trace(&dir, &two_thread_trace(2));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("-D").arg("2").arg(&path).arg(&path);
    let output = cmd.output().unwrap();
    assert!(output.status.success());

    // Exactly one JSON document on stdout.
    let dump: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(dump["drawable"]["width"], 64);
}

#[test]
fn test_trace_without_thread_zero_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = TraceBuilder::new();
    builder.draw(1);
    let path = write_trace(&dir, &builder);

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg(&path);
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("no calls on thread 0"));
}

#[test]
fn test_cpu_profile_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_trace(&dir, &two_thread_trace(1));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("-b").arg("--pcpu").arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("# call no gpu_start gpu_dura cpu_start cpu_dura"))
        .stdout(predicate::str::contains("frame_end"))
        .stdout(predicate::str::contains("Rendered 1 frames"));
}

#[test]
fn test_bad_config_file_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "benchmark = \"yes\"\n").unwrap();
    let path = write_trace(&dir, &two_thread_trace(1));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("--config").arg(&config).arg(&path);
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_config_file_settings_apply() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("replay.toml");
    std::fs::write(&config, "single_thread = true\n\n[prefetch]\nbatch_size = 3\nlow_water = 1\n").unwrap();
    let path = write_trace(&dir, &two_thread_trace(4));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tracerelay");
    cmd.arg("--config").arg(&config).arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Rendered 4 frames"));
}
