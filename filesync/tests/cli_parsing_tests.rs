//! Command line parsing and startup failure tests for `syncd` and `syncmon`.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_runs() {
    for bin in ["syncd", "syncmon"] {
        Command::cargo_bin(bin)
            .unwrap()
            .arg("--help")
            .assert()
            .success();
    }
}

#[test]
fn test_version_runs() {
    for bin in ["syncd", "syncmon"] {
        Command::cargo_bin(bin)
            .unwrap()
            .arg("--version")
            .assert()
            .success();
    }
}

#[test]
fn test_help_mentions_options() {
    Command::cargo_bin("syncd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--propagate-deletes"))
        .stdout(predicate::str::contains("--max-body-size"));
    Command::cargo_bin("syncmon")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--retries"))
        .stdout(predicate::str::contains("--max-in-flight"));
}

#[test]
fn test_missing_arguments_are_rejected() {
    Command::cargo_bin("syncd").unwrap().assert().failure();
    Command::cargo_bin("syncmon")
        .unwrap()
        .arg("/tmp")
        .assert()
        .failure();
}

#[test]
fn test_human_readable_sizes_are_accepted() {
    Command::cargo_bin("syncd")
        .unwrap()
        .args(["--max-body-size", "512MiB", "--help"])
        .assert()
        .success();
    Command::cargo_bin("syncmon")
        .unwrap()
        .args(["--chunk-size", "1MiB", "--help"])
        .assert()
        .success();
}

#[test]
fn test_invalid_values_are_rejected() {
    Command::cargo_bin("syncd")
        .unwrap()
        .args(["--max-body-size", "lots", "/tmp/dest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--max-body-size"));
    Command::cargo_bin("syncd")
        .unwrap()
        .args(["--max-connections", "0", "/tmp/dest"])
        .assert()
        .failure();
    Command::cargo_bin("syncmon")
        .unwrap()
        .args(["--max-in-flight", "0", "/tmp", "127.0.0.1:8080"])
        .assert()
        .failure();
    Command::cargo_bin("syncmon")
        .unwrap()
        .args(["--chunk-size", "0", "/tmp", "127.0.0.1:8080"])
        .assert()
        .failure();
}

#[test]
fn test_zero_timeouts_are_rejected() {
    Command::cargo_bin("syncd")
        .unwrap()
        .args(["--idle-timeout-sec", "0", "/tmp/dest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least 1"));
    for flag in ["--conn-timeout-sec", "--io-timeout-sec"] {
        Command::cargo_bin("syncmon")
            .unwrap()
            .args([flag, "0", "/tmp", "127.0.0.1:8080"])
            .assert()
            .failure()
            .stderr(predicate::str::contains(flag));
    }
}

#[test]
fn test_syncd_exits_when_address_is_taken() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap().to_string();
    Command::cargo_bin("syncd")
        .unwrap()
        .args(["--bind", &addr])
        .arg(tmp_dir.path().join("dest"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to bind"));
}

#[test]
fn test_syncmon_exits_when_directory_is_missing() {
    let tmp_dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("syncmon")
        .unwrap()
        .arg(tmp_dir.path().join("missing"))
        .arg("127.0.0.1:8080")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Cannot access"));
}
