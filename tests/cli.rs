//! End-to-end checks of the thin CLI entrypoint, run as a subprocess.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_config_and_log_level_flags() {
    let mut cmd = Command::cargo_bin("shannon-core").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--log-level"));
}

#[test]
fn unknown_flag_is_rejected() {
    let mut cmd = Command::cargo_bin("shannon-core").unwrap();
    cmd.arg("--does-not-exist");
    cmd.assert().failure();
}
