//! Smoke tests for the CLI surface.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn no_arguments_shows_help_and_fails() {
    Command::cargo_bin("nimbus")
        .expect("binary builds")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn help_lists_the_lifecycle_subcommands() {
    Command::cargo_bin("nimbus")
        .expect("binary builds")
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("up")
                .and(predicate::str::contains("files"))
                .and(predicate::str::contains("ip"))
                .and(predicate::str::contains("snapshot"))
                .and(predicate::str::contains("destroy")),
        );
}

#[test]
fn unknown_subcommand_is_rejected() {
    Command::cargo_bin("nimbus")
        .expect("binary builds")
        .arg("teleport")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}
