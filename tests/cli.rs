//! Integration tests for the realmshift CLI.
//!
//! These tests run the compiled binary against a scratch root and verify
//! its output. Nothing here touches the real host.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use assert_fs::prelude::*;
use predicates::prelude::*;
use std::os::unix::fs::PermissionsExt;

use realmshift::config::Config;
use realmshift::state::{MigrationState, Mode, StateStore};

fn realmshift() -> Command {
    let mut cmd = cargo_bin_cmd!("realmshift");
    cmd.env_remove("REALMSHIFT_ROOT");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Command rooted in `temp` so every system path lands inside it.
fn realmshift_rooted(temp: &assert_fs::TempDir) -> Command {
    let mut cmd = realmshift();
    cmd.env("REALMSHIFT_ROOT", temp.path());
    cmd
}

fn config_for(temp: &assert_fs::TempDir) -> Config {
    Config {
        root: temp.path().to_path_buf(),
        ..Config::default()
    }
}

// ============================================================================
// Basic CLI tests
// ============================================================================

#[test]
fn cli_no_args_shows_help() {
    realmshift()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn cli_help_lists_commands() {
    realmshift()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("migrate"))
        .stdout(predicate::str::contains("automate"))
        .stdout(predicate::str::contains("verify"));
}

#[test]
fn cli_version_flag() {
    realmshift()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("realmshift"));
}

// ============================================================================
// migrate argument handling
// ============================================================================

#[test]
fn migrate_requires_a_mode() {
    realmshift()
        .arg("migrate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("required"));
}

#[test]
fn migrate_modes_are_exclusive() {
    realmshift()
        .args(["migrate", "--live", "--dry-run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn migrate_snapshot_requires_revert() {
    realmshift()
        .args(["migrate", "--live", "--snapshot"])
        .assert()
        .code(2);
}

#[test]
fn migrate_dry_run_on_unsupported_root_is_a_precondition_failure() {
    let temp = assert_fs::TempDir::new().unwrap();
    temp.child("etc/os-release")
        .write_str("ID=fedora\nID_LIKE=\"rhel centos\"\n")
        .unwrap();

    realmshift_rooted(&temp)
        .args(["migrate", "--dry-run", "--domain", "newco.local", "--hostname", "ws01"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("Debian or Ubuntu"));

    assert!(!StateStore::new(config_for(&temp).state_file()).exists());
}

// ============================================================================
// status
// ============================================================================

#[test]
fn status_with_nothing_in_progress() {
    let temp = assert_fs::TempDir::new().unwrap();
    realmshift_rooted(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("none in progress"));
}

#[test]
fn status_reports_interrupted_migration() {
    let temp = assert_fs::TempDir::new().unwrap();
    let config = config_for(&temp);
    let mut state = MigrationState::new(Mode::Live, "newco.local", "ws01", Some("oldco.local"));
    state.step = 8;
    StateStore::new(config.state_file()).save(&state).unwrap();

    realmshift_rooted(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("newco.local"))
        .stdout(predicate::str::contains("8/23 steps"));
}

#[test]
fn status_json_is_parseable() {
    let temp = assert_fs::TempDir::new().unwrap();
    let output = realmshift_rooted(&temp)
        .args(["status", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(report["migration"].is_null());
    assert!(report["continuation"].is_null());
    assert_eq!(report["automation"], serde_json::json!([]));
}

// ============================================================================
// failure surfacing and revert
// ============================================================================

const ORIGINAL_HOSTS: &str = "127.0.0.1 localhost\n127.0.1.1 ws01.oldco.local ws01\n";

/// A Debian-like root whose tools are shell stubs; `realm join` always fails.
fn seed_host(temp: &assert_fs::TempDir) {
    temp.child("etc/os-release").write_str("ID=ubuntu\nID_LIKE=debian\n").unwrap();
    temp.child("etc/hosts").write_str(ORIGINAL_HOSTS).unwrap();
    temp.child("etc/hostname").write_str("ws01\n").unwrap();
    temp.child("etc/krb5.conf")
        .write_str("[libdefaults]\n    default_realm = OLDCO.LOCAL\n")
        .unwrap();
    temp.child("etc/nsswitch.conf")
        .write_str("passwd: files systemd\n")
        .unwrap();
    temp.child("etc/passwd")
        .write_str("root:x:0:0:root:/root:/bin/bash\nrealmshift-admin:x:1000:1000::/home/realmshift-admin:/bin/bash\n")
        .unwrap();

    let stubs = [
        ("apt-get", "exit 0"),
        ("systemctl", "exit 0"),
        ("hostnamectl", "exit 0"),
        ("sssctl", "exit 0"),
        ("realm", "case \"$1\" in join) read -r _; exit 1;; *) exit 0;; esac"),
    ];
    for (tool, body) in stubs {
        let stub = temp.child(format!("usr/bin/{tool}"));
        stub.write_str(&format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(stub.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

#[test]
fn failed_automated_run_points_at_revert_which_restores_the_host() {
    // automate and revert both refuse to run unprivileged.
    if !nix::unistd::geteuid().is_root() {
        return;
    }
    let temp = assert_fs::TempDir::new().unwrap();
    seed_host(&temp);
    let config = config_for(&temp);
    let path = temp.path().join("usr/bin");

    let output = realmshift_rooted(&temp)
        .env("PATH", &path)
        .args([
            "automate",
            "--test",
            "--password-stdin",
            "--domain",
            "newco.local",
            "--hostname",
            "ws01",
            "--old-domain",
            "oldco.local",
            "--admin",
            "Administrator",
        ])
        .write_stdin("hunter2\n")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1), "{stdout}");
    assert!(stdout.contains("JoinNewDomain"));
    assert!(stdout.contains("realmshift migrate --revert"));

    let stamp = std::fs::read_dir(temp.path().join("etc"))
        .unwrap()
        .filter_map(|e| e.ok())
        .find_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("hosts.backup."))
                .map(str::to_string)
        })
        .expect("hosts was backed up");
    assert!(stdout.contains(&stamp), "{stdout}");
    assert_eq!(StateStore::new(config.state_file()).load().unwrap().step, 8);

    // What a later step or a stray hook would have left behind.
    temp.child("etc/hosts").write_str("10.0.0.1 elsewhere\n").unwrap();
    temp.child("etc/rc.local")
        .write_str("#!/bin/sh\n/usr/local/sbin/realmshift automate --auto # realmshift-continuation\nexit 0\n")
        .unwrap();

    realmshift_rooted(&temp)
        .env("PATH", &path)
        .args(["migrate", "--revert", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Revert complete"));

    temp.child("etc/hosts").assert(ORIGINAL_HOSTS);
    let rc_local = std::fs::read_to_string(temp.path().join("etc/rc.local")).unwrap();
    assert!(!rc_local.contains("realmshift-continuation"));
    assert!(rc_local.contains("exit 0"));
    assert!(!StateStore::new(config.state_file()).exists());
    assert!(!temp.path().join("var/tmp/realmshift").exists());
}

// ============================================================================
// verify
// ============================================================================

#[test]
fn verify_without_any_domain_fails() {
    let temp = assert_fs::TempDir::new().unwrap();
    realmshift_rooted(&temp)
        .arg("verify")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--domain"));
}

// ============================================================================
// completions
// ============================================================================

#[test]
fn completions_bash() {
    realmshift()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("realmshift"));
}

#[test]
fn completions_rejects_unknown_shell() {
    realmshift()
        .args(["completions", "tcsh"])
        .assert()
        .failure();
}
