//! CLI Argument Parsing Compatibility Tests
//!
//! These tests verify that command-line arguments are parsed correctly and maintain
//! backward compatibility. The focus is on ensuring that argument values, aliases,
//! and formats continue to work as expected across versions.

use assert_cmd::Command;

#[test]
fn test_help_runs() {
    Command::cargo_bin("uio")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn test_version_runs() {
    Command::cargo_bin("uio")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_subcommand_help_runs() {
    for command in ["copy", "move", "mkdir", "rmdir", "ls", "fingerprint", "sync"] {
        Command::cargo_bin("uio")
            .unwrap()
            .args([command, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_missing_subcommand_fails() {
    Command::cargo_bin("uio").unwrap().assert().failure();
}

// ============================================================================
// Size Argument Parsing Tests
// ============================================================================

#[test]
fn test_chunk_size_human_readable() {
    for size in ["64KiB", "5MiB", "1GB", "4096"] {
        Command::cargo_bin("uio")
            .unwrap()
            .args(["--chunk-size", size, "ls", "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_chunk_size_invalid() {
    Command::cargo_bin("uio")
        .unwrap()
        .args(["--chunk-size", "lots", "ls", "--help"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value 'lots'"));
}

#[test]
fn test_global_flags_after_subcommand() {
    Command::cargo_bin("uio")
        .unwrap()
        .args(["ls", "-vv", "--max-transfers", "2", "--iops-throttle", "100", "--help"])
        .assert()
        .success();
}

// ============================================================================
// Hash Algorithm Argument Parsing Tests
// ============================================================================

#[test]
fn test_hash_values() {
    for hash in ["sha256", "blake2b512"] {
        Command::cargo_bin("uio")
            .unwrap()
            .args(["--hash", hash, "fingerprint", "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_hash_invalid() {
    Command::cargo_bin("uio")
        .unwrap()
        .args(["--hash", "md5", "fingerprint", "--help"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value 'md5'"));
}

// ============================================================================
// Sync Store Arguments
// ============================================================================

#[test]
fn test_sync_db_conflicts_with_in_memory() {
    Command::cargo_bin("uio")
        .unwrap()
        .args(["sync", "a", "b", "--db", "state.db", "--in-memory"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("cannot be used with"));
}

#[test]
fn test_short_flags() {
    Command::cargo_bin("uio")
        .unwrap()
        .args(["mkdir", "-p", "--help"])
        .assert()
        .success();
    Command::cargo_bin("uio")
        .unwrap()
        .args(["rmdir", "-r", "--help"])
        .assert()
        .success();
}
