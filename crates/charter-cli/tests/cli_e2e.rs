//! Subprocess tests of the `charter` binary.
//!
//! Each test runs in its own temporary directory with a cleared environment,
//! so no ambient `charter.toml` or `CHARTER_*` variable leaks in.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn charter_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_charter"))
}

/// Runs `charter` with `--db` inside `home`. Returns `(exit_code, stdout, stderr)`.
fn run(home: &Path, args: &[&str]) -> (Option<i32>, String, String) {
    let output = Command::new(charter_bin())
        .current_dir(home)
        .env_clear()
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .arg("--db")
        .arg(home.join("ledger.db"))
        .args(args)
        .output()
        .expect("failed to spawn charter binary");
    (
        output.status.code(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    )
}

fn run_ok(home: &Path, args: &[&str]) -> String {
    let (code, stdout, stderr) = run(home, args);
    assert_eq!(code, Some(0), "charter {args:?} failed: {stderr}");
    stdout
}

#[test]
fn signed_ledger_audits_clean_offline() {
    let home = TempDir::new().unwrap();
    let dir = home.path();

    run_ok(dir, &["init"]);
    let signer_entry = run_ok(dir, &["keygen", "clerk-1", "--out", "clerk.key"]);
    let witness_entry = run_ok(
        dir,
        &["keygen", "notary", "--out", "notary.key", "--role", "witness"],
    );
    std::fs::write(dir.join("keys.toml"), format!("{signer_entry}\n{witness_entry}")).unwrap();

    for n in 0..3 {
        let payload = format!("{{\"motion\": {n}}}");
        run_ok(
            dir,
            &[
                "append",
                "motion.filed",
                "--payload",
                &payload,
                "--agent-id",
                "clerk-1",
                "--key",
                "clerk.key",
                "--witness-key",
                "notary.key",
                "--witness-id",
                "notary",
            ],
        );
    }

    run_ok(dir, &["export", "--output", "ledger.jsonl"]);
    assert_eq!(
        std::fs::read_to_string(dir.join("ledger.jsonl"))
            .unwrap()
            .lines()
            .count(),
        3
    );

    let verify = run_ok(dir, &["verify", "--export", "ledger.jsonl"]);
    assert!(verify.contains("chain: VALID"), "{verify}");

    let audit = run_ok(
        dir,
        &[
            "audit",
            "--keys",
            "keys.toml",
            "--export",
            "ledger.jsonl",
            "--require-signatures",
        ],
    );
    assert!(audit.contains("audit: PASSED"), "{audit}");
}

#[test]
fn gap_fails_audit_unless_allowed() {
    let home = TempDir::new().unwrap();
    let dir = home.path();
    std::fs::write(dir.join("keys.toml"), "").unwrap();

    run_ok(dir, &["append", "session.opened"]);
    run_ok(dir, &["skip", "2", "--reason", "recess"]);
    run_ok(dir, &["append", "session.closed"]);

    let (code, stdout, _) = run(dir, &["audit", "--keys", "keys.toml"]);
    assert_eq!(code, Some(2));
    assert!(stdout.contains("gap: 2..=3"), "{stdout}");

    run_ok(dir, &["audit", "--keys", "keys.toml", "--allow-gaps"]);
    run_ok(dir, &["verify"]);
}

#[test]
fn stale_expect_prev_is_rejected() {
    let home = TempDir::new().unwrap();
    let dir = home.path();

    let first = run_ok(dir, &["append", "a"]);
    let first: serde_json::Value = serde_json::from_str(first.trim()).unwrap();
    let prev = first["prev_hash"].as_str().unwrap();
    assert_eq!(prev, "0".repeat(64));

    let (code, _, stderr) = run(dir, &["append", "b", "--expect-prev", prev]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("append rejected"), "{stderr}");
}

#[test]
fn verify_missing_database_is_an_error() {
    let home = TempDir::new().unwrap();
    let (code, _, stderr) = run(home.path(), &["verify", "--json"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("verify_error"), "{stderr}");
}

#[test]
fn duplicate_payload_keys_are_rejected() {
    let home = TempDir::new().unwrap();
    let dir = home.path();
    run_ok(dir, &["init"]);

    let (code, _, stderr) = run(dir, &["append", "vote.cast", "--payload", r#"{"a": 1, "a": 2}"#]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("duplicate key"), "{stderr}");

    let tail = run_ok(dir, &["tail"]);
    assert!(tail.contains("\"next_sequence\": 1"), "{tail}");
}

#[test]
fn sub_range_export_verifies_offline() {
    let home = TempDir::new().unwrap();
    let dir = home.path();

    for n in 0..6 {
        run_ok(dir, &["append", "motion.filed", "--payload", &format!("{{\"n\": {n}}}")]);
    }
    run_ok(dir, &["export", "--start", "4", "--output", "tail.jsonl"]);

    let verify = run_ok(dir, &["verify", "--export", "tail.jsonl"]);
    assert!(verify.contains("checked 3 events (4..=6)"), "{verify}");
    assert!(verify.contains("chain: VALID"), "{verify}");
    assert!(!verify.contains("gap:"), "{verify}");
}

#[test]
fn read_commands_do_not_create_a_database() {
    let home = TempDir::new().unwrap();
    let dir = home.path();

    for command in ["stats", "drift", "tail"] {
        let (code, _, _) = run(dir, &[command]);
        assert_eq!(code, Some(1), "charter {command} succeeded on a missing ledger");
    }
    assert!(!dir.join("ledger.db").exists());
}
