//! The `rdvp` binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn rdvp() -> Command {
    Command::cargo_bin("rdvp").unwrap()
}

fn genkey(args: &[&str]) -> String {
    let output = rdvp().arg("genkey").args(args).output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

#[test]
fn test_genkey_then_sharekey() {
    let key = genkey(&[]);
    assert!(!key.is_empty());

    let first = rdvp().args(["sharekey", "-pk", &key]).output().unwrap();
    assert!(first.status.success());
    let second = rdvp().args(["sharekey", "--pk", &key]).output().unwrap();
    assert_eq!(first.stdout, second.stdout);
    assert!(String::from_utf8(first.stdout).unwrap().trim().starts_with("12D3KooW"));
}

#[test]
fn test_genkey_every_supported_type() {
    for key_type in ["Ed25519", "ECDSA", "Secp256k1"] {
        let key = genkey(&["-type", key_type]);
        rdvp()
            .args(["sharekey", "-pk", &key])
            .assert()
            .success()
            .stdout(predicate::str::is_empty().not());
    }
}

#[test]
fn test_genkey_unknown_type_fails() {
    rdvp()
        .args(["genkey", "-type", "DSA"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown key type"));
}

#[test]
fn test_sharekey_rejects_garbage() {
    rdvp()
        .args(["sharekey", "-pk", "not base64!"])
        .assert()
        .code(1);
}

#[test]
fn test_usage_errors_exit_two() {
    rdvp().assert().code(2);
    rdvp().arg("sharekey").assert().code(2);
    rdvp().args(["serve", "--no-such-flag"]).assert().code(2);
}

#[test]
fn test_help_exits_zero() {
    rdvp()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_serve_with_bad_flag_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rdvp.conf");
    std::fs::write(&path, "unknown-flag 1\n").unwrap();
    rdvp()
        .args(["serve", "-config"])
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown-flag"));
}

#[test]
fn test_serve_with_invalid_listen_fails() {
    rdvp()
        .args(["serve", "-l", "/dns4/example.com/udp/1"])
        .env_remove("RDVP_PK")
        .assert()
        .code(1);
}

#[test]
fn test_different_keys_share_different_ids() {
    let share = |key: &str| {
        let output = rdvp().args(["sharekey", "-pk", key]).output().unwrap();
        assert!(output.status.success());
        output.stdout
    };
    let a = genkey(&["-type", "Ed25519"]);
    let b = genkey(&["-type", "Ed25519"]);
    assert_ne!(share(&a), share(&b));
}
