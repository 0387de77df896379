#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn setup_block(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.leaf"));
    cargo_bin_cmd!("leafctl")
        .arg("init")
        .arg(&path)
        .assert()
        .success();
    (dir, path)
}

fn put(path: &Path, key: &str, value: &str) {
    cargo_bin_cmd!("leafctl")
        .args(["put"])
        .arg(path)
        .args([key, value])
        .assert()
        .success();
}

fn json_of(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("leafctl")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn init_writes_one_default_block() {
    let (_dir, path) = setup_block("init");
    assert_eq!(fs::metadata(&path).expect("metadata").len(), 4096);
    cargo_bin_cmd!("leafctl")
        .arg("init")
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn put_then_get_round_trips() {
    let (_dir, path) = setup_block("get");
    put(&path, "alpha", "one");
    put(&path, "beta", "two");
    let output = cargo_bin_cmd!("leafctl")
        .args(["--format", "json", "get"])
        .arg(&path)
        .arg("beta")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["value"], "two");
    assert_eq!(json["timestamp"], 2);

    cargo_bin_cmd!("leafctl")
        .arg("get")
        .arg(&path)
        .arg("gamma")
        .assert()
        .code(2);
}

#[test]
fn del_is_reported_by_dump() {
    let (_dir, path) = setup_block("dump");
    put(&path, "alpha", "one");
    put(&path, "beta", "two");
    cargo_bin_cmd!("leafctl")
        .arg("del")
        .arg(&path)
        .arg("alpha")
        .assert()
        .success();

    let json = json_of(&["dump", "--since", "2"], &path);
    let events = json["events"].as_array().expect("events array");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "deletion");
    assert_eq!(events[0]["key"], "alpha");
    assert_eq!(events[0]["timestamp"], 3);

    let json = json_of(&["dump"], &path);
    let entries: Vec<&str> = json["events"]
        .as_array()
        .expect("events array")
        .iter()
        .filter(|event| event["event"] == "entry")
        .filter_map(|event| event["key"].as_str())
        .collect();
    assert_eq!(entries, vec!["beta"]);
}

#[test]
fn erase_leaves_no_deletion() {
    let (_dir, path) = setup_block("erase");
    put(&path, "alpha", "one");
    cargo_bin_cmd!("leafctl")
        .arg("erase")
        .arg(&path)
        .arg("alpha")
        .assert()
        .success();
    let json = json_of(&["dump"], &path);
    assert!(json["events"].as_array().expect("events array").is_empty());
}

#[test]
fn fsck_checks_bounds() {
    let (_dir, path) = setup_block("fsck");
    put(&path, "m", "x");
    let json = json_of(&["fsck", "--left", "a", "--right", "z"], &path);
    assert_eq!(json["ok"], true);

    cargo_bin_cmd!("leafctl")
        .args(["fsck", "--right", "m"])
        .arg(&path)
        .assert()
        .code(2);
}

#[test]
fn fsck_flags_corrupted_block() {
    let (_dir, path) = setup_block("corrupt");
    put(&path, "alpha", "one");
    let mut bytes = fs::read(&path).expect("read block");
    // Flags byte of the only history record.
    let flags = bytes.len() - 9;
    bytes[flags] = 0x7f;
    fs::write(&path, &bytes).expect("write block");
    cargo_bin_cmd!("leafctl")
        .arg("fsck")
        .arg(&path)
        .assert()
        .code(2);
}

#[test]
fn config_selects_fixed_values_and_hex() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("leaf.toml");
    fs::write(
        &config,
        "block_size = 2048\n[value]\nkind = \"fixed\"\nlen = 2\n",
    )
    .expect("write config");
    let path = dir.path().join("fixed.leaf");
    cargo_bin_cmd!("leafctl")
        .arg("--config")
        .arg(&config)
        .arg("init")
        .arg(&path)
        .assert()
        .success();
    assert_eq!(fs::metadata(&path).expect("metadata").len(), 2048);

    cargo_bin_cmd!("leafctl")
        .arg("--config")
        .arg(&config)
        .args(["--hex", "put"])
        .arg(&path)
        .args(["00ff", "abcd"])
        .assert()
        .success();
    cargo_bin_cmd!("leafctl")
        .arg("--config")
        .arg(&config)
        .args(["put"])
        .arg(&path)
        .args(["k", "toolong"])
        .assert()
        .failure();

    let output = cargo_bin_cmd!("leafctl")
        .arg("--config")
        .arg(&config)
        .args(["--hex", "get"])
        .arg(&path)
        .arg("00ff")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output).trim(), "abcd");
}

#[test]
fn usage_and_print_describe_block() {
    let (_dir, path) = setup_block("usage");
    put(&path, "alpha", "one");
    let json = json_of(&["usage"], &path);
    assert_eq!(json["num_pairs"], 1);
    assert_eq!(json["block_size"], 4096);
    assert_eq!(json["history_records"], 1);

    let output = cargo_bin_cmd!("leafctl")
        .arg("print")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.starts_with("leaf: 1 pairs"), "{text}");
    assert!(text.contains(&hex::encode("alpha")), "{text}");
}
