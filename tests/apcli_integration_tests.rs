//! Integration tests for the apcli binary
//!
//! apcli only reads configuration and renders text, so these run without
//! root and without touching the host.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn apcli() -> Command {
    Command::cargo_bin("apcli").unwrap()
}

fn write_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("apctl.toml");
    let content = format!(
        r#"
base_network = "192.168.120.0/24"
country_code = "DE"

[paths]
runtime_dir = "{}"

[[networks]]
net_id = "ap-01"
interface = "wlan0"

[[networks]]
net_id = "ap-02"
interface = "wlan1"
"#,
        dir.path().display()
    );
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_help() {
    apcli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("render-ap"))
        .stdout(predicate::str::contains("tx-levels"));
}

#[test]
fn test_check_lists_subnets() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    apcli()
        .arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK (2 networks)"))
        .stdout(predicate::str::contains("192.168.120.0/24"))
        .stdout(predicate::str::contains("192.168.121.0/24"))
        .stdout(predicate::str::contains("192.168.121.1"));
}

#[test]
fn test_check_json() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let output = apcli()
        .args(["--json", "check", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["valid"], true);
    assert_eq!(value["upstream_interface"], "auto");
    assert_eq!(value["networks"].as_array().unwrap().len(), 2);
}

#[test]
fn test_check_rejects_duplicate_interface() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(
        &path,
        r#"
base_network = "192.168.120.0/24"

[[networks]]
net_id = "ap-01"
interface = "wlan0"

[[networks]]
net_id = "ap-02"
interface = "wlan0"
"#,
    )
    .unwrap();

    apcli()
        .arg("--config")
        .arg(&path)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("more than one network"));
}

#[test]
fn test_missing_config_fails() {
    apcli()
        .args(["--config", "/nonexistent/apctl.toml", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_render_ap_wpa2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    apcli()
        .arg("--config")
        .arg(&config)
        .args(["render-ap", "ap-02", "--ssid", "LabNet", "--channel", "36", "--band", "5ghz"])
        .args(["--password", "testpass123"])
        .assert()
        .success()
        .stdout(predicate::str::contains("interface=wlan1"))
        .stdout(predicate::str::contains("hw_mode=a"))
        .stdout(predicate::str::contains("country_code=DE"))
        .stdout(predicate::str::contains("wpa_passphrase=testpass123"));
}

#[test]
fn test_render_ap_open_has_no_passphrase() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    apcli()
        .arg("--config")
        .arg(&config)
        .args(["render-ap", "ap-01", "--ssid", "Guest", "--channel", "6", "--encryption", "open"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ssid=Guest"))
        .stdout(predicate::str::contains("wpa_passphrase").not());
}

#[test]
fn test_render_ap_rejects_band_mismatch() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    apcli()
        .arg("--config")
        .arg(&config)
        .args(["render-ap", "ap-01", "--ssid", "LabNet", "--channel", "1", "--band", "5ghz"])
        .args(["--password", "testpass123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Validation failed"));
}

#[test]
fn test_render_ap_unknown_network() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    apcli()
        .arg("--config")
        .arg(&config)
        .args(["render-ap", "ap-09", "--ssid", "LabNet", "--channel", "6", "--password", "testpass123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown network: ap-09"));
}

#[test]
fn test_render_dhcp_json() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    apcli()
        .arg("--config")
        .arg(&config)
        .args(["--json", "render-dhcp", "ap-02"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dnsmasq-ap-02.conf"))
        .stdout(predicate::str::contains(
            "dhcp-range=192.168.121.10,192.168.121.250,255.255.255.0",
        ));
}

#[test]
fn test_tx_levels() {
    apcli()
        .args(["tx-levels", "--max-dbm", "20"])
        .assert()
        .success()
        .stdout(predicate::str::contains("level 1: 5.0 dBm (500 mBm)"))
        .stdout(predicate::str::contains("level 4: 20.0 dBm (2000 mBm)"));
}

#[test]
fn test_tx_levels_rejects_zero() {
    apcli()
        .args(["tx-levels", "--max-dbm", "0"])
        .assert()
        .failure();
}
