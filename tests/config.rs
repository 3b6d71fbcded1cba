// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load FCP configuration from explicit paths and the FCP_CONFIG variable.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::net::IpAddr;

use fcp_node::config::{FcpConfig, CONFIG_ENV, DEFAULT_PORT};
use serial_test::serial;
use tempfile::TempDir;

#[test]
#[serial]
fn defaults_apply_without_a_file() {
    std::env::remove_var(CONFIG_ENV);
    let config = FcpConfig::load(None).unwrap();
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.listen_addr(), format!("127.0.0.1:{DEFAULT_PORT}"));
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();
    assert!(config.is_allowed(loopback));
    assert!(config.has_full_access(loopback));
    assert!(!config.is_allowed("10.1.2.3".parse().unwrap()));
}

#[test]
#[serial]
fn environment_names_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fcp.toml");
    fs::write(
        &path,
        "port = 9999\nallowed_hosts = [\"*\"]\nallowed_hosts_full_access = []\nnode_name = \"Testnode\"\n",
    )
    .unwrap();
    std::env::set_var(CONFIG_ENV, &path);
    let loaded = FcpConfig::load(None);
    std::env::remove_var(CONFIG_ENV);
    let config = loaded.unwrap();
    assert_eq!(config.port, 9999);
    let remote: IpAddr = "192.0.2.7".parse().unwrap();
    assert!(config.is_allowed(remote));
    assert!(!config.has_full_access(remote));
    assert_eq!(config.node_info().name, "Testnode");
}

#[test]
#[serial]
fn explicit_path_wins_and_errors_name_the_file() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.toml");
    let bad = dir.path().join("bad.toml");
    fs::write(&good, "bind_to = \"::1\"\nport = 1234\n").unwrap();
    fs::write(&bad, "no_such_option = true\n").unwrap();
    std::env::set_var(CONFIG_ENV, &bad);
    let loaded = FcpConfig::load(Some(good.as_path()));
    std::env::remove_var(CONFIG_ENV);
    assert_eq!(loaded.unwrap().listen_addr(), "[::1]:1234");

    let err = FcpConfig::load(Some(bad.as_path())).unwrap_err();
    assert!(format!("{err:#}").contains("bad.toml"));
}
