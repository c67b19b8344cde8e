//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

const ENV_VARS: &[&str] = &[
    "HACTARFLASH_PORT",
    "HACTARFLASH_MODE",
    "HACTARFLASH_FIRMWARE",
    "HACTARFLASH_NON_INTERACTIVE",
    "RUST_LOG",
];

/// A command isolated from the caller's environment, run inside `cwd`.
fn cli_cmd_in(cwd: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("hactarflash");
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd.current_dir(cwd);
    cmd
}

fn cli_cmd() -> assert_cmd::Command {
    cli_cmd_in(&std::env::temp_dir())
}

fn write_bundle(root: &Path) {
    fs::write(root.join("ui.bin"), [0x5A; 512]).expect("write ui.bin");
    fs::create_dir_all(root.join("net/bootloader")).expect("create net dir");
    fs::write(
        root.join("net/flasher_args.json"),
        r#"{
            "bootloader": {"offset": "0x0", "file": "bootloader/bootloader.bin"},
            "app": {"offset": "0x10000", "file": "app.bin"}
        }"#,
    )
    .expect("write manifest");
    fs::write(root.join("net/bootloader/bootloader.bin"), [1; 64]).expect("write bootloader");
    fs::write(root.join("net/app.bin"), [2; 4096]).expect("write app");
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("hactarflash"))
        .stdout(predicate::str::contains("Usage"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hactarflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_has_no_color_when_not_a_tty() {
    let output = cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    assert!(!stdout.contains("\x1b["), "help should not be colored");
}

#[test]
fn unknown_command_is_usage_error() {
    cli_cmd()
        .arg("falsh")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("flash"));
}

#[test]
fn unknown_flag_is_usage_error() {
    cli_cmd()
        .args(["list-ports", "--jason"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn list_ports_json_is_clean() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(parsed["ok"], true);
    assert!(parsed["data"]["ports"].is_array());
    assert!(
        output
            .stderr
            .is_empty(),
        "JSON output should not write to stderr"
    );
}

#[test]
fn info_json_lists_bundle_images() {
    let dir = tempdir().expect("tempdir should be created");
    write_bundle(dir.path());

    let output = cli_cmd()
        .arg("info")
        .arg(dir.path())
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .clone();

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    let images = parsed["data"]["images"]
        .as_array()
        .expect("images array");
    let rows: Vec<(&str, &str)> = images
        .iter()
        .map(|i| {
            (
                i["target"].as_str().unwrap_or_default(),
                i["name"].as_str().unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(rows, [("ui", "ui"), ("net", "bootloader"), ("net", "app")]);
    assert_eq!(images[2]["offset"], "0x00010000");
    assert_eq!(images[2]["size"], 4096);
    assert_eq!(
        images[0]["md5"]
            .as_str()
            .map(str::len),
        Some(32)
    );
}

#[test]
fn info_uses_firmware_env_var() {
    let dir = tempdir().expect("tempdir should be created");
    write_bundle(dir.path());

    cli_cmd()
        .env("HACTARFLASH_FIRMWARE", dir.path())
        .args(["info", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bootloader"));
}

#[test]
fn info_missing_directory_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");

    cli_cmd()
        .arg("info")
        .arg("--json")
        .arg(dir.path().join("missing"))
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn flash_with_invalid_mode_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");

    cli_cmd_in(dir.path())
        .args(["--non-interactive", "flash", "--mode", "ui+wifi"])
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("wifi"));
}

#[test]
fn flash_with_missing_bundle_is_config_error() {
    let dir = tempdir().expect("tempdir should be created");

    cli_cmd_in(dir.path())
        .args(["--non-interactive", "flash", "--firmware-dir"])
        .arg(dir.path().join("missing"))
        .assert()
        .failure()
        .code(3);
}

#[test]
fn flash_with_missing_image_is_config_error() {
    let dir = tempdir().expect("tempdir should be created");
    write_bundle(dir.path());

    cli_cmd_in(dir.path())
        .args(["--non-interactive", "flash", "--mode", "mgmt"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("mgmt"));
}

#[test]
fn flash_on_unopenable_port_is_device_error() {
    let dir = tempdir().expect("tempdir should be created");
    write_bundle(dir.path());

    cli_cmd_in(dir.path())
        .args([
            "--non-interactive",
            "--port",
            "INVALID_PORT_NAME_XYZ",
            "flash",
            "--mode",
            "ui",
        ])
        .assert()
        .failure()
        .code(4)
        .stdout(predicate::str::is_empty());
}

#[test]
fn invalid_local_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("hactarflash.toml"), "invalid toml [[[")
        .expect("write invalid config");

    let output = cli_cmd_in(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");
    assert!(
        output
            .status
            .success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Failed to parse config file"),
        "should warn about invalid config: {stderr}"
    );
}

#[test]
fn explicit_config_file_supplies_mode() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir
        .path()
        .join("custom.toml");
    fs::write(&config, "[flash]\nmode = \"bogus\"\n").expect("write config");

    cli_cmd_in(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["--non-interactive", "flash"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("bogus"));
}

#[test]
fn non_interactive_environment_variable_is_accepted() {
    cli_cmd()
        .env("HACTARFLASH_NON_INTERACTIVE", "true")
        .arg("--version")
        .assert()
        .success();
}
