//! Runs the `sysdig-query` binary.

use std::{path::Path, process::Output};

use anyhow::Context;
use assert_cmd::cargo::CommandCargoExt;
use pretty_assertions::assert_eq;

const BIN: &str = "sysdig-query";

fn run(args: &[&str], workdir: &Path) -> anyhow::Result<Output> {
    let mut cmd = std::process::Command::cargo_bin(BIN)?;
    cmd.args(args)
        .current_dir(workdir)
        .env_remove("SYSDIG_DATASOURCE_CONFIG")
        .env_remove("SYSDIG_API_TOKEN")
        .output()
        .with_context(|| format!("could not run {cmd:?}"))
}

#[test]
fn help() -> anyhow::Result<()> {
    let tmp_dir = tempfile::tempdir()?;
    let output = run(&["--help"], tmp_dir.path())?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("query"));
    assert!(stdout.contains("metrics"));
    Ok(())
}

#[test]
fn regen_config() -> anyhow::Result<()> {
    let tmp_dir = tempfile::tempdir()?;
    let conf = tmp_dir.path().join("config.toml");
    std::fs::write(&conf, "garbage")?;

    let conf_str = conf.to_str().unwrap();
    let output = run(&["--config", conf_str, "config", "regen"], tmp_dir.path())?;
    assert!(output.status.success(), "command should succeed");

    let content = std::fs::read_to_string(&conf)?;
    assert_eq!(content, sysdig_datasource_cli::default_config_string()?);
    Ok(())
}

#[test]
fn missing_config_without_default() -> anyhow::Result<()> {
    let tmp_dir = tempfile::tempdir()?;
    let conf = tmp_dir.path().join("zzzzz.toml");

    let conf_str = conf.to_str().unwrap();
    let output = run(&["--config", conf_str, "--no-default-config", "test"], tmp_dir.path())?;
    assert!(!output.status.success(), "should fail because the config does not exist");
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains(conf_str));
    Ok(())
}

#[test]
fn test_connection() -> anyhow::Result<()> {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/api/login")
        .match_header("authorization", "Bearer abcd")
        .with_status(200)
        .with_body(r#"{"user": {}}"#)
        .create();

    let tmp_dir = tempfile::tempdir()?;
    let conf = tmp_dir.path().join("config.toml");
    let conf_str = conf.to_str().unwrap();
    let url = server.url();
    let output = run(
        &["--config", conf_str, "test", "--url", &url, "--token", "abcd"],
        tmp_dir.path(),
    )?;
    assert!(output.status.success(), "command should succeed");
    assert_eq!(String::from_utf8(output.stdout)?, "Success: Data source is working\n");
    mock.assert();
    Ok(())
}

#[test]
fn rejected_token() -> anyhow::Result<()> {
    let mut server = mockito::Server::new();
    let _mock = server.mock("GET", "/api/login").with_status(401).create();

    let tmp_dir = tempfile::tempdir()?;
    let conf = tmp_dir.path().join("config.toml");
    let conf_str = conf.to_str().unwrap();
    let url = server.url();
    let output = run(&["--config", conf_str, "--url", &url, "test"], tmp_dir.path())?;
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("could not connect"));
    Ok(())
}
