use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;

fn xferd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_xferd"))
}

#[test]
fn test_schema_generation() {
    let schema = xferd::protocol::generate_schema();
    assert!(schema.contains("$schema"));
    assert!(schema.contains("request_create"));
}

#[test]
fn test_schema_command() {
    xferd()
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("response_list"));
}

#[test]
fn test_dummy_command_reports_json() -> Result<()> {
    let output = xferd()
        .args(["dummy", "2", "--dummy-interval", "10ms", "--json"])
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    let events: Vec<serde_json::Value> = stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;

    assert_eq!(events.first().map(|e| e["type"].clone()), Some("created".into()));
    let statuses: Vec<_> = events.iter().filter(|e| e["type"] == "status").collect();
    assert_eq!(statuses.len(), 3);
    let last = statuses[2];
    assert_eq!(last["status"]["finished"], true);
    assert_eq!(last["status"]["exit_code"], 0);
    assert_eq!(last["status"]["progress"], 1.0);

    let listing = events.last().unwrap();
    assert_eq!(listing["type"], "operations");
    assert_eq!(listing["operations"][0]["state"], "finished");
    Ok(())
}

#[test]
fn test_missing_transfer_program_exits_with_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    xferd()
        .current_dir(dir.path())
        .args(["copy", "a", "b", "--transfer-program", "/nonexistent/xferd-tool"])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("/nonexistent/xferd-tool"));
    Ok(())
}

#[test]
fn test_bad_config_exits_with_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("xferd.json");
    std::fs::write(&config, r#"{"unknown_key": 1}"#)?;
    xferd()
        .arg("--config")
        .arg(&config)
        .args(["dummy", "1"])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("invalid config"));
    Ok(())
}
