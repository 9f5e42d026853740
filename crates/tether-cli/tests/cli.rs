use std::path::Path;

use assert_cmd::Command;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let config = dir.join("config.toml");
    std::fs::write(
        &config,
        format!(
            "[paths]\nsocket_dir = \"{}\"\nregistry_dir = \"{}\"\n",
            dir.join("sockets").display(),
            dir.join("registry").display()
        ),
    )
    .unwrap();
    config
}

fn tether(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tether").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("tether").unwrap().arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for sub in ["create", "attach", "list", "signal", "resize", "destroy", "reap"] {
        assert!(text.contains(sub), "missing {sub} in help");
    }
}

#[test]
fn list_with_no_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = tether(&config).arg("list").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No sessions."));
}

#[test]
fn list_json_is_an_array() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = tether(&config).args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed, serde_json::json!([]));
}

#[test]
fn signal_unknown_session_fails_with_guidance() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = tether(&config)
        .args(["signal", "-s", "nope", "--scope", "abcd", "interrupt"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist or is not running"), "{stderr}");
}

#[test]
fn reap_on_empty_dir_reports_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = tether(&config).arg("reap").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("examined 0, purged 0"));
}

#[test]
fn failure_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = tether(&config)
        .args(["destroy", "-s", "nope", "--scope", "abcd"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.matches("does not exist or is not running").count(), 1, "{stderr}");
    assert_eq!(stderr.lines().filter(|l| !l.trim().is_empty()).count(), 1, "{stderr}");
}
