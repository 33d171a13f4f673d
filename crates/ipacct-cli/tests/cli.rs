use std::process::{Command, Output};

use ipacct_test_utils::config::TestConfigFile;
use pretty_assertions::assert_eq;

fn ipacctd(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ipacctd"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run ipacctd")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test_log::test(tokio::test)]
async fn test_config_reports_valid_file() {
    let file = TestConfigFile::with_toml(
        r#"
        [main]
        interval = 60

        [groups.1]
        kind = "ipv4src"

        [groups.2]
        kind = "ipv6dst/64"
        "#,
    )
    .await;
    let path = file.path.to_str().unwrap();

    let output = ipacctd(&["-c", path, "config"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("is valid (2 groups)"));
}

#[test_log::test(tokio::test)]
async fn test_config_show_prints_resolved_toml() {
    let file = TestConfigFile::with_toml("[groups.7]\nkind = \"ipv4dst\"\n").await;
    let path = file.path.to_str().unwrap();

    let output = ipacctd(&["-c", path, "config", "--show"]);

    assert!(output.status.success());
    let shown = stdout(&output);
    assert!(shown.contains("interval = 300"), "{shown}");
    assert!(shown.contains("[groups.7]"), "{shown}");
}

#[test_log::test(tokio::test)]
async fn test_invalid_config_exits_with_error() {
    let file = TestConfigFile::with_toml("[groups.1]\nkind = \"ipv5src\"\n").await;
    let path = file.path.to_str().unwrap();

    let output = ipacctd(&["-c", path, "config"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid configuration"), "{stderr}");
}

#[test_log::test(tokio::test)]
async fn test_run_without_groups_fails() {
    let file = TestConfigFile::with_toml("[main]\ninterval = 5\n").await;
    let path = file.path.to_str().unwrap();

    let output = ipacctd(&["-c", path, "run"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no groups configured"), "{stderr}");
}

#[test]
fn test_plugins_lists_builtins() {
    let output = ipacctd(&["plugins"]);

    assert!(output.status.success());
    let names: Vec<String> = stdout(&output)
        .lines()
        .filter_map(|line| line.split_whitespace().next().map(str::to_string))
        .collect();
    assert_eq!(names, vec!["debug", "spawn"]);
}
