use std::process::Command;

#[test]
fn nodes_command_lists_builtins_and_logs_scan_failures() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_nodeflow"))
        .arg("nodes")
        .current_dir(dir.path())
        .env("NODEFLOW_NODES_PATH", dir.path().join("missing"))
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .env_remove("NODEFLOW_LOG_LEVEL")
        .env_remove("NODEFLOW_OTEL_ENDPOINT")
        .output()
        .unwrap();
    assert!(output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("could not scan node packages"), "{stderr}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("passthrough"), "{stdout}");
    assert!(stdout.contains("catch"), "{stdout}");
}
