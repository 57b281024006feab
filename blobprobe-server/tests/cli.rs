//! End-to-end runs of the `blobprobe` binary.

use std::io::Write;
use std::process::{Command, Output};

use blobprobe_test::server::{ACCOUNT, ACCOUNT_KEY, BEARER_TOKEN, TestServer};
use serde_json::Value;

/// The binary with a clean environment, so that the host configuration does not leak in.
fn blobprobe() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_blobprobe"));
    command.env_clear().env("RUST_LOG", "debug");
    command
}

fn record(output: &Output) -> Value {
    let stdout = String::from_utf8(output.stdout.clone()).unwrap();
    let mut lines = stdout.lines();
    let record = serde_json::from_str(lines.next().expect("no record on stdout")).unwrap();
    assert_eq!(lines.next(), None, "stdout must hold the record only");
    record
}

async fn run(mut command: Command) -> Output {
    tokio::task::spawn_blocking(move || command.output().unwrap())
        .await
        .unwrap()
}

#[test]
fn dry_run_in_memory() {
    let output = blobprobe()
        .env("BLOBPROBE__STORAGE__TYPE", "memory")
        .env("BLOBPROBE__PAYLOAD_SIZE", "2MiB")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));

    let record = record(&output);
    assert_eq!(record["outcome"], "success");
    let size = record["file_size_bytes"].as_u64().unwrap();
    assert!(size <= 2 * 1024 * 1024 && size > 2 * 1024 * 1024 - 8 * 1024);
    let size_mb = record["file_size_mb"].as_f64().unwrap();
    assert!((1.99..=2.0).contains(&size_mb));
    assert_eq!(record["backend"], "memory");
    assert_eq!(record["container"], "performance-test");
    assert_eq!(record["cleanup_failed"], false);
    assert!(record["test_id"].as_str().unwrap().starts_with("test_"));
    for field in [
        "upload_time_ms",
        "sas_generation_time_ms",
        "download_time_ms",
        "total_time_ms",
        "upload_to_download_time_ms",
    ] {
        assert!(record[field].as_f64().unwrap() >= 0.0, "{field}");
    }

    // Logs go to stderr.
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Performance Test Results"));
}

#[test]
fn config_file() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    config
        .write_all(
            br#"
            storage:
                type: memory
                container: from-file
            max_payload_size: 64KiB
            logging:
                format: json
            "#,
        )
        .unwrap();

    let output = blobprobe().arg("-c").arg(config.path()).output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    let record = record(&output);
    assert_eq!(record["container"], "from-file");
    assert!(record["file_size_bytes"].as_u64().unwrap() <= 64 * 1024);
}

#[test]
fn missing_account() {
    let output = blobprobe().output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("AZURE_STORAGE_ACCOUNT_NAME"));
}

#[test]
fn missing_config_file() {
    let output = blobprobe()
        .args(["--config", "/nonexistent/blobprobe.yml"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[test]
fn version() {
    let output = blobprobe().arg("--version").output().unwrap();

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        String::from_utf8(output.stdout).unwrap().trim(),
        env!("CARGO_PKG_VERSION")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn run_against_azure_endpoint() {
    let server = TestServer::new().await;

    let mut command = blobprobe();
    command
        .env("AZURE_STORAGE_ACCOUNT_NAME", ACCOUNT)
        .env("AZURE_STORAGE_ACCOUNT_ENDPOINT", server.endpoint())
        .env("AZURE_STORAGE_ACCOUNT_KEY", ACCOUNT_KEY)
        .env("BLOBPROBE__MAX_PAYLOAD_SIZE", "256KiB");
    let output = run(command).await;

    assert_eq!(output.status.code(), Some(0), "{output:?}");
    let record = record(&output);
    assert_eq!(record["outcome"], "success");
    assert_eq!(record["backend"], "azure");
    assert_eq!(server.blob_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn access_token_cannot_sign() {
    let server = TestServer::new().await;

    let mut command = blobprobe();
    command
        .env("AZURE_STORAGE_ACCOUNT_NAME", ACCOUNT)
        .env("AZURE_STORAGE_ACCOUNT_ENDPOINT", server.endpoint())
        .env("AZURE_STORAGE_ACCESS_TOKEN", BEARER_TOKEN)
        .env("BLOBPROBE__PAYLOAD_SIZE", "1KiB");
    let output = run(command).await;

    assert_eq!(output.status.code(), Some(3));
    let record = record(&output);
    assert_eq!(record["outcome"], "sas_failed");
    assert!(record["upload_time_ms"].is_number());
    assert!(record["sas_generation_time_ms"].is_null());
    assert!(record["error"].is_string());
    assert_eq!(server.blob_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_upload() {
    let server = TestServer::new().await;
    server.reject_writes(true);

    let mut command = blobprobe();
    command
        .env("AZURE_STORAGE_ACCOUNT_NAME", ACCOUNT)
        .env("AZURE_STORAGE_ACCOUNT_ENDPOINT", server.endpoint())
        .env("AZURE_STORAGE_ACCOUNT_KEY", ACCOUNT_KEY)
        .env("BLOBPROBE__PAYLOAD_SIZE", "1KiB");
    let output = run(command).await;

    assert_eq!(output.status.code(), Some(2));
    assert_eq!(record(&output)["outcome"], "upload_failed");
}
