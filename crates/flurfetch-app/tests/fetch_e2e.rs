//! End-to-end integration tests for the download pipeline.
//!
//! Each test drives the full flow against a wiremock server:
//! 1. Work list: records are read from the catalog CSV
//! 2. Job creation: one remote job per outstanding record
//! 3. Polling: status probes with growing backoff until terminal
//! 4. Retrieval: finished archives land under deterministic names
//! 5. Ledger: one appended row per terminal job
//!
//! Backoff delays are shrunk to milliseconds so the polling loops finish
//! quickly without changing their shape.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path, query_param},
};

use flurfetch_app::download::{FetchClient, FetchError, FetchOptions, FetchPipeline};

struct Workspace {
    _dir: TempDir,
    catalog: PathBuf,
    ledger: PathBuf,
    download_dir: PathBuf,
}

/// Lay out a catalog CSV plus empty download directory in a tempdir.
fn workspace(rows: &[(&str, &str)]) -> Workspace {
    let dir = TempDir::new().expect("failed to create temp dir");
    let catalog = dir.path().join("responses.csv");
    let ledger = dir.path().join("download_ids.csv");
    let download_dir = dir.path().join("download");

    let mut contents = String::from("flur,ogc_fid\n");
    for (flur, ogc_fid) in rows {
        contents.push_str(&format!("{flur},{ogc_fid}\n"));
    }
    fs::write(&catalog, contents).expect("failed to write catalog");

    Workspace {
        _dir: dir,
        catalog,
        ledger,
        download_dir,
    }
}

fn options(ws: &Workspace) -> FetchOptions {
    FetchOptions::builder()
        .catalog_path(&ws.catalog)
        .ledger_path(&ws.ledger)
        .download_dir(&ws.download_dir)
        .initial_wait_secs(0.01)
        .backoff_multiplier(1.0)
        .chunk_pause_secs(0.0)
        .build()
}

fn pipeline(server: &MockServer, ws: &Workspace) -> FetchPipeline {
    let client = FetchClient::new(&format!("{}/", server.uri())).expect("valid base URL");
    FetchPipeline::new(client, options(ws)).expect("valid options")
}

async fn mount_job_creation(server: &MockServer, ogc_fid: &str, job_id: &str) {
    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "start"))
        .and(query_param("id", ogc_fid))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"{{"success": true, "id": "{job_id}"}}"#
        )))
        .mount(server)
        .await;
}

async fn mount_done(server: &MockServer, job_id: &str, download_url: &str) {
    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "status"))
        .and(query_param("job", job_id))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"{{"status": "done", "downloadUrl": "{download_url}"}}"#
        )))
        .mount(server)
        .await;
}

async fn mount_archive(server: &MockServer, url_path: &str, bytes: &[u8]) {
    Mock::given(method("GET"))
        .and(path(url_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.to_vec()))
        .mount(server)
        .await;
}

fn ledger_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("ledger must exist")
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn downloads_all_records_and_records_attempts() {
    let server = MockServer::start().await;
    let ws = workspace(&[("12", "7"), ("12", "8")]);

    mount_job_creation(&server, "7", "100").await;
    mount_job_creation(&server, "8", "101").await;

    // Job 100 answers "wait" once before completing; job 101 completes
    // immediately. Mount order matters: the exhausted wait mock stops
    // matching and the done mock takes over.
    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "status"))
        .and(query_param("job", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status": "wait"}"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_done(&server, "100", &format!("{}/files/100.zip", server.uri())).await;
    mount_done(&server, "101", &format!("{}/files/101.zip", server.uri())).await;
    mount_archive(&server, "/files/100.zip", b"archive-100").await;
    mount_archive(&server, "/files/101.zip", b"archive-101").await;

    let summary = pipeline(&server, &ws).run().await.expect("run must succeed");

    assert_eq!(summary.requested, 2);
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.rejected, 0);
    assert_eq!(summary.skipped_completed, 0);

    let first = ws
        .download_dir
        .join("ogc_fid-7_flur-12_downloadID-100.zip");
    let second = ws
        .download_dir
        .join("ogc_fid-8_flur-12_downloadID-101.zip");
    assert_eq!(fs::read(&first).unwrap(), b"archive-100");
    assert_eq!(fs::read(&second).unwrap(), b"archive-101");

    let lines = ledger_lines(&ws.ledger);
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "Download ID,OGC FID,Flur,Download Status,Download Attempts,Download Time"
    );
    // Job 100 burned one attempt on "wait" before succeeding.
    assert!(lines[1].starts_with("100,7,12,Success,2,"));
    assert!(lines[2].starts_with("101,8,12,Success,1,"));
}

#[tokio::test]
async fn restart_skips_completed_records_without_touching_the_service() {
    let server = MockServer::start().await;
    let ws = workspace(&[("12", "7"), ("12", "8")]);

    // Ledger from a previous run already marks (12, 7) as done.
    fs::write(
        &ws.ledger,
        "Download ID,OGC FID,Flur,Download Status,Download Attempts,Download Time\n\
         100,7,12,Success,3,2026-08-20T10-00-00\n",
    )
    .unwrap();

    // The completed record must cause zero job creations.
    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "start"))
        .and(query_param("id", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success": true, "id": "999"}"#))
        .expect(0)
        .mount(&server)
        .await;

    mount_job_creation(&server, "8", "101").await;
    mount_done(&server, "101", &format!("{}/files/101.zip", server.uri())).await;
    mount_archive(&server, "/files/101.zip", b"archive-101").await;

    let summary = pipeline(&server, &ws).run().await.expect("run must succeed");

    assert_eq!(summary.skipped_completed, 1);
    assert_eq!(summary.requested, 1);
    assert_eq!(summary.downloaded, 1);

    // Earlier rows are untouched; the new outcome is appended after them.
    let lines = ledger_lines(&ws.ledger);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1], "100,7,12,Success,3,2026-08-20T10-00-00");
    assert!(lines[2].starts_with("101,8,12,Success,1,"));
}

#[tokio::test]
async fn rejected_job_creation_skips_record_and_continues() {
    let server = MockServer::start().await;
    let ws = workspace(&[("12", "7"), ("12", "8")]);

    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "start"))
        .and(query_param("id", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success": false}"#))
        .mount(&server)
        .await;

    mount_job_creation(&server, "8", "101").await;
    mount_done(&server, "101", &format!("{}/files/101.zip", server.uri())).await;
    mount_archive(&server, "/files/101.zip", b"archive-101").await;

    let summary = pipeline(&server, &ws).run().await.expect("run must succeed");

    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.requested, 1);
    assert_eq!(summary.downloaded, 1);

    // Rejected records leave no ledger row, so a later run retries them.
    let lines = ledger_lines(&ws.ledger);
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("101,8,12,Success,1,"));
}

#[tokio::test]
async fn malformed_status_body_is_retried_after_backoff() {
    let server = MockServer::start().await;
    let ws = workspace(&[("12", "7")]);

    mount_job_creation(&server, "7", "100").await;

    // First probe gets an HTML error page instead of JSON.
    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "status"))
        .and(query_param("job", "100"))
        .respond_with(
            ResponseTemplate::new(500).set_body_string("<html><body>Server Error</body></html>"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_done(&server, "100", &format!("{}/files/100.zip", server.uri())).await;
    mount_archive(&server, "/files/100.zip", b"archive-100").await;

    let summary = pipeline(&server, &ws).run().await.expect("run must succeed");

    assert_eq!(summary.downloaded, 1);
    let lines = ledger_lines(&ws.ledger);
    // The malformed probe consumed an attempt before the successful one.
    assert!(lines[1].starts_with("100,7,12,Success,2,"));
}

#[tokio::test]
async fn unknown_terminal_status_records_failure_and_run_continues() {
    let server = MockServer::start().await;
    let ws = workspace(&[("12", "7"), ("12", "8")]);

    mount_job_creation(&server, "7", "100").await;
    mount_job_creation(&server, "8", "101").await;

    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "status"))
        .and(query_param("job", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status": "error"}"#))
        .mount(&server)
        .await;
    mount_done(&server, "101", &format!("{}/files/101.zip", server.uri())).await;
    mount_archive(&server, "/files/101.zip", b"archive-101").await;

    let summary = pipeline(&server, &ws).run().await.expect("run must succeed");

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.downloaded, 1);

    let lines = ledger_lines(&ws.ledger);
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("100,7,12,Failed,1,"));
    assert!(lines[2].starts_with("101,8,12,Success,1,"));
}

#[tokio::test]
async fn exceeding_the_attempt_ceiling_aborts_the_whole_run() {
    let server = MockServer::start().await;
    let ws = workspace(&[("12", "7"), ("12", "8")]);

    mount_job_creation(&server, "7", "100").await;
    mount_job_creation(&server, "8", "101").await;

    // Job 100 never finishes.
    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "status"))
        .and(query_param("job", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status": "wait"}"#))
        .mount(&server)
        .await;

    // The abort must happen before job 101 is ever polled.
    Mock::given(method("GET"))
        .and(path("/multi.php"))
        .and(query_param("action", "status"))
        .and(query_param("job", "101"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status": "done"}"#))
        .expect(0)
        .mount(&server)
        .await;

    let client = FetchClient::new(&format!("{}/", server.uri())).expect("valid base URL");
    let options = FetchOptions::builder()
        .catalog_path(&ws.catalog)
        .ledger_path(&ws.ledger)
        .download_dir(&ws.download_dir)
        .initial_wait_secs(0.01)
        .backoff_multiplier(1.0)
        .attempt_ceiling(3)
        .chunk_pause_secs(0.0)
        .build();

    let err = FetchPipeline::new(client, options)
        .expect("valid options")
        .run()
        .await
        .expect_err("run must abort");
    match err {
        FetchError::AttemptsExhausted { job_id, attempts } => {
            assert_eq!(job_id, "100");
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected error: {other}"),
    }

    // No terminal outcome was reached, so nothing was recorded.
    assert!(!ws.ledger.exists());
}

#[tokio::test]
async fn relative_download_url_is_joined_onto_the_base() {
    let server = MockServer::start().await;
    let ws = workspace(&[("960", "18171")]);

    mount_job_creation(&server, "18171", "42").await;
    mount_done(&server, "42", "files/42.zip").await;
    mount_archive(&server, "/files/42.zip", b"relative").await;

    let summary = pipeline(&server, &ws).run().await.expect("run must succeed");

    assert_eq!(summary.downloaded, 1);
    let archive = ws
        .download_dir
        .join("ogc_fid-18171_flur-960_downloadID-42.zip");
    assert_eq!(fs::read(&archive).unwrap(), b"relative");
}
