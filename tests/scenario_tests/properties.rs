//! Guarantees that hold for every run

use std::time::Duration;

use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{CancellationToken, ErrorKind};
use ekstest_kube::kubeconfig;
use ekstest_probe::wrk;

use super::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_credential_file_matches_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(config(dir.path())).await;
    w.tester.up().await.unwrap();

    let state = w.tester.store().state();
    let cfg = w.tester.config();
    let doc = std::fs::read_to_string(&cfg.kubeconfig_path).unwrap();
    let params = kubeconfig::parse(&doc).unwrap();
    assert_eq!(params.endpoint, state.endpoint);
    assert_eq!(params.certificate_authority, state.certificate_authority);
    assert_eq!(params.cluster_name, cfg.cluster_name);
    assert_eq!(
        params.authenticator_path.to_str(),
        Some("/usr/bin/aws-iam-authenticator")
    );

    w.tester.down().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_private_key_is_never_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.artifact_bucket = "scenario-artifacts".to_string();
    cfg.upload_tester_logs = true;
    cfg.upload_kubeconfig = true;
    cfg.upload_worker_node_logs = true;
    let kubeconfig_path = cfg.kubeconfig_path.clone();
    let config_path = cfg.config_path.clone();
    let w = world(cfg).await;

    w.tester.up().await.unwrap();
    let key = w.tester.store().state().key_pair.private_key_path;
    assert!(key.exists());
    w.tester.down().await.unwrap();

    let uploads = w.cloud.uploads();
    assert!(uploads.iter().all(|(_, _, path)| *path != key), "{:?}", uploads);
    assert!(uploads.iter().any(|(_, _, path)| *path == kubeconfig_path));
    assert!(uploads.iter().any(|(_, _, path)| *path == config_path));
    assert!(uploads.iter().all(|(bucket, _, _)| bucket == "scenario-artifacts"));
    assert!(!key.exists());
}

#[tokio::test(start_paused = true)]
async fn test_down_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(config(dir.path())).await;
    w.tester.up().await.unwrap();
    w.tester.down().await.unwrap();
    let deleted = w.cloud.deleted().len();

    w.tester.down().await.unwrap();
    assert_eq!(w.cloud.deleted().len(), deleted);
    assert!(!w.tester.store().state().any_created());
}

#[tokio::test(start_paused = true)]
async fn test_poll_gives_up_within_one_interval_of_its_deadline() {
    let every = Duration::from_secs(10);
    let deadline = Duration::from_secs(95);
    let spec = PollSpec::new("never-ready", every, deadline);
    let started = tokio::time::Instant::now();

    let err = poll(&spec, &CancellationToken::new(), || async {
        Ok(Attempt::<()>::Retry("still waiting".to_string()))
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= deadline);
    assert!(started.elapsed() <= deadline + every);
}

#[test]
fn test_wrk_report_ignores_layout_whitespace() {
    let tidy = wrk_output(600);
    let ragged: String = tidy
        .lines()
        .map(|l| format!("\t  {}   \t", l.trim()))
        .collect::<Vec<_>>()
        .join("\n");

    let a = wrk::parse(&tidy).unwrap();
    let b = wrk::parse(&ragged).unwrap();
    assert_eq!(a, b);
    assert_eq!(b.non_2xx, 600);
    assert_eq!(b.requests, 72000);
    assert_eq!(b.connections, 200);
}
