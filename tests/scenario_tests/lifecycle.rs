//! Full rounds: everything comes up, gets probed, and goes away again

use std::time::Duration;

use ekstest_common::ErrorKind;
use ekstest_config::{TestMode, STATUS_DELETE_COMPLETE};

use super::helpers::*;

// =========================================================================
// Up, probes, Down
// =========================================================================

/// Story: an operator runs the whole pipeline in nginx mode. The backend
/// answers with the configured payload, `wrk` reports a clean run, the
/// controller exposes metrics, and Down leaves nothing behind.
#[tokio::test]
async fn story_full_round_probes_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.alb_ingress_controller.enable = true;
    cfg.alb_ingress_controller.test_mode = TestMode::Nginx;
    cfg.alb_ingress_controller.test_response_size = 10;
    let scalability = cfg.alb_ingress_controller.scalability_output_path.clone();
    let metrics = cfg.alb_ingress_controller.metrics_output_path.clone();
    let kubeconfig = cfg.kubeconfig_path.clone();

    let port = serve_backend(10).await;
    let w = world(cfg).await;
    route_ingresses(&w, port);
    let tester = w
        .tester
        .with_timeouts(fast_timeouts())
        .with_addon_timeouts(fast_addon_timeouts())
        .with_http_client(loopback_client(port))
        .with_host_runner(wrk_runner(wrk_output(0)))
        .with_correctness_schedule(20, Duration::from_millis(50));

    tester.run().await.unwrap();

    let state = tester.store().state();
    assert!(!state.any_created(), "{:?}", state.still_created());
    assert_eq!(state.status, STATUS_DELETE_COMPLETE);
    assert!(state.last_error.is_empty());
    assert!(!state.cluster_up_took.is_empty());
    assert_eq!(state.addon.probe.failures, 0);
    assert!((state.addon.probe.requests_per_second - 1200.0).abs() < f64::EPSILON);

    assert!(std::fs::read_to_string(&scalability).unwrap().contains("Requests/sec"));
    assert!(std::fs::read_to_string(&metrics)
        .unwrap()
        .contains("ingress_client_count_success"));
    assert!(!kubeconfig.exists());

    assert_nothing_leaked(&w.cloud);
    assert_eq!(w.cloud.elb_counts(), (0, 0, 0));
    assert!(w.kube.live_objects().is_empty());
}

/// Story: with `down` turned off the cluster is left running and its
/// record still says so, ready for a later `down`.
#[tokio::test]
async fn story_run_without_down_leaves_cluster_for_later() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.down = false;
    let w = world(cfg).await;
    let tester = w.tester.with_timeouts(fast_timeouts());

    tester.run().await.unwrap();
    assert!(tester.store().state().control_plane.created);
    tester.is_up().await.unwrap();

    tester.down().await.unwrap();
    assert!(!tester.store().state().any_created());
    assert_nothing_leaked(&w.cloud);
}

// =========================================================================
// Stopped runs
// =========================================================================

/// Story: the operator interrupts Up while the control plane is still
/// being created. The run ends as cancelled, and everything created up to
/// that point is deleted anyway.
#[tokio::test(start_paused = true)]
async fn story_stop_during_control_plane_wait_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(config(dir.path())).await;

    let cancel = w.tester.cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();
    });

    let err = w.tester.up().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let state = w.tester.store().state();
    assert!(!state.any_created(), "{:?}", state.still_created());
    assert!(!state.last_error.is_empty());
    assert!(w.cloud.created().iter().any(|r| r.starts_with("cluster:")));
    assert_nothing_leaked(&w.cloud);
}

/// A stop during the wait before Down only cuts the wait short
#[tokio::test(start_paused = true)]
async fn test_stop_during_wait_before_down_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.wait_before_down_seconds = 3600;
    let w = world(cfg).await;
    w.tester.up().await.unwrap();

    let cancel = w.tester.cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });
    let started = tokio::time::Instant::now();
    w.tester.down().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3600));
    assert!(!w.tester.store().state().any_created());
    assert_nothing_leaked(&w.cloud);
}
