//! Runs where something goes wrong, and what is left afterwards

use std::time::Duration;

use ekstest_common::ErrorKind;
use ekstest_config::TestMode;

use super::helpers::*;

// =========================================================================
// Provider and node failures during Up
// =========================================================================

/// Story: the control plane never leaves CREATING. Up gives up at its
/// deadline with a timeout and the resources created before it are gone.
#[tokio::test(start_paused = true)]
async fn story_control_plane_never_active_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let w = world(config(dir.path())).await;
    w.cloud.set_stuck_cluster_status("CREATING");

    let err = w.tester.up().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let state = w.tester.store().state();
    assert!(!state.any_created(), "{:?}", state.still_created());
    assert!(!state.last_error.is_empty());
    assert!(!w.cloud.created().iter().any(|r| r.ends_with("NODE-GROUP-STACK")));
    assert_nothing_leaked(&w.cloud);
}

/// Story: worker instances boot but never register as ready nodes. The
/// join wait times out, worker log collection finds nothing reachable,
/// and the rollback still removes the node group.
#[tokio::test(start_paused = true)]
async fn story_workers_never_join() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.upload_worker_node_logs = true;
    let asg_max = cfg.worker_node_asg_max as usize;
    let w = world(cfg).await;
    w.kube.set_nodes(asg_max, false);

    let err = w.tester.up().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let state = w.tester.store().state();
    assert!(state.worker_logs.is_empty());
    assert!(!state.any_created(), "{:?}", state.still_created());
    assert!(w.cloud.deleted().iter().any(|r| r.ends_with("NODE-GROUP-STACK")));
    assert_nothing_leaked(&w.cloud);
}

// =========================================================================
// Probe failures
// =========================================================================

/// Story: `wrk` sees more failed responses than the error budget allows.
/// The run reports a probe assertion, and Down still runs to completion.
#[tokio::test]
async fn story_throughput_over_budget_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.alb_ingress_controller.enable = true;
    cfg.alb_ingress_controller.test_mode = TestMode::Nginx;
    cfg.alb_ingress_controller.test_response_size = 10;
    cfg.alb_ingress_controller.test_client_error_threshold = 500;

    let port = serve_backend(10).await;
    let w = world(cfg).await;
    route_ingresses(&w, port);
    let tester = w
        .tester
        .with_timeouts(fast_timeouts())
        .with_addon_timeouts(fast_addon_timeouts())
        .with_http_client(loopback_client(port))
        .with_host_runner(wrk_runner(wrk_output(600)))
        .with_correctness_schedule(20, Duration::from_millis(50));

    let err = tester.run().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProbeAssertion);

    let state = tester.store().state();
    assert_eq!(state.addon.probe.failures, 600);
    assert!(!state.any_created(), "{:?}", state.still_created());
    assert_nothing_leaked(&w.cloud);
    assert!(w.kube.live_objects().is_empty());
}

/// A backend serving the wrong payload fails correctness, not the run's cleanup
#[tokio::test]
async fn test_wrong_payload_fails_correctness() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.alb_ingress_controller.enable = true;
    cfg.alb_ingress_controller.test_mode = TestMode::Nginx;
    cfg.alb_ingress_controller.test_response_size = 10;
    cfg.alb_ingress_controller.test_scalability = false;
    cfg.alb_ingress_controller.test_metrics = false;

    let port = serve_backend(7).await;
    let w = world(cfg).await;
    route_ingresses(&w, port);
    let tester = w
        .tester
        .with_timeouts(fast_timeouts())
        .with_addon_timeouts(fast_addon_timeouts())
        .with_http_client(loopback_client(port))
        .with_correctness_schedule(3, Duration::from_millis(10));

    let err = tester.run().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProbeAssertion);
    assert!(err.to_string().contains("expected 10"));
    assert!(!tester.store().state().any_created());
    assert_nothing_leaked(&w.cloud);
}
