//! Controller-level lifecycle behaviour: readiness gating and stop
//! escalation, using a fake container engine in front of a loopback server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use blobcheck_core::TargetSpec;
use blobcheck_harness::lifecycle::{ContainerEngine, ContainerStrategy, EngineError, RunRequest};
use blobcheck_harness::{
    Controller, HealthProber, LifecycleState, ProbeConfig, ProbeError, RuntimeEnv, StopTier,
};
use common::{closed_port, serve_health};

/// Publishes every container port on `host_port`; graceful stop never returns.
struct StuckEngine {
    host_port: u16,
    removes: AtomicUsize,
}

#[async_trait]
impl ContainerEngine for StuckEngine {
    async fn run(&self, _request: &RunRequest) -> Result<String, EngineError> {
        Ok("stuck".to_string())
    }

    async fn host_port(&self, _id: &str, _container_port: u16) -> Result<u16, EngineError> {
        Ok(self.host_port)
    }

    async fn stop(&self, _id: &str, _grace: Duration) -> Result<(), EngineError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<(), EngineError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn container_spec(probe_timeout_ms: u64) -> TargetSpec {
    let mut spec: TargetSpec = toml::from_str(&format!(
        r#"
strategy = "container"
image = "blob-server:test"
ports = [3000]
base_url = "http://127.0.0.1:{{0}}"
capabilities = ["core:health"]
stop_timeout_secs = 1
remove_timeout_secs = 2

[probe]
path = "/health"
timeout_ms = {probe_timeout_ms}
interval_ms = 50
"#
    ))
    .expect("target toml");
    spec.name = "container".to_string();
    spec
}

#[tokio::test]
async fn test_hung_graceful_stop_is_forced_and_target_reaches_stopped() {
    let port = serve_health(Duration::ZERO).await;
    let engine = Arc::new(StuckEngine {
        host_port: port,
        removes: AtomicUsize::new(0),
    });
    let controller = Controller::new(RuntimeEnv::default(), 100).expect("controller");
    let strategy = ContainerStrategy::new(engine.clone());

    let mut started = controller
        .start_with(&container_spec(5_000), &strategy)
        .await
        .expect("start");
    assert_eq!(started.state(), LifecycleState::Ready);
    assert_eq!(started.base_url, format!("http://127.0.0.1:{port}"));
    assert_eq!(started.metadata.identifiers["container_id"], "stuck");

    started.mark_running();
    let begun = Instant::now();
    let tier = started.stop().await;
    assert_eq!(tier, Some(StopTier::Forced));
    assert_eq!(started.state(), LifecycleState::Stopped);
    assert_eq!(engine.removes.load(Ordering::SeqCst), 1);
    assert!(begun.elapsed() < Duration::from_secs(3));

    // Idempotent: a second stop does nothing.
    assert_eq!(started.stop().await, None);
    assert_eq!(engine.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_probe_failure_releases_the_container() {
    let engine = Arc::new(StuckEngine {
        host_port: closed_port(),
        removes: AtomicUsize::new(0),
    });
    let controller = Controller::new(RuntimeEnv::default(), 100).expect("controller");
    let strategy = ContainerStrategy::new(engine.clone());

    let err = controller
        .start_with(&container_spec(300), &strategy)
        .await
        .err()
        .expect("startup must fail");
    assert_eq!(err.class(), "startup");
    assert!(err.to_string().contains("not ready"));
    assert_eq!(engine.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_probe_times_out_when_target_is_ready_too_late() {
    let port = serve_health(Duration::from_millis(600)).await;
    let prober = HealthProber::new().expect("prober");
    let config = ProbeConfig {
        expected_status: 200,
        timeout: Duration::from_millis(500),
        interval: Duration::from_millis(250),
        attempt_timeout: Duration::from_millis(2_000),
    };

    let err = prober
        .wait(&format!("http://127.0.0.1:{port}/health"), &config)
        .await
        .unwrap_err();
    match err {
        ProbeError::Timeout { last_error, .. } => assert!(last_error.contains("503")),
        other => panic!("expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_probe_succeeds_once_target_is_ready() {
    let port = serve_health(Duration::from_millis(300)).await;
    let prober = HealthProber::new().expect("prober");
    let config = ProbeConfig {
        expected_status: 200,
        timeout: Duration::from_millis(3_000),
        interval: Duration::from_millis(100),
        attempt_timeout: Duration::from_millis(500),
    };

    let success = prober
        .wait(&format!("http://127.0.0.1:{port}/health"), &config)
        .await
        .expect("ready");
    assert!(success.attempts >= 2);
    assert!(success.elapsed_ms >= 200);
}
