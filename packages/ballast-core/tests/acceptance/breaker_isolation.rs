use std::{sync::Arc, time::Duration};

use ballast_core::{CircuitState, telemetry};
use ballast_testkit::{ScriptedCall, breaker_config};

#[tokio::test]
async fn tripped_breaker_rejects_without_touching_the_dependency() {
	let mut cfg = breaker_config();

	cfg.failure_threshold = 3;

	let (breaker, metrics) = super::breaker_with("pinecone", cfg);
	let dependency = ScriptedCall::new([false, false, false]);

	for _ in 0..3 {
		breaker.call(|| dependency.invoke()).await.expect_err("call should fail");
	}

	assert_eq!(breaker.state(), CircuitState::Open);

	let err = breaker.call(|| dependency.invoke()).await.expect_err("call should be rejected");

	assert!(err.is_open());
	assert_eq!(dependency.invocations(), 3);
	assert_eq!(metrics.counter_total_with(telemetry::BREAKER_REJECTED_TOTAL, "breaker", "pinecone"), 1);
	assert_eq!(metrics.counter_total_with(telemetry::BREAKER_FAILURE_TOTAL, "breaker", "pinecone"), 3);

	let stats = breaker.stats();

	assert_eq!(stats.total_failures, 3);
	assert_eq!(stats.total_rejected, 1);
	assert!(stats.opened_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_through_half_open_probes() {
	let mut cfg = breaker_config();

	cfg.failure_threshold = 3;
	cfg.cooldown_ms = 1_000;
	cfg.success_threshold = 2;

	let (breaker, metrics) = super::breaker_with("reviewer", cfg);
	let dependency = ScriptedCall::new([false, false, false, true, true]);

	for _ in 0..3 {
		breaker.call(|| dependency.invoke()).await.expect_err("call should fail");
	}

	assert!(!breaker.can_execute());

	tokio::time::sleep(Duration::from_millis(1_001)).await;

	assert!(breaker.can_execute());
	assert_eq!(breaker.state(), CircuitState::HalfOpen);

	breaker.call(|| dependency.invoke()).await.expect("first probe failed");

	assert_eq!(breaker.state(), CircuitState::HalfOpen);

	breaker.call(|| dependency.invoke()).await.expect("second probe failed");

	assert_eq!(breaker.state(), CircuitState::Closed);
	assert_eq!(dependency.invocations(), 5);
	assert_eq!(
		metrics.counter_total_with(telemetry::BREAKER_STATE_CHANGE_TOTAL, "to", "CLOSED"),
		1
	);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_the_breaker() {
	let mut cfg = breaker_config();

	cfg.failure_threshold = 3;
	cfg.cooldown_ms = 1_000;

	let (breaker, _metrics) = super::breaker_with("pinecone", cfg);
	let dependency = ScriptedCall::new([false, false, false, false]);

	for _ in 0..3 {
		breaker.call(|| dependency.invoke()).await.expect_err("call should fail");
	}

	tokio::time::sleep(Duration::from_millis(1_001)).await;

	let err = breaker.call(|| dependency.invoke()).await.expect_err("probe should fail");

	assert!(!err.is_open());

	let stats = breaker.stats();

	assert_eq!(stats.state, CircuitState::Open);
	assert_eq!(stats.consecutive_failures, 1);
	assert_eq!(dependency.invocations(), 4);
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_a_single_probe_at_a_time() {
	let mut cfg = breaker_config();

	cfg.failure_threshold = 1;
	cfg.cooldown_ms = 1_000;
	cfg.success_threshold = 1;

	let (breaker, _metrics) = super::breaker_with("pinecone", cfg);
	let dependency = Arc::new(ScriptedCall::new([false]));

	breaker.call(|| dependency.invoke()).await.expect_err("call should fail");
	tokio::time::sleep(Duration::from_millis(1_001)).await;

	let probe = {
		let breaker = breaker.clone();

		tokio::spawn(async move {
			breaker
				.call(|| async {
					tokio::time::sleep(Duration::from_millis(100)).await;

					Ok::<_, ballast_testkit::ScriptedError>(())
				})
				.await
		})
	};

	tokio::time::sleep(Duration::from_millis(10)).await;

	// The probe slot is taken; a second caller is rejected as if open.
	let err = breaker.call(|| dependency.invoke()).await.expect_err("second call should be rejected");

	assert!(err.is_open());
	assert_eq!(dependency.invocations(), 1);

	probe.await.expect("join failed").expect("probe failed");

	assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn dependency_errors_pass_through_unchanged() {
	let (breaker, _metrics) = super::breaker_with("reviewer", breaker_config());
	let dependency = ScriptedCall::new([false]);
	let err = breaker.call(|| dependency.invoke()).await.expect_err("call should fail");
	let inner = err.into_inner().expect("expected the dependency error");

	assert_eq!(inner.to_string(), "Scripted dependency failure.");
}
