use std::time::Duration;

use ballast_core::{AdmissionRequest, telemetry};
use ballast_testkit::admission_config;

#[tokio::test]
async fn sixth_user_is_rejected_when_global_capacity_is_exhausted() {
	let mut cfg = admission_config();

	cfg.max_concurrent_per_user = 10;
	cfg.max_queue_per_user = 10;
	cfg.max_concurrent_global = 5;
	cfg.max_queue_global = 0;

	let (controller, metrics) = super::controller_with(cfg);
	let mut contexts = Vec::new();

	for user in ["u1", "u2", "u3", "u4", "u5"] {
		let ctx = controller.check_limits(AdmissionRequest::new(user)).expect("admission failed");

		assert!(ctx.is_started());

		contexts.push(ctx);
	}

	let err = controller
		.check_limits(AdmissionRequest::new("u6"))
		.expect_err("sixth user should be rejected");

	assert!(err.to_string().contains("Global queue is full."));
	// Empty global queue, so the drain estimate floors at one second.
	assert_eq!(err.retry_after_secs(), Some(1));

	let stats = controller.stats();

	assert_eq!(stats.global_concurrent, 5);
	assert_eq!(stats.global_queued, 0);
	assert_eq!(
		metrics.counter_total_with(
			telemetry::ADMISSION_REJECTED_TOTAL,
			"reason",
			"global_queue_full"
		),
		1
	);

	for ctx in &contexts {
		controller.release(ctx);
	}

	assert_eq!(controller.stats().global_concurrent, 0);
}

#[tokio::test(start_paused = true)]
async fn globally_queued_request_starts_after_a_release() {
	let mut cfg = admission_config();

	cfg.max_concurrent_per_user = 4;
	cfg.max_queue_per_user = 4;
	cfg.max_concurrent_global = 1;
	cfg.max_queue_global = 4;
	cfg.queue_timeout_ms = 60_000;

	let (controller, _metrics) = super::controller_with(cfg);
	let running =
		controller.check_limits(AdmissionRequest::new("alice")).expect("admission failed");
	let waiter = {
		let controller = controller.clone();

		tokio::spawn(async move { controller.acquire(AdmissionRequest::new("bob")).await })
	};

	tokio::time::sleep(Duration::from_millis(20)).await;

	assert!(!waiter.is_finished());
	assert_eq!(controller.stats().global_queued, 1);

	controller.release(&running);

	let ctx = waiter.await.expect("join failed").expect("waiter failed");

	assert!(ctx.is_started());

	controller.release(&ctx);

	let stats = controller.stats();

	assert_eq!(stats.global_concurrent, 0);
	assert_eq!(stats.global_queued, 0);
	assert_eq!(stats.users["bob"].concurrent, 0);
}

#[tokio::test]
async fn retry_after_grows_with_global_queue_depth() {
	let mut cfg = admission_config();

	cfg.max_concurrent_per_user = 1;
	cfg.max_queue_per_user = 0;
	cfg.max_concurrent_global = 2;
	cfg.max_queue_global = 8;
	cfg.avg_request_secs = 2;
	cfg.retry_after_secs = 30;

	let (controller, _metrics) = super::controller_with(cfg);

	// Two started, then eight distinct users pile into the global queue.
	for user in ["a", "b"] {
		controller.check_limits(AdmissionRequest::new(user)).expect("admission failed");
	}
	for index in 0..8 {
		let ctx = controller
			.check_limits(AdmissionRequest::new(format!("queued-{index}")))
			.expect("admission failed");

		assert!(!ctx.is_started());
	}

	let err = controller
		.check_limits(AdmissionRequest::new("overflow"))
		.expect_err("global queue should be full");

	// ceil(8 * 2 / 2) = 8 seconds of estimated drain time.
	assert_eq!(err.retry_after_secs(), Some(8));
}
