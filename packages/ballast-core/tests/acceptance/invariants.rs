use std::time::Duration;

use ballast_core::AdmissionRequest;
use ballast_testkit::admission_config;

/// Stress the controller from many tasks and assert the configured bounds hold
/// at every sampled instant: no counter exceeds its cap, no queue exceeds its
/// size, and everything drains back to zero.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_bounds_hold_under_contention() {
	let mut cfg = admission_config();

	cfg.max_concurrent_per_user = 2;
	cfg.max_queue_per_user = 16;
	cfg.max_concurrent_global = 5;
	cfg.max_queue_global = 64;
	cfg.queue_timeout_ms = 10_000;

	let (controller, _metrics) = super::controller_with(cfg);
	let users = ["alice", "bob", "carol", "dave"];
	let mut handles = Vec::new();

	for user in users {
		for _ in 0..8 {
			let controller = controller.clone();

			handles.push(tokio::spawn(async move {
				let ctx = controller.acquire(AdmissionRequest::new(user)).await?;
				let stats = controller.stats();

				assert!(stats.global_concurrent <= stats.max_concurrent_global);
				assert!(stats.global_queued <= stats.max_queue_global);

				for (user_id, user) in &stats.users {
					assert!(
						user.concurrent <= stats.max_concurrent_per_user,
						"user {user_id} exceeded its concurrency cap"
					);
					assert!(
						user.queued <= stats.max_queue_per_user,
						"user {user_id} exceeded its queue bound"
					);
				}

				tokio::time::sleep(Duration::from_millis(2)).await;

				controller.release(&ctx);

				Ok::<_, ballast_core::AdmissionError>(())
			}));
		}
	}

	for handle in handles {
		handle.await.expect("join failed").expect("admission failed under contention");
	}

	let stats = controller.stats();

	assert_eq!(stats.global_concurrent, 0);
	assert_eq!(stats.global_queued, 0);
	assert_eq!(stats.admitted_total, 32);
	assert_eq!(stats.timed_out_total, 0);

	for user in stats.users.values() {
		assert_eq!(user.concurrent, 0);
		assert_eq!(user.queued, 0);
	}
}

/// Interleaved check/acquire/release across two users never lets a release
/// from one user disturb the other's accounting.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn releases_are_isolated_per_user() {
	let mut cfg = admission_config();

	cfg.max_concurrent_per_user = 4;
	cfg.max_queue_per_user = 8;
	cfg.max_concurrent_global = 16;
	cfg.max_queue_global = 32;

	let (controller, _metrics) = super::controller_with(cfg);
	let mut handles = Vec::new();

	for user in ["alice", "bob"] {
		let controller = controller.clone();

		handles.push(tokio::spawn(async move {
			for _ in 0..16 {
				let ctx = controller.acquire(AdmissionRequest::new(user)).await?;

				tokio::time::sleep(Duration::from_millis(1)).await;

				controller.release(&ctx);
			}

			Ok::<_, ballast_core::AdmissionError>(())
		}));
	}

	for handle in handles {
		handle.await.expect("join failed").expect("admission failed");
	}

	let stats = controller.stats();

	assert_eq!(stats.global_concurrent, 0);
	assert_eq!(stats.admitted_total, 32);
	assert_eq!(stats.users["alice"].concurrent, 0);
	assert_eq!(stats.users["bob"].concurrent, 0);
}
