//! Two-level admission control: per-user and global concurrency caps with
//! bounded FIFO queues, an overload policy for full user queues, and
//! timeout-based queue eviction.
//!
//! The controller is a passive, thread-safe structure: it creates no tasks of
//! its own, and the only operation that suspends the caller is [`acquire`]
//! while waiting in queue.
//!
//! [`acquire`]: AdmissionController::acquire

use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};

use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use ballast_config::{Admission, OverloadPolicy};

use crate::{
	error::{AdmissionError, AdmissionResult},
	telemetry::{
		ADMISSION_ALLOWED_TOTAL, ADMISSION_QUEUE_WAIT_SECONDS, ADMISSION_REJECTED_TOTAL,
		ADMISSION_TIMEOUT_TOTAL, MetricsSink,
	},
};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct AdmissionRequest {
	pub user_id: String,
	pub session_id: Option<String>,
	pub request_id: Option<Uuid>,
}

impl AdmissionRequest {
	pub fn new(user_id: impl Into<String>) -> Self {
		Self { user_id: user_id.into(), session_id: None, request_id: None }
	}
}

/// Bookkeeping for one admitted or queued request. Handed back to the caller
/// and passed to [`AdmissionController::release`] when the work finishes.
#[derive(Debug, Clone)]
pub struct RequestContext {
	pub request_id: Uuid,
	pub user_id: String,
	pub session_id: Option<String>,
	pub enqueued_at: Instant,
	pub enqueued_wall: OffsetDateTime,
	pub started_at: Option<Instant>,
}

impl RequestContext {
	pub fn is_started(&self) -> bool {
		self.started_at.is_some()
	}

	/// Time spent queued; still growing while the request waits.
	pub fn queue_time(&self) -> Duration {
		self.started_at
			.map(|started_at| started_at.duration_since(self.enqueued_at))
			.unwrap_or_else(|| self.enqueued_at.elapsed())
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserStats {
	pub concurrent: u32,
	pub queued: u32,
}

/// Point-in-time snapshot taken under the controller's lock, so no partial
/// update is ever visible.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdmissionStats {
	pub global_concurrent: u32,
	pub global_queued: u32,
	pub users: HashMap<String, UserStats>,
	pub admitted_total: u64,
	pub rejected_total: u64,
	pub timed_out_total: u64,
	pub max_concurrent_per_user: u32,
	pub max_queue_per_user: u32,
	pub max_concurrent_global: u32,
	pub max_queue_global: u32,
	pub retry_after_secs: u64,
	pub queue_timeout_ms: u64,
	pub overload_policy: OverloadPolicy,
}

struct UserState {
	concurrent: u32,
	queue: VecDeque<Uuid>,
	last_activity: Instant,
}

impl UserState {
	fn fresh() -> Self {
		Self { concurrent: 0, queue: VecDeque::new(), last_activity: Instant::now() }
	}
}

struct Inner {
	users: HashMap<String, UserState>,
	global_concurrent: u32,
	global_queue: VecDeque<Uuid>,
	started: HashSet<Uuid>,
	admitted_total: u64,
	rejected_total: u64,
	timed_out_total: u64,
	last_cleanup_at: Instant,
}

impl Inner {
	fn fresh() -> Self {
		Self {
			users: HashMap::new(),
			global_concurrent: 0,
			global_queue: VecDeque::new(),
			started: HashSet::new(),
			admitted_total: 0,
			rejected_total: 0,
			timed_out_total: 0,
			last_cleanup_at: Instant::now(),
		}
	}
}

enum Placement {
	Started,
	Queued,
	GlobalQueueFull,
	UserQueueFull,
}

enum Promotion {
	Started,
	Waiting,
	Evicted,
}

pub struct AdmissionController {
	cfg: Admission,
	metrics: Arc<dyn MetricsSink>,
	inner: Mutex<Inner>,
}

impl AdmissionController {
	pub fn new(cfg: Admission, metrics: Arc<dyn MetricsSink>) -> Self {
		Self { cfg, metrics, inner: Mutex::new(Inner::fresh()) }
	}

	pub fn config(&self) -> &Admission {
		&self.cfg
	}

	/// Non-blocking admission check. The returned context is either started
	/// (both counters incremented) or queued in exactly one queue.
	pub fn check_limits(&self, request: AdmissionRequest) -> AdmissionResult<RequestContext> {
		let mut ctx = context_for(request);
		let outcome = {
			let mut inner = self.lock();

			self.maybe_cleanup(&mut inner);

			match self.place(&mut inner, &mut ctx) {
				Placement::Started => Ok(true),
				Placement::Queued => Ok(false),
				Placement::GlobalQueueFull => {
					inner.rejected_total += 1;

					Err(self.overload(&inner, "Global queue is full.", "global_queue_full"))
				},
				Placement::UserQueueFull => {
					inner.rejected_total += 1;

					let reason = match self.cfg.overload_policy {
						OverloadPolicy::Block => "queue_blocked",
						_ => "user_queue_full",
					};

					Err(self.overload(&inner, "User queue is full.", reason))
				},
			}
		};

		match outcome {
			Ok(started) => {
				if started {
					self.metrics.increment_counter(ADMISSION_ALLOWED_TOTAL, &[]);
				}

				Ok(ctx)
			},
			Err(err) => {
				tracing::warn!(
					user_id = ctx.user_id.as_str(),
					request_id = %ctx.request_id,
					error = %err,
					"Admission rejected."
				);

				Err(err)
			},
		}
	}

	/// Blocking admission: queues and waits until capacity frees up, the
	/// request is evicted, or the queue timeout expires.
	pub async fn acquire(&self, request: AdmissionRequest) -> AdmissionResult<RequestContext> {
		let mut ctx = context_for(request);
		// A `Block`ed request is not stored in the full queue; it re-attempts
		// placement on every poll instead.
		let mut queued = {
			let mut inner = self.lock();

			self.maybe_cleanup(&mut inner);

			match self.place(&mut inner, &mut ctx) {
				Placement::Started => {
					drop(inner);

					self.metrics.increment_counter(ADMISSION_ALLOWED_TOTAL, &[]);

					return Ok(ctx);
				},
				Placement::Queued => true,
				Placement::GlobalQueueFull => {
					inner.rejected_total += 1;

					return Err(self.overload(&inner, "Global queue is full.", "global_queue_full"));
				},
				Placement::UserQueueFull => match self.cfg.overload_policy {
					OverloadPolicy::Block => false,
					_ => {
						inner.rejected_total += 1;

						return Err(self.overload(&inner, "User queue is full.", "user_queue_full"));
					},
				},
			}
		};
		let queue_timeout = Duration::from_millis(self.cfg.queue_timeout_ms);

		loop {
			tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;

			let waited = ctx.enqueued_at.elapsed();
			let mut inner = self.lock();

			if queued {
				match self.try_promote(&mut inner, &mut ctx) {
					Promotion::Started => {
						drop(inner);

						self.metrics.increment_counter(ADMISSION_ALLOWED_TOTAL, &[]);
						self.metrics.observe_histogram(
							ADMISSION_QUEUE_WAIT_SECONDS,
							ctx.queue_time().as_secs_f64(),
							&[],
						);

						return Ok(ctx);
					},
					Promotion::Waiting => {},
					Promotion::Evicted => {
						// Already counted when the eviction happened.
						let err = AdmissionError::Overload {
							message: "Evicted from the user queue by a newer request.".to_string(),
							retry_after_secs: drain_estimate_secs(
								inner.global_queue.len() as u64,
								self.cfg.avg_request_secs,
								self.cfg.max_concurrent_global,
								self.cfg.retry_after_secs,
							),
						};

						drop(inner);

						tracing::warn!(
							user_id = ctx.user_id.as_str(),
							request_id = %ctx.request_id,
							"Queued request evicted."
						);

						return Err(err);
					},
				}
			} else {
				match self.place(&mut inner, &mut ctx) {
					Placement::Started => {
						drop(inner);

						self.metrics.increment_counter(ADMISSION_ALLOWED_TOTAL, &[]);
						self.metrics.observe_histogram(
							ADMISSION_QUEUE_WAIT_SECONDS,
							ctx.queue_time().as_secs_f64(),
							&[],
						);

						return Ok(ctx);
					},
					Placement::Queued => queued = true,
					// Still saturated; keep waiting for space.
					Placement::GlobalQueueFull | Placement::UserQueueFull => {},
				}
			}

			if waited > queue_timeout {
				self.remove_from_queues(&mut inner, &ctx);

				inner.timed_out_total += 1;

				drop(inner);

				self.metrics.increment_counter(ADMISSION_TIMEOUT_TOTAL, &[]);
				self.metrics.observe_histogram(
					ADMISSION_QUEUE_WAIT_SECONDS,
					waited.as_secs_f64(),
					&[],
				);
				tracing::warn!(
					user_id = ctx.user_id.as_str(),
					request_id = %ctx.request_id,
					waited_ms = waited.as_millis() as u64,
					"Queued request timed out."
				);

				return Err(AdmissionError::QueueTimeout {
					waited_ms: waited.as_millis() as u64,
					queue_timeout_ms: self.cfg.queue_timeout_ms,
				});
			}
		}
	}

	/// Returns the request's capacity to the pool. Only contexts that actually started
	/// decrement the counters, so releasing a queued or already-released
	/// context can never drive them below zero.
	pub fn release(&self, ctx: &RequestContext) {
		let mut inner = self.lock();

		if inner.started.remove(&ctx.request_id) {
			inner.global_concurrent = inner.global_concurrent.saturating_sub(1);

			if let Some(user) = inner.users.get_mut(&ctx.user_id) {
				user.concurrent = user.concurrent.saturating_sub(1);
				user.last_activity = Instant::now();
			}
		} else {
			self.remove_from_queues(&mut inner, ctx);
		}
	}

	pub fn stats(&self) -> AdmissionStats {
		let inner = self.lock();
		let users = inner
			.users
			.iter()
			.map(|(user_id, user)| {
				(
					user_id.clone(),
					UserStats { concurrent: user.concurrent, queued: user.queue.len() as u32 },
				)
			})
			.collect();

		AdmissionStats {
			global_concurrent: inner.global_concurrent,
			global_queued: inner.global_queue.len() as u32,
			users,
			admitted_total: inner.admitted_total,
			rejected_total: inner.rejected_total,
			timed_out_total: inner.timed_out_total,
			max_concurrent_per_user: self.cfg.max_concurrent_per_user,
			max_queue_per_user: self.cfg.max_queue_per_user,
			max_concurrent_global: self.cfg.max_concurrent_global,
			max_queue_global: self.cfg.max_queue_global,
			retry_after_secs: self.cfg.retry_after_secs,
			queue_timeout_ms: self.cfg.queue_timeout_ms,
			overload_policy: self.cfg.overload_policy,
		}
	}

	/// Clears all state; for tests and administrative use.
	pub fn reset(&self) {
		*self.lock() = Inner::fresh();

		tracing::info!("Admission controller reset.");
	}

	fn place(&self, inner: &mut Inner, ctx: &mut RequestContext) -> Placement {
		if inner.global_concurrent >= self.cfg.max_concurrent_global {
			if inner.global_queue.len() >= self.cfg.max_queue_global as usize {
				return Placement::GlobalQueueFull;
			}

			inner.global_queue.push_back(ctx.request_id);

			return Placement::Queued;
		}

		let user = inner.users.entry(ctx.user_id.clone()).or_insert_with(UserState::fresh);

		user.last_activity = Instant::now();

		if user.concurrent >= self.cfg.max_concurrent_per_user {
			if user.queue.len() >= self.cfg.max_queue_per_user as usize {
				match self.cfg.overload_policy {
					OverloadPolicy::DropNewest | OverloadPolicy::Block =>
						return Placement::UserQueueFull,
					OverloadPolicy::DropOldest => {
						// A zero-length queue has no head to evict.
						let Some(evicted) = user.queue.pop_front() else {
							return Placement::UserQueueFull;
						};

						inner.rejected_total += 1;

						self.metrics.increment_counter(
							ADMISSION_REJECTED_TOTAL,
							&[("reason", "evicted".to_string())],
						);
						tracing::debug!(
							user_id = ctx.user_id.as_str(),
							evicted_request_id = %evicted,
							"Evicted oldest queued request."
						);
					},
				}
			}

			user.queue.push_back(ctx.request_id);

			return Placement::Queued;
		}

		user.concurrent += 1;
		inner.global_concurrent += 1;
		inner.started.insert(ctx.request_id);
		inner.admitted_total += 1;
		ctx.started_at = Some(Instant::now());

		Placement::Started
	}

	/// A queued request starts only once it is at the head of the queue it
	/// occupies and both the user and global counters have headroom.
	fn try_promote(&self, inner: &mut Inner, ctx: &mut RequestContext) -> Promotion {
		if let Some(position) =
			inner.global_queue.iter().position(|id| *id == ctx.request_id)
		{
			if position == 0 && inner.global_concurrent < self.cfg.max_concurrent_global {
				let user =
					inner.users.entry(ctx.user_id.clone()).or_insert_with(UserState::fresh);

				if user.concurrent < self.cfg.max_concurrent_per_user {
					inner.global_queue.pop_front();

					user.concurrent += 1;
					user.last_activity = Instant::now();
					inner.global_concurrent += 1;
					inner.started.insert(ctx.request_id);
					inner.admitted_total += 1;
					ctx.started_at = Some(Instant::now());

					return Promotion::Started;
				}
			}

			return Promotion::Waiting;
		}

		if let Some(user) = inner.users.get_mut(&ctx.user_id)
			&& let Some(position) = user.queue.iter().position(|id| *id == ctx.request_id)
		{
			if position == 0
				&& user.concurrent < self.cfg.max_concurrent_per_user
				&& inner.global_concurrent < self.cfg.max_concurrent_global
			{
				user.queue.pop_front();

				user.concurrent += 1;
				user.last_activity = Instant::now();
				inner.global_concurrent += 1;
				inner.started.insert(ctx.request_id);
				inner.admitted_total += 1;
				ctx.started_at = Some(Instant::now());

				return Promotion::Started;
			}

			return Promotion::Waiting;
		}

		Promotion::Evicted
	}

	fn remove_from_queues(&self, inner: &mut Inner, ctx: &RequestContext) {
		inner.global_queue.retain(|id| *id != ctx.request_id);

		if let Some(user) = inner.users.get_mut(&ctx.user_id) {
			user.queue.retain(|id| *id != ctx.request_id);
			user.last_activity = Instant::now();
		}
	}

	fn overload(&self, inner: &Inner, message: &str, reason: &str) -> AdmissionError {
		self.metrics
			.increment_counter(ADMISSION_REJECTED_TOTAL, &[("reason", reason.to_string())]);

		AdmissionError::Overload {
			message: message.to_string(),
			retry_after_secs: drain_estimate_secs(
				inner.global_queue.len() as u64,
				self.cfg.avg_request_secs,
				self.cfg.max_concurrent_global,
				self.cfg.retry_after_secs,
			),
		}
	}

	/// Drops user records that are idle, empty, and past the stale timeout.
	/// Runs under the same lock as admission and release, so it can never
	/// interleave partially with either.
	fn maybe_cleanup(&self, inner: &mut Inner) {
		if inner.last_cleanup_at.elapsed()
			< Duration::from_millis(self.cfg.cleanup_interval_ms)
		{
			return;
		}

		let stale_after = Duration::from_millis(self.cfg.stale_user_timeout_ms);
		let before = inner.users.len();

		inner.users.retain(|_, user| {
			user.concurrent > 0
				|| !user.queue.is_empty()
				|| user.last_activity.elapsed() <= stale_after
		});

		let removed = before - inner.users.len();

		if removed > 0 {
			tracing::debug!(removed, "Removed stale user limit records.");
		}

		inner.last_cleanup_at = Instant::now();
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(|err| err.into_inner())
	}
}

fn context_for(request: AdmissionRequest) -> RequestContext {
	RequestContext {
		request_id: request.request_id.unwrap_or_else(Uuid::new_v4),
		user_id: request.user_id,
		session_id: request.session_id,
		enqueued_at: Instant::now(),
		enqueued_wall: OffsetDateTime::now_utc(),
		started_at: None,
	}
}

/// Heuristic queue-drain estimate: how long the global queue should take to
/// clear at the assumed mean request duration, floored at one second and
/// capped at the configured hint.
fn drain_estimate_secs(
	global_queue_len: u64,
	avg_request_secs: u64,
	max_concurrent_global: u32,
	retry_after_secs: u64,
) -> u64 {
	let estimate =
		(global_queue_len * avg_request_secs).div_ceil(u64::from(max_concurrent_global.max(1)));

	retry_after_secs.min(estimate.max(1))
}
