//! Per-dependency failure isolation.
//!
//! A breaker starts CLOSED and trips OPEN once `failure_threshold` consecutive
//! failures are recorded. While OPEN every call is rejected without touching
//! the dependency. The first attempt after `cooldown_ms` moves the breaker to
//! HALF_OPEN, where exactly one probe call is allowed at a time; reaching
//! `success_threshold` consecutive probe successes closes the breaker again,
//! and any HALF_OPEN failure reopens it immediately.

use std::{
	future::Future,
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};

use time::OffsetDateTime;
use tokio::time::Instant;

use ballast_config::BreakerConfig;

use crate::{
	error::BreakerError,
	telemetry::{
		BREAKER_CALL_SECONDS, BREAKER_FAILURE_TOTAL, BREAKER_REJECTED_TOTAL,
		BREAKER_STATE_CHANGE_TOTAL, BREAKER_SUCCESS_TOTAL, MetricsSink,
	},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

impl CircuitState {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Closed => "CLOSED",
			Self::Open => "OPEN",
			Self::HalfOpen => "HALF_OPEN",
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BreakerStats {
	pub name: String,
	pub state: CircuitState,
	pub consecutive_failures: u32,
	pub consecutive_successes: u32,
	pub total_failures: u64,
	pub total_successes: u64,
	pub total_rejected: u64,
	pub probe_in_flight: bool,
	#[serde(with = "crate::time_serde::option")]
	pub opened_at: Option<OffsetDateTime>,
	#[serde(with = "crate::time_serde::option")]
	pub last_failure_at: Option<OffsetDateTime>,
	#[serde(with = "crate::time_serde::option")]
	pub last_success_at: Option<OffsetDateTime>,
	#[serde(with = "crate::time_serde")]
	pub last_state_change_at: OffsetDateTime,
	pub failure_threshold: u32,
	pub cooldown_ms: u64,
	pub success_threshold: u32,
	pub call_timeout_ms: Option<u64>,
}

struct Inner {
	state: CircuitState,
	consecutive_failures: u32,
	consecutive_successes: u32,
	total_failures: u64,
	total_successes: u64,
	total_rejected: u64,
	probe_in_flight: bool,
	opened_at: Option<Instant>,
	opened_wall: Option<OffsetDateTime>,
	last_failure_at: Option<OffsetDateTime>,
	last_success_at: Option<OffsetDateTime>,
	last_state_change_at: OffsetDateTime,
}

impl Inner {
	fn fresh() -> Self {
		Self {
			state: CircuitState::Closed,
			consecutive_failures: 0,
			consecutive_successes: 0,
			total_failures: 0,
			total_successes: 0,
			total_rejected: 0,
			probe_in_flight: false,
			opened_at: None,
			opened_wall: None,
			last_failure_at: None,
			last_success_at: None,
			last_state_change_at: OffsetDateTime::now_utc(),
		}
	}
}

pub struct CircuitBreaker {
	name: String,
	cfg: BreakerConfig,
	metrics: Arc<dyn MetricsSink>,
	inner: Mutex<Inner>,
}

impl CircuitBreaker {
	pub fn new(name: impl Into<String>, cfg: BreakerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
		Self { name: name.into(), cfg, metrics, inner: Mutex::new(Inner::fresh()) }
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn config(&self) -> &BreakerConfig {
		&self.cfg
	}

	/// Whether a call would currently be admitted. Checking an OPEN breaker
	/// whose cooldown has elapsed moves it to HALF_OPEN as a side effect.
	pub fn can_execute(&self) -> bool {
		let mut inner = self.lock();

		match inner.state {
			CircuitState::Closed => true,
			CircuitState::Open => {
				if self.cooldown_elapsed(&inner) {
					self.transition(&mut inner, CircuitState::HalfOpen);

					true
				} else {
					false
				}
			},
			CircuitState::HalfOpen => !inner.probe_in_flight,
		}
	}

	/// Run `op` under the breaker. The wrapped future executes outside the
	/// breaker's lock; its error, if any, is returned unchanged.
	pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
	where
		E: std::error::Error,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		let probe = self.begin_call()?;
		let mut guard = ProbeGuard { breaker: self, armed: probe };
		let started = Instant::now();
		let result = op().await;
		let elapsed = started.elapsed();

		// The outcome bookkeeping below releases the probe slot when this call
		// owns it.
		guard.armed = false;
		drop(guard);

		self.metrics.observe_histogram(
			BREAKER_CALL_SECONDS,
			elapsed.as_secs_f64(),
			&[("breaker", self.name.clone())],
		);

		match result {
			Ok(value) => {
				self.on_success(probe);

				Ok(value)
			},
			Err(err) => {
				self.on_failure(probe);

				Err(BreakerError::Inner(err))
			},
		}
	}

	pub fn state(&self) -> CircuitState {
		self.lock().state
	}

	pub fn stats(&self) -> BreakerStats {
		let inner = self.lock();

		BreakerStats {
			name: self.name.clone(),
			state: inner.state,
			consecutive_failures: inner.consecutive_failures,
			consecutive_successes: inner.consecutive_successes,
			total_failures: inner.total_failures,
			total_successes: inner.total_successes,
			total_rejected: inner.total_rejected,
			probe_in_flight: inner.probe_in_flight,
			opened_at: inner.opened_wall,
			last_failure_at: inner.last_failure_at,
			last_success_at: inner.last_success_at,
			last_state_change_at: inner.last_state_change_at,
			failure_threshold: self.cfg.failure_threshold,
			cooldown_ms: self.cfg.cooldown_ms,
			success_threshold: self.cfg.success_threshold,
			call_timeout_ms: self.cfg.call_timeout_ms,
		}
	}

	/// Force CLOSED with every counter zeroed.
	pub fn reset(&self) {
		let mut inner = self.lock();

		*inner = Inner::fresh();

		tracing::info!(breaker = self.name.as_str(), "Circuit breaker reset.");
	}

	/// Admission decision for one call. `Ok(true)` means this call is the
	/// HALF_OPEN probe and owns the probe flag.
	fn begin_call<E>(&self) -> Result<bool, BreakerError<E>>
	where
		E: std::error::Error,
	{
		let mut inner = self.lock();

		match inner.state {
			CircuitState::Closed => Ok(false),
			CircuitState::Open => {
				if self.cooldown_elapsed(&inner) {
					self.transition(&mut inner, CircuitState::HalfOpen);

					inner.probe_in_flight = true;

					Ok(true)
				} else {
					Err(self.reject(&mut inner))
				}
			},
			CircuitState::HalfOpen => {
				if inner.probe_in_flight {
					Err(self.reject(&mut inner))
				} else {
					inner.probe_in_flight = true;

					Ok(true)
				}
			},
		}
	}

	fn reject<E>(&self, inner: &mut Inner) -> BreakerError<E>
	where
		E: std::error::Error,
	{
		inner.total_rejected += 1;

		self.metrics
			.increment_counter(BREAKER_REJECTED_TOTAL, &[("breaker", self.name.clone())]);

		BreakerError::Open {
			name: self.name.clone(),
			opened_at: inner.opened_wall,
			cooldown_ms: self.cfg.cooldown_ms,
		}
	}

	/// `probe` is the ownership flag handed out by [`begin_call`]. Only the
	/// owning call may release the probe slot or drive HALF_OPEN transitions;
	/// a straggler admitted before a trip is tallied in the totals only.
	///
	/// [`begin_call`]: Self::begin_call
	fn on_success(&self, probe: bool) {
		let mut inner = self.lock();

		if probe {
			inner.probe_in_flight = false;
		}

		inner.total_successes += 1;
		inner.last_success_at = Some(OffsetDateTime::now_utc());

		if probe || inner.state == CircuitState::Closed {
			inner.consecutive_successes += 1;
			inner.consecutive_failures = 0;
		}
		if probe
			&& inner.state == CircuitState::HalfOpen
			&& inner.consecutive_successes >= self.cfg.success_threshold
		{
			self.transition(&mut inner, CircuitState::Closed);
		}

		self.metrics
			.increment_counter(BREAKER_SUCCESS_TOTAL, &[("breaker", self.name.clone())]);
	}

	fn on_failure(&self, probe: bool) {
		let mut inner = self.lock();

		if probe {
			inner.probe_in_flight = false;
		}

		inner.total_failures += 1;
		inner.last_failure_at = Some(OffsetDateTime::now_utc());

		if probe || inner.state == CircuitState::Closed {
			inner.consecutive_failures += 1;
			inner.consecutive_successes = 0;
		}

		match inner.state {
			CircuitState::Closed =>
				if inner.consecutive_failures >= self.cfg.failure_threshold {
					self.transition(&mut inner, CircuitState::Open);
				},
			// A probe failure reopens the breaker, regardless of the failure
			// threshold.
			CircuitState::HalfOpen if probe => {
				self.transition(&mut inner, CircuitState::Open);
			},
			CircuitState::HalfOpen | CircuitState::Open => {},
		}

		self.metrics
			.increment_counter(BREAKER_FAILURE_TOTAL, &[("breaker", self.name.clone())]);
	}

	fn transition(&self, inner: &mut Inner, to: CircuitState) {
		let from = inner.state;

		inner.state = to;
		inner.last_state_change_at = OffsetDateTime::now_utc();

		match to {
			CircuitState::Open => {
				inner.opened_at = Some(Instant::now());
				inner.opened_wall = Some(OffsetDateTime::now_utc());
			},
			CircuitState::HalfOpen => {
				inner.consecutive_failures = 0;
				inner.consecutive_successes = 0;
				inner.probe_in_flight = false;
			},
			CircuitState::Closed => {},
		}

		if to == CircuitState::Open {
			tracing::warn!(
				breaker = self.name.as_str(),
				from = from.as_str(),
				to = to.as_str(),
				"Circuit breaker opened."
			);
		} else {
			tracing::info!(
				breaker = self.name.as_str(),
				from = from.as_str(),
				to = to.as_str(),
				"Circuit breaker state changed."
			);
		}

		self.metrics.increment_counter(
			BREAKER_STATE_CHANGE_TOTAL,
			&[
				("breaker", self.name.clone()),
				("from", from.as_str().to_string()),
				("to", to.as_str().to_string()),
			],
		);
	}

	fn cooldown_elapsed(&self, inner: &Inner) -> bool {
		inner
			.opened_at
			.map(|opened_at| opened_at.elapsed() >= Duration::from_millis(self.cfg.cooldown_ms))
			.unwrap_or(true)
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(|err| err.into_inner())
	}

	fn clear_probe(&self) {
		self.lock().probe_in_flight = false;
	}
}

/// Releases the probe slot if the wrapped future is dropped mid-flight, so a
/// cancelled probe can never wedge a HALF_OPEN breaker.
struct ProbeGuard<'a> {
	breaker: &'a CircuitBreaker,
	armed: bool,
}

impl Drop for ProbeGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			self.breaker.clear_probe();
		}
	}
}
