//! Shared test tooling: a recording metrics sink, a scripted flaky
//! dependency, and deterministic config builders.

mod error;

pub use error::ScriptedError;

use std::{
	collections::VecDeque,
	sync::{
		Mutex,
		atomic::{AtomicUsize, Ordering},
	},
};

use ballast_core::telemetry::MetricsSink;

#[derive(Debug, Clone)]
pub struct CounterEvent {
	pub name: String,
	pub labels: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct HistogramEvent {
	pub name: String,
	pub value: f64,
	pub labels: Vec<(String, String)>,
}

/// Captures every telemetry emission for later assertion.
#[derive(Default)]
pub struct RecordingMetrics {
	counters: Mutex<Vec<CounterEvent>>,
	histograms: Mutex<Vec<HistogramEvent>>,
}

impl RecordingMetrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn counter_total(&self, name: &str) -> u64 {
		let counters = self.counters.lock().unwrap_or_else(|err| err.into_inner());

		counters.iter().filter(|event| event.name == name).count() as u64
	}

	pub fn counter_total_with(&self, name: &str, label_key: &str, label_value: &str) -> u64 {
		let counters = self.counters.lock().unwrap_or_else(|err| err.into_inner());

		counters
			.iter()
			.filter(|event| {
				event.name == name
					&& event
						.labels
						.iter()
						.any(|(key, value)| key == label_key && value == label_value)
			})
			.count() as u64
	}

	pub fn histogram_count(&self, name: &str) -> usize {
		let histograms = self.histograms.lock().unwrap_or_else(|err| err.into_inner());

		histograms.iter().filter(|event| event.name == name).count()
	}

	pub fn histogram_values(&self, name: &str) -> Vec<f64> {
		let histograms = self.histograms.lock().unwrap_or_else(|err| err.into_inner());

		histograms
			.iter()
			.filter(|event| event.name == name)
			.map(|event| event.value)
			.collect()
	}
}

impl MetricsSink for RecordingMetrics {
	fn increment_counter(&self, name: &str, labels: &[(&str, String)]) {
		let mut counters = self.counters.lock().unwrap_or_else(|err| err.into_inner());

		counters.push(CounterEvent {
			name: name.to_string(),
			labels: labels.iter().map(|(key, value)| (key.to_string(), value.clone())).collect(),
		});
	}

	fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, String)]) {
		let mut histograms = self.histograms.lock().unwrap_or_else(|err| err.into_inner());

		histograms.push(HistogramEvent {
			name: name.to_string(),
			value,
			labels: labels.iter().map(|(key, value)| (key.to_string(), value.clone())).collect(),
		});
	}
}

/// Dependency stub yielding a scripted sequence of outcomes (`true` for
/// success) and counting how often it was actually invoked. Outcomes past the
/// end of the script succeed.
pub struct ScriptedCall {
	outcomes: Mutex<VecDeque<bool>>,
	invocations: AtomicUsize,
}

impl ScriptedCall {
	pub fn new(outcomes: impl IntoIterator<Item = bool>) -> Self {
		Self {
			outcomes: Mutex::new(outcomes.into_iter().collect()),
			invocations: AtomicUsize::new(0),
		}
	}

	pub fn invocations(&self) -> usize {
		self.invocations.load(Ordering::SeqCst)
	}

	pub async fn invoke(&self) -> Result<(), ScriptedError> {
		self.invocations.fetch_add(1, Ordering::SeqCst);

		let outcome = {
			let mut outcomes = self.outcomes.lock().unwrap_or_else(|err| err.into_inner());

			outcomes.pop_front()
		};

		match outcome {
			Some(false) => Err(ScriptedError),
			Some(true) | None => Ok(()),
		}
	}
}

pub fn admission_config() -> ballast_config::Admission {
	ballast_config::Admission {
		max_concurrent_per_user: 2,
		max_queue_per_user: 3,
		max_concurrent_global: 8,
		max_queue_global: 16,
		retry_after_secs: 30,
		queue_timeout_ms: 10_000,
		overload_policy: ballast_config::OverloadPolicy::DropNewest,
		cleanup_interval_ms: 60_000,
		stale_user_timeout_ms: 300_000,
		avg_request_secs: 2,
	}
}

pub fn breaker_config() -> ballast_config::BreakerConfig {
	ballast_config::BreakerConfig {
		failure_threshold: 3,
		cooldown_ms: 1_000,
		success_threshold: 2,
		call_timeout_ms: None,
	}
}

pub fn breakers_config() -> ballast_config::Breakers {
	ballast_config::Breakers { default: breaker_config(), named: None }
}
