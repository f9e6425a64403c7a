//! Process-wide map from dependency name to its circuit breaker.
//!
//! Shared explicitly (no implicit global): callers construct one registry and
//! hand clones of the `Arc` around, so tests can build isolated instances.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex, MutexGuard},
};

use ballast_config::{BreakerConfig, Breakers};

use crate::{breaker::CircuitBreaker, telemetry::MetricsSink};

pub struct BreakerRegistry {
	cfg: Breakers,
	metrics: Arc<dyn MetricsSink>,
	breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
	pub fn new(cfg: Breakers, metrics: Arc<dyn MetricsSink>) -> Self {
		Self { cfg, metrics, breakers: Mutex::new(HashMap::new()) }
	}

	/// Returns the breaker for `name`, creating it on first access. At most
	/// one instance ever exists per name, even under concurrent first access.
	pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
		let mut breakers = self.lock();

		if let Some(breaker) = breakers.get(name) {
			return breaker.clone();
		}

		let breaker =
			Arc::new(CircuitBreaker::new(name, self.config_for(name), self.metrics.clone()));

		breakers.insert(name.to_string(), breaker.clone());

		tracing::info!(breaker = name, "Circuit breaker created.");

		breaker
	}

	/// Clears the registry itself, so subsequent lookups re-create fresh
	/// breaker instances.
	pub fn reset_all(&self) {
		self.lock().clear();

		tracing::info!("Circuit breaker registry cleared.");
	}

	pub fn names(&self) -> Vec<String> {
		let mut names = self.lock().keys().cloned().collect::<Vec<_>>();

		names.sort();

		names
	}

	fn config_for(&self, name: &str) -> BreakerConfig {
		self.cfg
			.named
			.as_ref()
			.and_then(|named| named.get(name))
			.unwrap_or(&self.cfg.default)
			.clone()
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
		self.breakers.lock().unwrap_or_else(|err| err.into_inner())
	}
}
