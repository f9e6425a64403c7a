use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub admission: Admission,
	pub breakers: Breakers,
}

#[derive(Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Admission {
	pub max_concurrent_per_user: u32,
	pub max_queue_per_user: u32,
	pub max_concurrent_global: u32,
	pub max_queue_global: u32,
	pub retry_after_secs: u64,
	pub queue_timeout_ms: u64,
	#[serde(default)]
	pub overload_policy: OverloadPolicy,
	#[serde(default = "default_cleanup_interval_ms")]
	pub cleanup_interval_ms: u64,
	#[serde(default = "default_stale_user_timeout_ms")]
	pub stale_user_timeout_ms: u64,
	/// Assumed mean request duration used by the Retry-After drain estimate.
	#[serde(default = "default_avg_request_secs")]
	pub avg_request_secs: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadPolicy {
	#[default]
	DropNewest,
	DropOldest,
	Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Breakers {
	pub default: BreakerConfig,
	/// Optional. Map keys are dependency names, e.g. "pinecone" or "reviewer".
	pub named: Option<HashMap<String, BreakerConfig>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
	pub failure_threshold: u32,
	pub cooldown_ms: u64,
	pub success_threshold: u32,
	/// Advisory per-call budget; the breaker never enforces it around the
	/// wrapped operation.
	pub call_timeout_ms: Option<u64>,
}

fn default_cleanup_interval_ms() -> u64 {
	60_000
}

fn default_stale_user_timeout_ms() -> u64 {
	300_000
}

fn default_avg_request_secs() -> u64 {
	2
}
