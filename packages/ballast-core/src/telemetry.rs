//! Instrumentation seam. The core emits counters and histograms through an
//! injected collaborator and defines no storage or export format of its own.

pub const ADMISSION_ALLOWED_TOTAL: &str = "admission_allowed_total";
pub const ADMISSION_REJECTED_TOTAL: &str = "admission_rejected_total";
pub const ADMISSION_TIMEOUT_TOTAL: &str = "admission_timeout_total";
pub const ADMISSION_QUEUE_WAIT_SECONDS: &str = "admission_queue_wait_seconds";
pub const BREAKER_SUCCESS_TOTAL: &str = "breaker_success_total";
pub const BREAKER_FAILURE_TOTAL: &str = "breaker_failure_total";
pub const BREAKER_REJECTED_TOTAL: &str = "breaker_rejected_total";
pub const BREAKER_CALL_SECONDS: &str = "breaker_call_seconds";
pub const BREAKER_STATE_CHANGE_TOTAL: &str = "breaker_state_change_total";

pub trait MetricsSink
where
	Self: Send + Sync,
{
	fn increment_counter(&self, name: &str, labels: &[(&str, String)]);

	fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, String)]);
}

/// Default sink: drops every observation.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
	fn increment_counter(&self, _name: &str, _labels: &[(&str, String)]) {}

	fn observe_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, String)]) {}
}
