//! Resilience core for a multi-tenant retrieval backend.
//!
//! Two independent leaf components, composed by the request-handling layer:
//! an [`AdmissionController`] that decides whether work may proceed right now,
//! and per-dependency [`CircuitBreaker`]s (shared through a
//! [`BreakerRegistry`]) that decide whether a downstream dependency may
//! currently be called at all. The components never call each other.

pub mod admission;
pub mod breaker;
pub mod error;
pub mod registry;
pub mod telemetry;
pub mod time_serde;

pub use admission::{
	AdmissionController, AdmissionRequest, AdmissionStats, RequestContext, UserStats,
};
pub use breaker::{BreakerStats, CircuitBreaker, CircuitState};
pub use error::{AdmissionError, AdmissionResult, BreakerError};
pub use registry::BreakerRegistry;
pub use telemetry::{MetricsSink, NoopMetrics};
