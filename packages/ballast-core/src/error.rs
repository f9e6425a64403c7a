use time::OffsetDateTime;

pub type AdmissionResult<T, E = AdmissionError> = std::result::Result<T, E>;

/// Admission denied or abandoned. Neither variant is retried inside the core;
/// the caller decides whether and when to retry using the carried hint.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
	#[error("{message} Retry after {retry_after_secs}s.")]
	Overload { message: String, retry_after_secs: u64 },
	#[error("Queued request waited {waited_ms}ms, exceeding the {queue_timeout_ms}ms queue timeout.")]
	QueueTimeout { waited_ms: u64, queue_timeout_ms: u64 },
}

impl AdmissionError {
	/// Retry hint in seconds, when the error carries one.
	pub fn retry_after_secs(&self) -> Option<u64> {
		match self {
			Self::Overload { retry_after_secs, .. } => Some(*retry_after_secs),
			Self::QueueTimeout { .. } => None,
		}
	}
}

/// Outcome of a guarded dependency call. `Inner` carries the wrapped
/// operation's own error unchanged, so callers can tell "dependency failed"
/// from "dependency currently isolated" apart.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E>
where
	E: std::error::Error,
{
	#[error("Circuit breaker '{name}' is open; the call was rejected without being attempted.")]
	Open { name: String, opened_at: Option<OffsetDateTime>, cooldown_ms: u64 },
	#[error(transparent)]
	Inner(E),
}

impl<E> BreakerError<E>
where
	E: std::error::Error,
{
	pub fn is_open(&self) -> bool {
		matches!(self, Self::Open { .. })
	}

	/// The original dependency error, if the call was actually attempted.
	pub fn into_inner(self) -> Option<E> {
		match self {
			Self::Open { .. } => None,
			Self::Inner(err) => Some(err),
		}
	}
}
