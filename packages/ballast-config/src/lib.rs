mod error;
mod types;

pub use error::{Error, Result};
pub use types::{Admission, BreakerConfig, Breakers, Config, OverloadPolicy, Service};

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.log_level.trim().is_empty() {
		return Err(Error::Validation {
			field: "service.log_level".to_string(),
			reason: "must be non-empty".to_string(),
		});
	}

	require_positive("admission.max_concurrent_per_user", cfg.admission.max_concurrent_per_user.into())?;
	require_positive("admission.max_concurrent_global", cfg.admission.max_concurrent_global.into())?;
	require_positive("admission.retry_after_secs", cfg.admission.retry_after_secs)?;
	require_positive("admission.queue_timeout_ms", cfg.admission.queue_timeout_ms)?;
	require_positive("admission.cleanup_interval_ms", cfg.admission.cleanup_interval_ms)?;
	require_positive("admission.stale_user_timeout_ms", cfg.admission.stale_user_timeout_ms)?;
	require_positive("admission.avg_request_secs", cfg.admission.avg_request_secs)?;

	validate_breaker("breakers.default", &cfg.breakers.default)?;

	if let Some(named) = cfg.breakers.named.as_ref() {
		for (name, breaker) in named {
			if name.trim().is_empty() {
				return Err(Error::Validation {
					field: "breakers.named".to_string(),
					reason: "keys must be non-empty".to_string(),
				});
			}

			validate_breaker(&format!("breakers.named.{name}"), breaker)?;
		}
	}

	Ok(())
}

fn validate_breaker(label: &str, breaker: &BreakerConfig) -> Result<()> {
	require_positive(&format!("{label}.failure_threshold"), breaker.failure_threshold.into())?;
	require_positive(&format!("{label}.cooldown_ms"), breaker.cooldown_ms)?;
	require_positive(&format!("{label}.success_threshold"), breaker.success_threshold.into())?;

	if let Some(timeout) = breaker.call_timeout_ms {
		require_positive(&format!("{label}.call_timeout_ms"), timeout)?;
	}

	Ok(())
}

fn require_positive(field: &str, value: u64) -> Result<()> {
	if value == 0 {
		return Err(Error::Validation {
			field: field.to_string(),
			reason: "must be greater than zero".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.breakers.named.as_ref().map(|named| named.is_empty()).unwrap_or(false) {
		cfg.breakers.named = None;
	}
}
