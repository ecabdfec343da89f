use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::KernelError;

/// One year.
pub const MAX_STALE_SESSION_MINUTES: u64 = 525_600;
/// One hour.
pub const MAX_APPROVAL_TIMEOUT_MS: u64 = 3_600_000;
pub const MAX_BUSY_TIMEOUT_MS: u64 = 600_000;

/// Runtime knobs shared by the store and the tool surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub busy_timeout_ms: u64,
    pub lock_retry_attempts: u32,
    pub lock_retry_base_ms: u64,
    pub lock_retry_max_ms: u64,
    pub stale_session_minutes: u64,
    pub auto_upgrade_step_threshold: usize,
    pub approval_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            lock_retry_attempts: 8,
            lock_retry_base_ms: 5,
            lock_retry_max_ms: 200,
            stale_session_minutes: 120,
            auto_upgrade_step_threshold: 100,
            approval_timeout_ms: 30_000,
        }
    }
}

impl KernelConfig {
    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when a field is outside its
    /// allowed range.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.lock_retry_attempts == 0 {
            return Err(KernelError::Configuration(
                "lock_retry_attempts MUST be >= 1".to_string(),
            ));
        }

        if self.lock_retry_base_ms > self.lock_retry_max_ms {
            return Err(KernelError::Configuration(
                "lock_retry_base_ms cannot exceed lock_retry_max_ms".to_string(),
            ));
        }

        for (name, value) in [
            ("stale_session_minutes", self.stale_session_minutes),
            ("approval_timeout_ms", self.approval_timeout_ms),
            ("auto_upgrade_step_threshold", self.auto_upgrade_step_threshold as u64),
        ] {
            if value == 0 {
                return Err(KernelError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        for (name, value, max) in [
            ("stale_session_minutes", self.stale_session_minutes, MAX_STALE_SESSION_MINUTES),
            ("approval_timeout_ms", self.approval_timeout_ms, MAX_APPROVAL_TIMEOUT_MS),
            ("busy_timeout_ms", self.busy_timeout_ms, MAX_BUSY_TIMEOUT_MS),
        ] {
            if value > max {
                return Err(KernelError::Configuration(format!("{name} MUST be <= {max}")));
            }
        }

        Ok(())
    }

    /// Decodes and validates a configuration document.
    ///
    /// # Errors
    /// Returns [`KernelError::Configuration`] when decoding fails or values
    /// violate bounds.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            KernelError::Configuration(format!("invalid configuration payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    #[must_use]
    pub fn stale_session_after(&self) -> time::Duration {
        let minutes = self.stale_session_minutes.min(MAX_STALE_SESSION_MINUTES);
        time::Duration::minutes(i64::try_from(minutes).unwrap_or(i64::MAX))
    }
}

/// Converts a caller-supplied staleness window into a duration.
///
/// # Errors
/// Returns [`KernelError::Validation`] unless `minutes` lies in
/// `1..=MAX_STALE_SESSION_MINUTES`.
pub fn stale_threshold(minutes: i64) -> Result<time::Duration, KernelError> {
    match u64::try_from(minutes) {
        Ok(value) if (1..=MAX_STALE_SESSION_MINUTES).contains(&value) => {
            Ok(time::Duration::minutes(minutes))
        }
        _ => Err(KernelError::Validation(format!(
            "stale_after_minutes MUST be between 1 and {MAX_STALE_SESSION_MINUTES}, got {minutes}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let config = match KernelConfig::from_json(&json!({ "busy_timeout_ms": 250 })) {
            Ok(value) => value,
            Err(err) => panic!("expected config, got {err}"),
        };
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.auto_upgrade_step_threshold, 100);
    }

    #[test]
    fn unknown_fields_and_bad_bounds_are_rejected() {
        assert!(KernelConfig::from_json(&json!({ "busy_timeout": 1 })).is_err());
        assert!(KernelConfig::from_json(&json!({ "lock_retry_attempts": 0 })).is_err());
        assert!(KernelConfig::from_json(&json!({
            "lock_retry_base_ms": 500,
            "lock_retry_max_ms": 10
        }))
        .is_err());
    }

    #[test]
    fn oversized_durations_are_configuration_errors() {
        for document in [
            json!({ "stale_session_minutes": u64::MAX }),
            json!({ "stale_session_minutes": MAX_STALE_SESSION_MINUTES + 1 }),
            json!({ "approval_timeout_ms": u64::MAX }),
            json!({ "busy_timeout_ms": u64::MAX }),
        ] {
            match KernelConfig::from_json(&document) {
                Err(KernelError::Configuration(message)) => assert!(message.contains("MUST be <=")),
                other => panic!("expected configuration error for {document}, got {other:?}"),
            }
        }

        let widest = match KernelConfig::from_json(&json!({
            "stale_session_minutes": MAX_STALE_SESSION_MINUTES,
            "approval_timeout_ms": MAX_APPROVAL_TIMEOUT_MS
        })) {
            Ok(value) => value,
            Err(err) => panic!("expected config at the bounds, got {err}"),
        };
        assert_eq!(widest.stale_session_after(), time::Duration::days(365));
        assert_eq!(widest.approval_timeout(), Duration::from_secs(3_600));
    }

    #[test]
    fn stale_threshold_rejects_out_of_range_minutes() {
        assert_eq!(stale_threshold(30).ok(), Some(time::Duration::minutes(30)));
        for minutes in [0, -5, i64::MAX, i64::MIN] {
            assert!(matches!(stale_threshold(minutes), Err(KernelError::Validation(_))));
        }
    }
}
