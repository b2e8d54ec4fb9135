//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::Config;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Convert the first error into a `ConfigError`.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(ConfigError::InvalidValue {
                field: error.path,
                message: error.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_dispatch(config, &mut result);
        Self::validate_scheduler(config, &mut result);
        Self::validate_continuation(config, &mut result);

        result
    }

    fn validate_dispatch(config: &Config, result: &mut ValidationResult) {
        let dispatch = &config.dispatch;

        if dispatch.max_queue_size == 0 {
            result.add_error(ValidationError::new(
                "dispatch.max_queue_size",
                "max_queue_size must be greater than 0",
            ));
        }

        if dispatch.max_concurrency == 0 {
            result.add_error(ValidationError::new(
                "dispatch.max_concurrency",
                "max_concurrency must be greater than 0",
            ));
        } else if dispatch.max_concurrency > 1000 {
            result.add_warning(ValidationWarning::new(
                "dispatch.max_concurrency",
                "max_concurrency is very high (>1000), handlers may exhaust downstream resources",
            ));
        }

        if dispatch.tick_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "dispatch.tick_interval_ms",
                "tick_interval_ms must be greater than 0",
            ));
        }

        if dispatch.dead_letter_after_retries == 0 {
            result.add_error(ValidationError::new(
                "dispatch.dead_letter_after_retries",
                "dead_letter_after_retries must be greater than 0",
            ));
        }

        let bp = &dispatch.back_pressure;
        for (path, value) in [
            ("dispatch.back_pressure.threshold", bp.threshold),
            ("dispatch.back_pressure.critical", bp.critical),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                result.add_error(ValidationError::new(path, "must be within (0, 1]"));
            }
        }
        if bp.threshold >= bp.critical {
            result.add_error(ValidationError::new(
                "dispatch.back_pressure.threshold",
                "threshold must be below critical",
            ));
        }

        if dispatch.circuit_breaker.failure_threshold == 0 {
            result.add_error(ValidationError::new(
                "dispatch.circuit_breaker.failure_threshold",
                "failure_threshold must be greater than 0",
            ));
        }
    }

    fn validate_scheduler(config: &Config, result: &mut ValidationResult) {
        let scheduler = &config.scheduler;

        if scheduler.scan_interval_secs == 0 {
            result.add_error(ValidationError::new(
                "scheduler.scan_interval_secs",
                "scan_interval_secs must be greater than 0",
            ));
        }

        if scheduler.batch_size == 0 {
            result.add_error(ValidationError::new(
                "scheduler.batch_size",
                "batch_size must be greater than 0",
            ));
        }

        if scheduler.retry_base_delay_ms > scheduler.retry_max_delay_ms {
            result.add_error(ValidationError::new(
                "scheduler.retry_base_delay_ms",
                "retry_base_delay_ms must not exceed retry_max_delay_ms",
            ));
        }

        if scheduler.retry_max_attempts == Some(0) {
            result.add_warning(ValidationWarning::new(
                "scheduler.retry_max_attempts",
                "retry_max_attempts is 0, every scheduled retry will be rejected",
            ));
        }
    }

    fn validate_continuation(config: &Config, result: &mut ValidationResult) {
        let continuation = &config.continuation;

        if continuation.default_chunk_size == 0 {
            result.add_error(ValidationError::new(
                "continuation.default_chunk_size",
                "default_chunk_size must be greater than 0",
            ));
        }

        if continuation.default_chunk_timeout_secs == 0 {
            result.add_error(ValidationError::new(
                "continuation.default_chunk_timeout_secs",
                "default_chunk_timeout_secs must be greater than 0",
            ));
        }

        if continuation.checkpoint_interval == 0 {
            result.add_error(ValidationError::new(
                "continuation.checkpoint_interval",
                "checkpoint_interval must be greater than 0",
            ));
        }

        if continuation.token_ttl_hours == 0 {
            result.add_warning(ValidationWarning::new(
                "continuation.token_ttl_hours",
                "token_ttl_hours is 0, tokens expire immediately and cannot be resumed",
            ));
        }

        if continuation.max_chunks == Some(0) {
            result.add_error(ValidationError::new(
                "continuation.max_chunks",
                "max_chunks must be greater than 0 when set",
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
