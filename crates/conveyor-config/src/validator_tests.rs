use super::*;

#[test]
fn test_validate_default_config() {
    let config = Config::default();
    let result = ConfigValidator::validate(&config);
    assert!(result.is_valid());
    assert!(result.warnings.is_empty());
}

#[test]
fn test_validate_zero_concurrency() {
    let mut config = Config::default();
    config.dispatch.max_concurrency = 0;

    let result = ConfigValidator::validate(&config);
    assert!(!result.is_valid());
    assert!(result.errors.iter().any(|e| e.path == "dispatch.max_concurrency"));
}

#[test]
fn test_validate_high_concurrency_warning() {
    let mut config = Config::default();
    config.dispatch.max_concurrency = 5000;

    let result = ConfigValidator::validate(&config);
    assert!(result.is_valid());
    assert!(!result.warnings.is_empty());
}

#[test]
fn test_validate_threshold_above_critical() {
    let mut config = Config::default();
    config.dispatch.back_pressure.threshold = 0.95;

    let result = ConfigValidator::validate(&config);
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.path == "dispatch.back_pressure.threshold")
    );
}

#[test]
fn test_validate_critical_out_of_range() {
    let mut config = Config::default();
    config.dispatch.back_pressure.critical = 1.5;

    let result = ConfigValidator::validate(&config);
    assert!(
        result
            .errors
            .iter()
            .any(|e| e.path == "dispatch.back_pressure.critical")
    );
}

#[test]
fn test_validate_retry_delays() {
    let mut config = Config::default();
    config.scheduler.retry_base_delay_ms = 600_000;

    let result = ConfigValidator::validate(&config);
    assert!(!result.is_valid());
}

#[test]
fn test_validate_zero_max_chunks() {
    let mut config = Config::default();
    config.continuation.max_chunks = Some(0);

    let result = ConfigValidator::validate(&config);
    assert!(result.errors.iter().any(|e| e.path == "continuation.max_chunks"));
}

#[test]
fn test_into_result_reports_first_error() {
    let mut config = Config::default();
    config.scheduler.batch_size = 0;

    let err = ConfigValidator::validate(&config).into_result().unwrap_err();
    assert!(err.to_string().contains("scheduler.batch_size"));
}
