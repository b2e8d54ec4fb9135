//! Configuration loader.

use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::schema::Config;

/// Configuration loader with environment variable substitution.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a file, falling back to defaults when absent.
    pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) => Ok(Config::default()),
            other => other,
        }
    }

    /// Load configuration from a string.
    pub fn load_str(content: &str) -> Result<Config, ConfigError> {
        let expanded = Self::expand_env_vars(content)?;
        let mut config: Config = toml::from_str(&expanded)?;
        config.store.expand_paths();
        if let Some(dir) = config.logging.log_dir.take() {
            config.logging.log_dir = Some(Self::expand_path(&dir.to_string_lossy()).into());
        }
        Ok(config)
    }

    /// Expand environment variables in the format `${VAR}`.
    fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
        let mut result = content.to_string();
        let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::InvalidValue {
            field: "env".to_string(),
            message: e.to_string(),
        })?;

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let var_value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotSet(var_name.to_string()))?;
            result = result.replace(&cap[0], &var_value);
        }

        Ok(result)
    }

    /// Expand shell-style paths (e.g., `~/.conveyor`).
    pub fn expand_path(path: &str) -> String {
        shellexpand::tilde(path).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_empty_config() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config.dispatch.max_concurrency, 10);
        assert_eq!(config.scheduler.scan_interval_secs, 10);
    }

    #[test]
    fn test_load_dispatch_section() {
        let content = r#"
            [dispatch]
            max_queue_size = 500
            max_concurrency = 4

            [dispatch.back_pressure]
            threshold = 0.6
            max_delay_ms = 250

            [dispatch.circuit_breaker]
            cooldown_ms = 1000
        "#;
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(config.dispatch.max_queue_size, 500);
        assert_eq!(config.dispatch.max_concurrency, 4);
        assert_eq!(config.dispatch.back_pressure.threshold, 0.6);
        assert_eq!(config.dispatch.back_pressure.critical, 0.9);
        assert_eq!(config.dispatch.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.dispatch.circuit_breaker.cooldown_ms, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[continuation]").unwrap();
        writeln!(file, "default_chunk_size = 25").unwrap();
        writeln!(file, "max_chunks = 40").unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.continuation.default_chunk_size, 25);
        assert_eq!(config.continuation.max_chunks, Some(40));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = ConfigLoader::load(Path::new("/nonexistent/path/conveyor.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_or_default_nonexistent() {
        let config = ConfigLoader::load_or_default(Path::new("/nonexistent/conveyor.toml")).unwrap();
        assert_eq!(config.dispatch.dead_letter_after_retries, 3);
    }

    #[test]
    fn test_load_invalid_toml() {
        let result = ConfigLoader::load_str("invalid = [unclosed");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_expand_env_vars() {
        // SAFETY: This test runs in isolation and sets a unique test-only env var
        unsafe {
            std::env::set_var("CONVEYOR_TEST_DB", "/var/lib/conveyor/test.db");
        }
        let content = "[store]\ndatabase_path = \"${CONVEYOR_TEST_DB}\"";
        let config = ConfigLoader::load_str(content).unwrap();
        assert_eq!(
            config.store.database_path.to_string_lossy(),
            "/var/lib/conveyor/test.db"
        );
        unsafe {
            std::env::remove_var("CONVEYOR_TEST_DB");
        }
    }

    #[test]
    fn test_expand_env_vars_not_set() {
        let content = "value = \"${CONVEYOR_NONEXISTENT_VAR_12345}\"";
        let result = ConfigLoader::expand_env_vars(content);
        assert!(matches!(result, Err(ConfigError::EnvVarNotSet(_))));
    }

    #[test]
    fn test_tilde_paths_expanded() {
        let content = "[store]\ncheckpoint_dir = \"~/conveyor-checkpoints\"";
        let config = ConfigLoader::load_str(content).unwrap();
        assert!(!config.store.checkpoint_dir.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_expand_path_no_tilde() {
        assert_eq!(ConfigLoader::expand_path("/usr/local/bin"), "/usr/local/bin");
    }
}
