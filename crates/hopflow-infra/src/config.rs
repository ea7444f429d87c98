//! Engine configuration loader.
//!
//! Reads `hopflow.toml` (by default from the data directory) into
//! [`EngineConfig`]. Falls back to defaults when the file is missing,
//! unreadable, malformed, or carries values the engine cannot run with.

use std::path::{Path, PathBuf};

use hopflow_types::config::EngineConfig;

use crate::sqlite::pool::data_dir;

/// File name looked up inside the data directory.
pub const CONFIG_FILE: &str = "hopflow.toml";

/// `{data_dir}/hopflow.toml`.
pub fn default_config_path() -> PathBuf {
    data_dir().join(CONFIG_FILE)
}

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file cannot be read or parsed, logs a warning and returns the default.
/// - If the parsed config fails [`EngineConfig::validate`], logs a warning and
///   returns the default.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {} found, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    let config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match config.validate() {
        Ok(()) => {
            tracing::info!(path = %path.display(), "engine configuration loaded");
            config
        }
        Err(err) => {
            tracing::warn!("Invalid configuration in {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(&tmp.path().join(CONFIG_FILE)).await;
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.dlq.suffix, ".dlq");
        assert!(config.circuit_breaker.enabled);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_overrides_sections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            r#"
service_name = "billing"

[retry]
max_attempts = 5
initial_delay_ms = 200
non_retryable_kinds = ["invalid_input", "fraud_detected"]

[dlq]
suffix = ".dead"

[circuit_breaker]
failure_rate_threshold = 25.0
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.service_name.as_deref(), Some("billing"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 200);
        assert!(config.retry.is_non_retryable("fraud_detected"));
        assert_eq!(config.dlq.suffix, ".dead");
        assert_eq!(config.circuit_breaker.failure_rate_threshold, 25.0);
        // Untouched fields keep their defaults.
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.circuit_breaker.sliding_window_size, 100);
    }

    #[tokio::test]
    async fn load_engine_config_malformed_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[retry\nmax_attempts = ").await.unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_values_return_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[retry]\nmax_attempts = 7\nmultiplier = 0.5\n")
            .await
            .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.multiplier, 2.0);
    }

    #[test]
    fn default_config_path_ends_with_file_name() {
        assert!(default_config_path().ends_with(CONFIG_FILE));
    }
}
