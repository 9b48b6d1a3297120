//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{KeelConfig, LogOutput, LoggingConfig, PipelineConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &KeelConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_pipeline_config(&config.pipeline)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output is 'file'",
        ));
    }

    if let Some(module) = logging.filters.keys().find(|module| module.trim().is_empty()) {
        return Err(ConfigError::validation(format!(
            "Invalid logging filter module name: {module:?}"
        )));
    }

    Ok(())
}

fn validate_pipeline_config(pipeline: &PipelineConfig) -> ConfigResult<()> {
    if pipeline.request_timeout_ms == Some(0) {
        return Err(ConfigError::validation(
            "pipeline.request_timeout_ms must be greater than 0",
        ));
    }
    Ok(())
}
