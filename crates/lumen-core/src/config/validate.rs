//! Configuration validation with range checks.

use crate::error::ConfigError;

use super::Config;

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.topic.trim().is_empty() {
            return Err(invalid("broker.topic must not be empty"));
        }
        if self.broker.partitions == 0 {
            return Err(invalid("broker.partitions must be > 0"));
        }
        if self.broker.replication_factor == 0 {
            return Err(invalid("broker.replication_factor must be > 0"));
        }
        if self.worker.num_workers == 0 {
            return Err(invalid("worker.num_workers must be > 0"));
        }
        if self.worker.retry_attempts == 0 {
            return Err(invalid("worker.retry_attempts must be > 0"));
        }
        if self.worker.stage_timeout_ms == 0 {
            return Err(invalid("worker.stage_timeout_ms must be > 0"));
        }
        if self.worker.shutdown_timeout_secs == 0 {
            return Err(invalid("worker.shutdown_timeout_secs must be > 0"));
        }
        if self.worker.stats_interval_secs == 0 {
            return Err(invalid("worker.stats_interval_secs must be > 0"));
        }
        if self.storage.bucket.trim().is_empty() {
            return Err(invalid("storage.bucket must not be empty"));
        }
        if self.storage.max_upload_size_mb == 0 {
            return Err(invalid("storage.max_upload_size_mb must be > 0"));
        }
        let processing = &self.processing;
        if processing.default_jpeg_quality == 0 || processing.default_jpeg_quality > 100 {
            return Err(invalid(
                "processing.default_jpeg_quality must be between 1 and 100",
            ));
        }
        if !(0.0..=1.0).contains(&processing.watermark_opacity) {
            return Err(invalid(
                "processing.watermark_opacity must be between 0.0 and 1.0",
            ));
        }
        if processing.watermark_font_size == 0
            || processing.watermark_font_size > processing.max_image_dimension
        {
            return Err(invalid(
                "processing.watermark_font_size must be > 0 and <= max_image_dimension",
            ));
        }
        if processing.default_thumbnail_size == 0
            || processing.default_thumbnail_size > processing.max_thumbnail_size
        {
            return Err(invalid(
                "processing.default_thumbnail_size must be > 0 and <= max_thumbnail_size",
            ));
        }
        if processing.max_image_dimension == 0 {
            return Err(invalid("processing.max_image_dimension must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_passes_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.worker.num_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("num_workers"));
    }

    #[test]
    fn test_validate_rejects_zero_retry_attempts() {
        let mut config = Config::default();
        config.worker.retry_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_attempts"));
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        let mut config = Config::default();
        config.broker.partitions = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("partitions"));
    }

    #[test]
    fn test_validate_rejects_invalid_quality() {
        let mut config = Config::default();
        config.processing.default_jpeg_quality = 0;
        assert!(config.validate().is_err());

        config.processing.default_jpeg_quality = 101;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_jpeg_quality"));
    }

    #[test]
    fn test_validate_rejects_invalid_opacity() {
        let mut config = Config::default();
        config.processing.watermark_opacity = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("watermark_opacity"));

        config.processing.watermark_opacity = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_thumbnail_default_above_max() {
        let mut config = Config::default();
        config.processing.default_thumbnail_size = 2000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_thumbnail_size"));
    }

    #[test]
    fn test_validate_rejects_font_size_above_max_dimension() {
        let mut config = Config::default();
        config.processing.max_image_dimension = 500;
        config.processing.watermark_font_size = 600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("watermark_font_size"));
    }

    #[test]
    fn test_validate_rejects_empty_bucket() {
        let mut config = Config::default();
        config.storage.bucket = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage.bucket"));
    }
}
