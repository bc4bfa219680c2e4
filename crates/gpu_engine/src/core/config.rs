//! # Context Configuration
//!
//! Startup parameters for [`crate::render::Context`]. Everything except the
//! pipeline cache blob can be loaded from TOML or RON through the
//! [`Config`] trait; the cache blob is binary and is passed in by the host.

use serde::{Serialize, Deserialize};

pub use crate::config::{Config, ConfigError, ConfigFormat};

/// Largest staging ring the context will ever allocate
pub const MAX_STAGING_BUFFER_SIZE: u32 = 256 * 1024 * 1024;

/// Startup configuration for a GPU context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Application name reported to the driver
    pub application_name: String,
    /// Application version reported to the driver
    pub application_version: u32,
    /// Enable `VK_LAYER_KHRONOS_validation`; `None` enables it in debug builds
    pub enable_validation: Option<bool>,
    /// Abort the process on a validation ERROR message
    pub terminate_on_validation_error: bool,
    /// Requested staging ring size in bytes, clamped by the device limits
    pub staging_buffer_size: u32,
    /// Initial bindless texture capacity
    pub initial_max_textures: u32,
    /// Initial bindless sampler capacity
    pub initial_max_samplers: u32,
    /// Rank discrete GPUs above integrated ones
    pub prefer_discrete_gpu: bool,
    /// Serialized `VkPipelineCache` from a previous run
    #[serde(skip)]
    pub pipeline_cache_data: Vec<u8>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            application_name: "gpu_engine".to_string(),
            application_version: 1,
            enable_validation: None,
            terminate_on_validation_error: false,
            staging_buffer_size: 32 * 1024 * 1024,
            initial_max_textures: 16,
            initial_max_samplers: 16,
            prefer_discrete_gpu: true,
            pipeline_cache_data: Vec::new(),
        }
    }
}

impl ContextConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Force validation layers on or off
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Abort on validation errors
    pub fn with_terminate_on_validation_error(mut self, terminate: bool) -> Self {
        self.terminate_on_validation_error = terminate;
        self
    }

    /// Set the requested staging ring size
    pub fn with_staging_buffer_size(mut self, size: u32) -> Self {
        self.staging_buffer_size = size;
        self
    }

    /// Set the initial bindless capacities
    pub fn with_initial_bindless_capacity(mut self, max_textures: u32, max_samplers: u32) -> Self {
        self.initial_max_textures = max_textures;
        self.initial_max_samplers = max_samplers;
        self
    }

    /// Seed the pipeline cache
    pub fn with_pipeline_cache_data(mut self, data: Vec<u8>) -> Self {
        self.pipeline_cache_data = data;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.staging_buffer_size < 64 * 1024 {
            return Err("Staging buffer must be at least 64 KiB".to_string());
        }
        if self.staging_buffer_size % 16 != 0 {
            return Err("Staging buffer size must be a multiple of 16".to_string());
        }
        if self.initial_max_textures == 0 || self.initial_max_samplers == 0 {
            return Err("Initial bindless capacities must be non-zero".to_string());
        }
        Ok(())
    }
}

impl Config for ContextConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ContextConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_max_textures, 16);
        assert_eq!(config.initial_max_samplers, 16);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ContextConfig::new().with_staging_buffer_size(1024).validate().is_err());
        assert!(ContextConfig::new().with_staging_buffer_size(1024 * 1024 + 4).validate().is_err());
        assert!(ContextConfig::new().with_initial_bindless_capacity(0, 16).validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_skips_cache_blob() {
        let config = ContextConfig::new()
            .with_application_name("round_trip")
            .with_validation(false)
            .with_pipeline_cache_data(vec![1, 2, 3]);

        let text = config.to_string_as(ConfigFormat::Toml).unwrap();
        assert!(!text.contains("pipeline_cache_data"));

        let parsed = ContextConfig::from_str_as(&text, ConfigFormat::Toml).unwrap();
        assert_eq!(parsed.application_name, "round_trip");
        assert_eq!(parsed.enable_validation, Some(false));
        assert!(parsed.pipeline_cache_data.is_empty());
    }

    #[test]
    fn test_ron_partial_document_uses_defaults() {
        let parsed = ContextConfig::from_str_as(
            "(staging_buffer_size: 1048576)",
            ConfigFormat::Ron,
        ).unwrap();
        assert_eq!(parsed.staging_buffer_size, 1024 * 1024);
        assert_eq!(parsed.initial_max_textures, 16);
        assert!(parsed.prefer_discrete_gpu);
    }

    #[test]
    fn test_load_and_save_file() {
        let path =
            std::env::temp_dir().join(format!("gpu_engine_config_{}.toml", std::process::id()));
        let config = ContextConfig::new().with_initial_bindless_capacity(32, 8);
        config.save_to_file(&path).unwrap();

        let loaded = ContextConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.initial_max_textures, 32);
        assert_eq!(loaded.initial_max_samplers, 8);

        std::fs::remove_file(&path).unwrap();
    }
}
