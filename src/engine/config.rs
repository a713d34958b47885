//! Sampling configuration shared by the generating backends.
//!
//! All fields have safe defaults. Configuration is validated before use.

use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// Sampling parameters that bound and shape generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = near-deterministic, 1.0 = creative)
    pub temperature: f32,
    /// Top-p (nucleus) sampling threshold (0.0–1.0]
    pub top_p: f32,
    /// Maximum tokens to generate
    pub max_tokens: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 512,
        }
    }
}

impl SamplingConfig {
    /// Validate configuration values. Returns error on invalid values.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(EngineError::InvalidConfig(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(EngineError::InvalidConfig(
                "top_p must be in range (0.0, 1.0]".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(EngineError::InvalidConfig("max_tokens must be > 0".into()));
        }
        Ok(())
    }
}
