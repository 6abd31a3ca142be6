//! Runtime configuration of an [`AcceleratorContext`](crate::AcceleratorContext).

use crate::error::{DevlaError, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Environment variable selecting the backend (`emulated` or `wgpu`).
pub const BACKEND_ENV: &str = "DEVLA_BACKEND";
/// Environment variable holding the emulated device memory limit in bytes.
pub const MEMORY_LIMIT_ENV: &str = "DEVLA_MEMORY_LIMIT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Emulated,
    Wgpu,
}

impl std::str::FromStr for BackendKind {
    type Err = DevlaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emulated" | "cpu" => Ok(BackendKind::Emulated),
            "wgpu" | "gpu" => Ok(BackendKind::Wgpu),
            other => Err(DevlaError::BackendInit(format!(
                "unknown backend '{other}' (expected 'emulated' or 'wgpu')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerPreference {
    LowPower,
    #[default]
    HighPerformance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub backend: BackendKind,
    /// Device memory cap in bytes. Only honoured by the emulated backend.
    pub memory_limit: Option<usize>,
    /// Adapter selection hint for the wgpu backend.
    pub power_preference: PowerPreference,
    /// Create the dense and sparse BLAS handles while building the context
    /// instead of on first use.
    pub eager_handles: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Emulated,
            memory_limit: None,
            power_preference: PowerPreference::HighPerformance,
            eager_handles: false,
        }
    }
}

impl ContextConfig {
    /// Defaults overridden by `DEVLA_BACKEND` and `DEVLA_MEMORY_LIMIT`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = env::var(BACKEND_ENV) {
            config.backend = value.parse()?;
        }
        if let Ok(value) = env::var(MEMORY_LIMIT_ENV) {
            let limit = value.trim().parse::<usize>().map_err(|e| {
                DevlaError::BackendInit(format!("invalid {MEMORY_LIMIT_ENV} '{value}': {e}"))
            })?;
            config.memory_limit = Some(limit);
        }
        log::debug!("Context configuration: {:?}", config);
        Ok(config)
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_eager_handles(mut self, eager: bool) -> Self {
        self.eager_handles = eager;
        self
    }
}
