//! # Engine Configuration
//!
//! Tunables for the execution core, grouped by the subsystem that reads them:
//!
//! - **Context**: which operation classes get a queue, semaphore pool sizing
//! - **Frames**: frame count and optional frame-rate cap for frame chains
//! - **Swapchain**: presentation preferences and the rebuild retry bound
//! - **Logging**: default log filter

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError};
use crate::exec::OperationClass;

/// Largest ring a frame chain may be configured with
pub const MAX_FRAME_COUNT: usize = 8;

/// Context construction settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Operation classes that receive a queue, command pools and an execution fence
    pub operation_classes: Vec<OperationClass>,
    /// Size of the semaphore pools created for dependency edges
    pub semaphore_pool_size: usize,
}

impl ContextConfig {
    /// Configuration registering the given operation classes
    pub fn new(operation_classes: impl Into<Vec<OperationClass>>) -> Self {
        Self {
            operation_classes: operation_classes.into(),
            ..Self::default()
        }
    }

    /// Set semaphore pool size
    pub fn with_semaphore_pool_size(mut self, size: usize) -> Self {
        self.semaphore_pool_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_classes.is_empty() {
            return Err(ConfigError::Invalid("at least one operation class is required".to_string()));
        }
        if self.semaphore_pool_size == 0 {
            return Err(ConfigError::Invalid("semaphore pool size must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            operation_classes: vec![
                OperationClass::Transfer,
                OperationClass::GraphicsAndCompute,
                OperationClass::Present,
            ],
            semaphore_pool_size: 64,
        }
    }
}

/// Frame chain settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrameChainConfig {
    /// Number of image sets in the ring (2 = double, 3 = triple buffering)
    pub frame_count: usize,
    /// Cap on how often the chain may advance; `None` renders every loop iteration
    pub target_fps: Option<f32>,
}

impl FrameChainConfig {
    /// Set frame count
    pub fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Set target FPS
    pub fn with_target_fps(mut self, fps: f32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=MAX_FRAME_COUNT).contains(&self.frame_count) {
            return Err(ConfigError::Invalid(format!(
                "frame count must be within 2..={MAX_FRAME_COUNT}, got {}",
                self.frame_count
            )));
        }
        if let Some(fps) = self.target_fps {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(ConfigError::Invalid(format!("target fps must be positive, got {fps}")));
            }
        }
        Ok(())
    }
}

impl Default for FrameChainConfig {
    fn default() -> Self {
        Self {
            frame_count: 2,
            target_fps: None,
        }
    }
}

/// Swapchain settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SwapchainConfig {
    /// Prefer mailbox presentation over FIFO when the surface offers it
    pub prefer_mailbox: bool,
    /// Prefer an sRGB surface format
    pub prefer_srgb: bool,
    /// Consecutive out-of-date acquires tolerated before giving up
    pub max_rebuild_attempts: u32,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            prefer_mailbox: true,
            prefer_srgb: true,
            max_rebuild_attempts: 8,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// # Complete Engine Configuration
///
/// Top-level configuration applications load from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Context construction
    pub context: ContextConfig,
    /// Frame chains
    pub frames: FrameChainConfig,
    /// Surface presentation
    pub swapchain: SwapchainConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.context.validate()?;
        self.frames.validate()?;
        if self.swapchain.max_rebuild_attempts == 0 {
            return Err(ConfigError::Invalid("max rebuild attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Config for EngineConfig {}
