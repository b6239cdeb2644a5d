//! Error taxonomy of the execution core

use ash::vk;
use thiserror::Error;

use super::OperationClass;
use crate::config::ConfigError;

/// Errors raised by the execution core and frame chains
#[derive(Error, Debug)]
pub enum ExecError {
    /// Any Vulkan result without a dedicated variant
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Host memory exhausted
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Device memory exhausted, or no memory type satisfies a request
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// The logical device was lost
    #[error("Device lost")]
    DeviceLost,

    /// Instance, device or queue setup failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// The operation class was not registered with the context
    #[error("Operation class {0:?} is not registered with this context")]
    InvalidOperationClass(OperationClass),

    /// No queue family on the device supports the operation class
    #[error("No queue family supports operation class {0:?}")]
    UnsupportedOperationClass(OperationClass),

    /// Every semaphore of the pool is in use
    #[error("Semaphore pool exhausted ({capacity} semaphores in use)")]
    SemaphorePoolExhausted {
        /// Pool size
        capacity: usize,
    },

    /// The batch was already turned into a submission
    #[error("Command batch already built")]
    BatchAlreadyBuilt,

    /// A command buffer handle is stale or belongs to another pool
    #[error("Command buffer is not tracked by this pool")]
    UnknownCommandBuffer,

    /// Frame chain ring size out of range
    #[error("Invalid frame count: {0}")]
    InvalidFrameCount(usize),

    /// Acquire kept reporting out-of-date after repeated rebuilds
    #[error("Swapchain still out of date after {attempts} rebuilds")]
    SwapchainRebuildExhausted {
        /// Rebuilds attempted
        attempts: u32,
    },

    /// A descriptor array was requested from a source without set layouts
    #[error("Descriptor layout source has no set layouts")]
    NoDescriptorSetLayouts,

    /// Presentation requested without an acquired image
    #[error("No swapchain image acquired")]
    NoAcquiredImage,

    /// The frame chain presents to a surface and must go through acquire
    #[error("Surface frame chains advance through next_frame")]
    AcquireRequired,

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ExecError {
    /// True for errors after which the device should not be used further
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost | Self::InitializationFailed(_))
    }
}

impl From<vk::Result> for ExecError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_INITIALIZATION_FAILED => {
                Self::InitializationFailed("driver reported VK_ERROR_INITIALIZATION_FAILED".to_string())
            }
            other => Self::Api(other),
        }
    }
}

/// Result type for the execution core
pub type ExecResult<T> = Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_results_map_one_to_one() {
        assert!(matches!(
            ExecError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            ExecError::OutOfHostMemory
        ));
        assert!(matches!(
            ExecError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            ExecError::OutOfDeviceMemory
        ));
        assert!(ExecError::from(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(matches!(
            ExecError::from(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
            ExecError::Api(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
        ));
    }
}
