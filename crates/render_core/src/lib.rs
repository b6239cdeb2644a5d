//! # Render Core
//!
//! Execution and synchronization backbone of a Vulkan rendering engine.
//!
//! ## Features
//!
//! - **Context**: one queue per operation class, command pools, tracked
//!   semaphores, fences, memory and resources with bulk teardown
//! - **Batching**: command batches with explicit cross-queue dependency edges
//!   and concatenable submission batches
//! - **Backpressure**: `engine_execute` / `engine_wait` keep at most one
//!   submission per operation class in flight
//! - **Frame chains**: double/triple-buffered offscreen rings and swap objects
//!   that rebuild themselves when the surface goes out of date
//! - **Drivers**: an `ash` driver for real devices and a deterministic headless
//!   driver for tests and GPU-less hosts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use render_core::prelude::*;
//!
//! fn main() -> Result<(), ExecError> {
//!     let config = EngineConfig::default();
//!     let driver = Arc::new(HeadlessDriver::typical());
//!     let mut context = Context::new(driver, &config.context)?;
//!
//!     let desc = FrameChainDesc::from_config(&config.frames, &config.swapchain)
//!         .with_role("color", ImageDesc::color(vk::Extent2D { width: 640, height: 480 }, vk::Format::R8G8B8A8_UNORM));
//!     let mut chain = FrameChain::offscreen(&mut context, &desc)?;
//!
//!     let op = OperationClass::GraphicsAndCompute;
//!     for _ in 0..3 {
//!         context.engine_wait(&[op])?;
//!         chain.next_frame(&mut context, None, None)?;
//!         context.engine_execute(op, &chain.wrap(SubmissionBatch::new()))?;
//!     }
//!
//!     context.engine_wait(&[op])?;
//!     chain.destroy(&mut context);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::cast_possible_truncation
)]

pub mod config;
pub mod core;
pub mod driver;
pub mod exec;
pub mod foundation;
pub mod frame;

#[cfg(test)]
mod tests;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError},
        core::config::{ContextConfig, EngineConfig, FrameChainConfig, LoggingConfig, SwapchainConfig},
        driver::{Driver, HeadlessDriver, QueueCapabilities, QueueFamily, VulkanDriver, VulkanDriverConfig},
        exec::{
            CommandBatch, CommandBuffer, CommandBufferLevel, Context, DescriptorArray, ExecError, ExecResult, ImageDesc,
            OperationClass, PresentStatus, SemaphorePool, SharedContext, Submission, SubmissionBatch,
        },
        foundation::time::{FrameRateGate, Stopwatch},
        frame::{FrameChain, FrameChainDesc, ImageSet},
    };
    pub use ash::vk;
}
