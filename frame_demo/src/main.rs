//! Frame loop demo
//!
//! Drives an offscreen frame chain with a transfer-to-graphics dependency per
//! frame. Runs on the first Vulkan device found, or on the headless driver when
//! no device is available.
//!
//! Usage: `frame_demo [config.toml|config.ron] [frames]`

use std::sync::Arc;

use render_core::config::{Config, ConfigError};
use render_core::core::config::{ContextConfig, EngineConfig};
use render_core::driver::{Driver, HeadlessDriver, VulkanDriver, VulkanDriverConfig};
use render_core::exec::{CommandBatch, Context, ExecError, ImageDesc, OperationClass, SemaphorePool};
use render_core::foundation::logging;
use render_core::foundation::time::Stopwatch;
use render_core::frame::{FrameChain, FrameChainDesc};

use ash::vk;

const DEFAULT_FRAMES: u32 = 120;

#[derive(thiserror::Error, Debug)]
enum DemoError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("execution: {0}")]
    Exec(#[from] ExecError),

    #[error("invalid frame count argument: {0}")]
    FrameArg(String),
}

fn main() {
    if let Err(err) = run() {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), DemoError> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => EngineConfig::load_from_file(&path)?,
        None => EngineConfig::default(),
    };
    let frames = match args.next() {
        Some(arg) => arg.parse::<u32>().map_err(|_| DemoError::FrameArg(arg))?,
        None => DEFAULT_FRAMES,
    };

    logging::init_with_level(&config.logging.level);
    config.validate()?;

    let driver = select_driver();
    log::info!("Running {frames} frames on {}", driver.name());

    let context_config = windowless(&config.context);
    let mut context = Context::new(driver, &context_config)?;
    let mut pool = SemaphorePool::new(&mut context, context_config.semaphore_pool_size)?;

    let desc = FrameChainDesc::from_config(&config.frames, &config.swapchain).with_role(
        "color",
        ImageDesc::color(vk::Extent2D { width: 800, height: 600 }, vk::Format::R8G8B8A8_UNORM),
    );
    let mut chain = FrameChain::offscreen(&mut context, &desc)?;

    let render = chain.operation_class();
    let classes = [OperationClass::Transfer, render];
    let stopwatch = Stopwatch::start_new();
    let mut rendered = 0;

    while rendered < frames {
        if !chain.ready_to_render() {
            std::thread::yield_now();
            continue;
        }

        context.engine_wait(&classes)?;
        pool.reset();
        chain.next_frame(&mut context, None, None)?;

        let mut upload = CommandBatch::new();
        let mut draw = CommandBatch::new();
        draw.depends_on(&mut pool, vk::PipelineStageFlags::TRANSFER, &mut upload)?;

        context.engine_execute(OperationClass::Transfer, &upload.build()?.into())?;
        context.engine_execute(render, &chain.wrap(draw.build()?))?;
        rendered += 1;

        if rendered % 30 == 0 {
            log::debug!("frame {rendered}: draw slot {}, read slot {}", chain.draw_index(), chain.read_index());
        }
    }

    context.engine_wait(&classes)?;
    let elapsed = stopwatch.elapsed().as_secs_f64();
    log::info!(
        "{rendered} frames in {elapsed:.3}s ({:.1} fps)",
        f64::from(rendered) / elapsed.max(f64::EPSILON)
    );

    chain.destroy(&mut context);
    pool.destroy(&mut context);
    Ok(())
}

/// Context configuration without the present class
///
/// The demo opens no window, so devices without presentation support
/// must still be usable.
fn windowless(config: &ContextConfig) -> ContextConfig {
    let mut config = config.clone();
    config.operation_classes.retain(|&op| op != OperationClass::Present);
    if config.operation_classes.is_empty() {
        config.operation_classes = vec![OperationClass::Transfer, OperationClass::GraphicsAndCompute];
    }
    config
}

fn select_driver() -> Arc<dyn Driver> {
    match VulkanDriver::new(&VulkanDriverConfig::default(), None) {
        Ok(driver) => Arc::new(driver),
        Err(err) => {
            log::warn!("Vulkan unavailable ({err}), falling back to the headless driver");
            Arc::new(HeadlessDriver::typical())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_core::driver::{QueueCapabilities, QueueFamily};

    fn windowless_device() -> Arc<HeadlessDriver> {
        Arc::new(HeadlessDriver::new(vec![QueueFamily {
            index: 0,
            capabilities: QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
            queue_count: 1,
        }]))
    }

    #[test]
    fn test_default_config_runs_without_present_support() {
        let config = EngineConfig::default();
        assert!(matches!(
            Context::new(windowless_device(), &config.context),
            Err(ExecError::UnsupportedOperationClass(OperationClass::Present))
        ));

        let context_config = windowless(&config.context);
        assert!(!context_config.operation_classes.contains(&OperationClass::Present));
        let context = Context::new(windowless_device(), &context_config).unwrap();
        assert!(context.queue(OperationClass::Transfer).is_ok());
        assert!(context.queue(OperationClass::GraphicsAndCompute).is_ok());
    }

    #[test]
    fn test_windowless_keeps_pool_size() {
        let config = ContextConfig::new([OperationClass::Present]).with_semaphore_pool_size(7);
        let context_config = windowless(&config);
        assert_eq!(context_config.semaphore_pool_size, 7);
        assert_eq!(
            context_config.operation_classes,
            vec![OperationClass::Transfer, OperationClass::GraphicsAndCompute]
        );
    }
}
