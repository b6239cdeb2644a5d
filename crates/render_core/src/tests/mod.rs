//! Cross-module scenarios on the headless driver

mod frame_loop;
mod scheduling;
mod surface;

use std::sync::Arc;

use ash::vk;

use crate::core::config::ContextConfig;
use crate::driver::HeadlessDriver;
use crate::exec::{Context, ImageDesc};
use crate::frame::FrameChainDesc;

fn headless_context() -> (Arc<HeadlessDriver>, Context) {
    let driver = Arc::new(HeadlessDriver::typical());
    let context = Context::new(driver.clone(), &ContextConfig::default()).unwrap();
    (driver, context)
}

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

fn color_desc(frame_count: usize) -> FrameChainDesc {
    FrameChainDesc::default()
        .with_frame_count(frame_count)
        .with_role("color", ImageDesc::color(extent(64, 64), vk::Format::R8G8B8A8_UNORM))
}
