use std::sync::Arc;

use ash::vk;

use super::{color_desc, extent, headless_context};
use crate::core::config::{ContextConfig, SwapchainConfig};
use crate::driver::{DeviceCommand, HeadlessDriver};
use crate::exec::{Context, ExecError, OperationClass, PresentStatus, SubmissionBatch};
use crate::frame::{FrameChain, FrameChainDesc, FrameTarget, SURFACE_COLOR_ROLE};

fn surface_chain(context: &mut Context, driver: &HeadlessDriver, desc: &FrameChainDesc) -> FrameChain {
    let surface = driver.create_surface();
    FrameChain::surface(context, surface, desc).unwrap()
}

fn swapchain_handle(chain: &FrameChain) -> vk::SwapchainKHR {
    match chain.target() {
        FrameTarget::Surface(target) => target.handle(),
        FrameTarget::Offscreen { .. } => vk::SwapchainKHR::null(),
    }
}

#[test]
fn test_surface_chain_wraps_swap_images() {
    let (driver, mut context) = headless_context();
    let chain = surface_chain(&mut context, &driver, &color_desc(3));

    assert_eq!(chain.frame_count(), 3);
    let creation = driver.swapchain_creations()[0];
    assert_eq!(creation.old, vk::SwapchainKHR::null());
    assert!(chain.draw_frame().get(SURFACE_COLOR_ROLE).unwrap().memory().is_none());
    chain.destroy(&mut context);
    assert_eq!(driver.live_objects().swapchains, 0);
}

#[test]
fn test_surface_requires_present_class() {
    let driver = Arc::new(HeadlessDriver::typical());
    let config = ContextConfig::new([OperationClass::GraphicsAndCompute]);
    let mut context = Context::new(driver.clone(), &config).unwrap();
    let surface = driver.create_surface();

    let result = FrameChain::surface(&mut context, surface, &color_desc(2));
    assert!(matches!(result, Err(ExecError::InvalidOperationClass(OperationClass::Present))));
}

#[test]
fn test_acquire_follows_presentation_engine() {
    let (driver, mut context) = headless_context();
    let mut chain = surface_chain(&mut context, &driver, &color_desc(3));

    let mut draws = Vec::new();
    for _ in 0..4 {
        chain.next_frame(&mut context, None, None).unwrap();
        draws.push(chain.draw_index());
        assert_eq!(chain.present_frame(&context, &[]).unwrap(), PresentStatus::Presented);
    }
    assert_eq!(draws, vec![0, 1, 2, 0]);
    assert_eq!(chain.read_index(), 2);
    chain.destroy(&mut context);
}

#[test]
fn test_out_of_date_acquire_rebuilds_with_old_handle() {
    let (driver, mut context) = headless_context();
    let mut chain = surface_chain(&mut context, &driver, &color_desc(2));
    let original = swapchain_handle(&chain);
    let acquired = context.create_semaphore(1).unwrap()[0];
    let fence = context.create_fence(1, false).unwrap()[0];

    driver.invalidate_surface(1);
    let resets_before = driver.stats().fence_resets;
    chain.next_frame(&mut context, Some(acquired), Some(fence)).unwrap();

    let creations = driver.swapchain_creations();
    assert_eq!(creations.len(), 2);
    assert_eq!(creations[1].old, original);
    assert_eq!(swapchain_handle(&chain), creations[1].handle);
    assert_eq!(driver.stats().fence_resets, resets_before + 1);
    assert_eq!(driver.stats().acquires, 2);
    assert!(driver.is_signaled(acquired));
    assert!(driver.is_fence_signaled(fence));
    assert_eq!(driver.live_objects().swapchains, 1);

    chain.present_frame(&context, &[acquired]).unwrap();
    context.destroy_fence(&[fence]);
    context.destroy_semaphore(&[acquired]);
    chain.destroy(&mut context);
}

#[test]
fn test_rebuild_keeps_last_drawn_frame_readable() {
    let (driver, mut context) = headless_context();
    let mut chain = surface_chain(&mut context, &driver, &color_desc(3));
    for _ in 0..2 {
        chain.next_frame(&mut context, None, None).unwrap();
        chain.present_frame(&context, &[]).unwrap();
    }
    let drawn = chain.draw_index();
    assert_eq!(drawn, 1);

    driver.invalidate_surface(1);
    chain.next_frame(&mut context, None, None).unwrap();

    assert_eq!(driver.swapchain_creations().len(), 2);
    assert_eq!(chain.read_index(), drawn);
    assert_ne!(chain.read_index(), chain.draw_index());
    assert_eq!(chain.draw_index(), 0);
    chain.destroy(&mut context);
}

#[test]
fn test_rebuild_picks_up_new_extent() {
    let (driver, mut context) = headless_context();
    let mut chain = surface_chain(&mut context, &driver, &color_desc(2));

    driver.resize_surface(extent(800, 600));
    chain.next_frame(&mut context, None, None).unwrap();

    let color = chain.draw_frame().get(SURFACE_COLOR_ROLE).unwrap();
    assert_eq!(color.desc().extent, extent(800, 600));
    chain.destroy(&mut context);
}

#[test]
fn test_rebuild_retries_are_bounded() {
    let (driver, mut context) = headless_context();
    let desc = FrameChainDesc {
        swapchain: SwapchainConfig {
            max_rebuild_attempts: 3,
            ..SwapchainConfig::default()
        },
        ..color_desc(2)
    };
    let mut chain = surface_chain(&mut context, &driver, &desc);

    driver.invalidate_surface(10);
    let result = chain.next_frame(&mut context, None, None);
    assert!(matches!(result, Err(ExecError::SwapchainRebuildExhausted { attempts: 3 })));
    assert_eq!(driver.stats().acquires, 4);
    chain.destroy(&mut context);
}

#[test]
fn test_suboptimal_acquire_rebuilds_before_next_acquire() {
    let (driver, mut context) = headless_context();
    let mut chain = surface_chain(&mut context, &driver, &color_desc(2));

    driver.force_suboptimal(1);
    chain.next_frame(&mut context, None, None).unwrap();
    assert_eq!(driver.swapchain_creations().len(), 1);
    chain.present_frame(&context, &[]).unwrap();

    chain.next_frame(&mut context, None, None).unwrap();
    assert_eq!(driver.swapchain_creations().len(), 2);
    chain.destroy(&mut context);
}

#[test]
fn test_out_of_date_present_is_a_status() {
    let (driver, mut context) = headless_context();
    let mut chain = surface_chain(&mut context, &driver, &color_desc(2));

    chain.next_frame(&mut context, None, None).unwrap();
    driver.fail_next_presents(1);
    assert_eq!(chain.present_frame(&context, &[]).unwrap(), PresentStatus::OutOfDate);

    chain.next_frame(&mut context, None, None).unwrap();
    assert_eq!(driver.swapchain_creations().len(), 2);
    chain.destroy(&mut context);
}

#[test]
fn test_present_requires_acquire() {
    let (driver, mut context) = headless_context();
    let mut chain = surface_chain(&mut context, &driver, &color_desc(2));

    assert!(matches!(chain.present_frame(&context, &[]), Err(ExecError::NoAcquiredImage)));
    assert!(matches!(chain.next_frame_now(), Err(ExecError::AcquireRequired)));
    chain.destroy(&mut context);
}

#[test]
fn test_surface_frame_ends_in_present_layout() {
    let (driver, mut context) = headless_context();
    let mut chain = surface_chain(&mut context, &driver, &color_desc(2));
    let semaphores = context.create_semaphore(2).unwrap();
    let (acquired, rendered) = (semaphores[0], semaphores[1]);
    let op = chain.operation_class();

    chain.next_frame(&mut context, Some(acquired), None).unwrap();
    let mut batch = SubmissionBatch::from(
        chain
            .predraw()
            .with_wait(acquired, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
    );
    batch += chain.postdraw().with_signal(rendered);
    context.engine_execute(op, &batch).unwrap();
    chain.present_frame(&context, &[rendered]).unwrap();
    context.engine_wait(&[op]).unwrap();

    let executed = driver.executed();
    let layouts: Vec<vk::ImageLayout> = executed
        .iter()
        .filter_map(|entry| match entry.command {
            DeviceCommand::Transition(t) => Some(t.new_layout),
            _ => None,
        })
        .collect();
    assert_eq!(
        layouts,
        vec![vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR]
    );
    assert!(matches!(
        executed.last().map(|entry| &entry.command),
        Some(DeviceCommand::Present { image_index: 0, .. })
    ));

    context.destroy_semaphore(&semaphores);
    chain.destroy(&mut context);
}
