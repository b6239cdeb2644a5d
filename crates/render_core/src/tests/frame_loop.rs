use std::sync::Arc;

use super::{color_desc, headless_context};
use crate::core::config::ContextConfig;
use crate::driver::HeadlessDriver;
use crate::exec::{CommandBatch, CommandBufferLevel, Context, ExecError, OperationClass, SemaphorePool};
use crate::frame::FrameChain;

#[test]
fn test_triple_buffered_rotation() {
    let (_driver, mut context) = headless_context();
    let mut chain = FrameChain::offscreen(&mut context, &color_desc(3)).unwrap();
    assert_eq!((chain.draw_index(), chain.read_index()), (0, 2));

    let mut observed = Vec::new();
    for _ in 0..3 {
        chain.next_frame_now().unwrap();
        observed.push((chain.draw_index(), chain.read_index()));
    }
    assert_eq!(observed, vec![(1, 0), (2, 1), (0, 2)]);

    chain.next_frame(&mut context, None, None).unwrap();
    assert_eq!((chain.draw_index(), chain.read_index()), (1, 0));

    chain.destroy(&mut context);
}

#[test]
fn test_read_frame_is_previous_draw_frame() {
    let (_driver, mut context) = headless_context();
    let mut chain = FrameChain::offscreen(&mut context, &color_desc(2)).unwrap();

    let drawn = chain.draw_frame().get("color").unwrap().raw();
    chain.next_frame_now().unwrap();
    assert_eq!(chain.read_frame().get("color").unwrap().raw(), drawn);

    chain.destroy(&mut context);
}

#[test]
fn test_offscreen_frame_loop_with_backpressure() {
    let (driver, mut context) = headless_context();
    let op = OperationClass::GraphicsAndCompute;
    let mut chain = FrameChain::offscreen(&mut context, &color_desc(2)).unwrap();
    let work = context.allocate_command_buffer(op, 1, CommandBufferLevel::Primary).unwrap();
    driver.record_marker(work[0].raw(), "frame");

    for _ in 0..4 {
        context.engine_wait(&[op]).unwrap();
        chain.next_frame(&mut context, None, None).unwrap();

        let mut batch = CommandBatch::new();
        batch.add_all(&work).unwrap();
        context.engine_execute(op, &chain.wrap(batch.build().unwrap())).unwrap();
        assert!(context.is_in_flight(op));
    }
    context.engine_wait(&[op]).unwrap();

    assert_eq!(driver.markers().len(), 4);
    assert_eq!(driver.stats().fence_waits, 4);

    context.release_command_buffer(op, &work).unwrap();
    chain.destroy(&mut context);
}

#[test]
fn test_chain_on_unregistered_class() {
    let (_driver, mut context) = headless_context();
    let desc = color_desc(2).with_operation_class(OperationClass::Compute);
    let result = FrameChain::offscreen(&mut context, &desc);
    assert!(matches!(result, Err(ExecError::InvalidOperationClass(OperationClass::Compute))));
}

#[test]
fn test_teardown_leaves_nothing_alive() {
    let driver = Arc::new(HeadlessDriver::typical());
    let surface = driver.create_surface();
    {
        let mut context = Context::new(driver.clone(), &ContextConfig::default()).unwrap();
        let pool = SemaphorePool::new(&mut context, 8).unwrap();
        let offscreen = FrameChain::offscreen(&mut context, &color_desc(3)).unwrap();
        let mut swap = FrameChain::surface(&mut context, surface, &color_desc(2)).unwrap();
        let acquired = context.create_semaphore(1).unwrap();

        swap.next_frame(&mut context, Some(acquired[0]), None).unwrap();
        swap.present_frame(&context, &acquired).unwrap();

        offscreen.destroy(&mut context);
        swap.destroy(&mut context);
        pool.destroy(&mut context);
        context.destroy_semaphore(&acquired);
        assert_eq!(context.tracked_counts(), Default::default());
    }
    driver.destroy_surface(surface);
    assert!(driver.live_objects().is_empty(), "{:?}", driver.live_objects());
}

#[test]
fn test_context_drop_reclaims_forgotten_chain() {
    let driver = Arc::new(HeadlessDriver::typical());
    {
        let mut context = Context::new(driver.clone(), &ContextConfig::default()).unwrap();
        let chain = FrameChain::offscreen(&mut context, &color_desc(2)).unwrap();
        let _ = context.create_fence(3, false).unwrap();
        std::mem::forget(chain);
    }
    assert!(driver.live_objects().is_empty(), "{:?}", driver.live_objects());
}
