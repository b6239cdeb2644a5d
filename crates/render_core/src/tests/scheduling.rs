use ash::vk;

use super::headless_context;
use crate::exec::{CommandBatch, CommandBufferLevel, ExecError, OperationClass, SemaphorePool, SubmissionBatch};

#[test]
fn test_consumer_runs_after_producer_on_another_queue() {
    let (driver, mut context) = headless_context();
    let mut pool = SemaphorePool::new(&mut context, 4).unwrap();

    let upload = context
        .allocate_command_buffer(OperationClass::Transfer, 1, CommandBufferLevel::Primary)
        .unwrap();
    let draw = context
        .allocate_command_buffer(OperationClass::GraphicsAndCompute, 1, CommandBufferLevel::Primary)
        .unwrap();
    driver.record_marker(upload[0].raw(), "upload");
    driver.record_marker(draw[0].raw(), "draw");

    let mut producer = CommandBatch::new();
    producer.add_all(&upload).unwrap();
    let mut consumer = CommandBatch::new();
    consumer.add_all(&draw).unwrap();
    let edge = consumer
        .depends_on(&mut pool, vk::PipelineStageFlags::VERTEX_INPUT, &mut producer)
        .unwrap();

    // Consumer goes first and must not run before the upload.
    context
        .engine_execute(OperationClass::GraphicsAndCompute, &consumer.build().unwrap().into())
        .unwrap();
    assert!(driver.markers().is_empty());

    context
        .engine_execute(OperationClass::Transfer, &producer.build().unwrap().into())
        .unwrap();
    context
        .engine_wait(&[OperationClass::Transfer, OperationClass::GraphicsAndCompute])
        .unwrap();

    assert_eq!(driver.markers(), vec!["upload".to_string(), "draw".to_string()]);
    let families: Vec<u32> = driver.executed().iter().map(|entry| entry.family).collect();
    assert_eq!(families, vec![2, 0]);

    assert!(pool.release(edge));
    context.release_command_buffer(OperationClass::Transfer, &upload).unwrap();
    context.release_command_buffer(OperationClass::GraphicsAndCompute, &draw).unwrap();
    pool.destroy(&mut context);
}

#[test]
fn test_held_producer_blocks_consumer() {
    let (driver, mut context) = headless_context();
    let mut pool = SemaphorePool::new(&mut context, 1).unwrap();
    let upload = context
        .allocate_command_buffer(OperationClass::Transfer, 1, CommandBufferLevel::Primary)
        .unwrap();
    let draw = context
        .allocate_command_buffer(OperationClass::GraphicsAndCompute, 1, CommandBufferLevel::Primary)
        .unwrap();
    driver.record_marker(upload[0].raw(), "upload");
    driver.record_marker(draw[0].raw(), "draw");

    let mut producer = CommandBatch::new();
    producer.add_all(&upload).unwrap();
    let mut consumer = CommandBatch::new();
    consumer.add_all(&draw).unwrap();
    consumer
        .depends_on(&mut pool, vk::PipelineStageFlags::TRANSFER, &mut producer)
        .unwrap();

    driver.hold_queue(2);
    context
        .execute(OperationClass::Transfer, &producer.build().unwrap().into(), None)
        .unwrap();
    context
        .execute(OperationClass::GraphicsAndCompute, &consumer.build().unwrap().into(), None)
        .unwrap();
    assert_eq!(driver.pending(0), 1);
    assert!(driver.markers().is_empty());

    driver.release_queue(2);
    assert_eq!(driver.markers(), vec!["upload".to_string(), "draw".to_string()]);

    pool.reset();
    context.release_command_buffer(OperationClass::Transfer, &upload).unwrap();
    context.release_command_buffer(OperationClass::GraphicsAndCompute, &draw).unwrap();
    pool.destroy(&mut context);
}

#[test]
fn test_dependency_pool_exhaustion() {
    let (_driver, mut context) = headless_context();
    let mut pool = SemaphorePool::new(&mut context, 1).unwrap();
    let mut producer = CommandBatch::new();
    let mut first = CommandBatch::new();
    let mut second = CommandBatch::new();

    first
        .depends_on(&mut pool, vk::PipelineStageFlags::TRANSFER, &mut producer)
        .unwrap();
    let result = second.depends_on(&mut pool, vk::PipelineStageFlags::TRANSFER, &mut producer);
    assert!(matches!(result, Err(ExecError::SemaphorePoolExhausted { capacity: 1 })));
    assert_eq!(pool.in_use(), 1);
    pool.destroy(&mut context);
}

#[test]
fn test_engine_protocol_across_classes() {
    let (driver, mut context) = headless_context();
    let transfer = context
        .allocate_command_buffer(OperationClass::Transfer, 2, CommandBufferLevel::Primary)
        .unwrap();
    assert_eq!(transfer.len(), 2);

    let mut batch = CommandBatch::new();
    batch.add_all(&transfer).unwrap();
    let submissions = SubmissionBatch::from(batch.build().unwrap());

    context.engine_execute(OperationClass::Transfer, &submissions).unwrap();
    assert!(context.is_in_flight(OperationClass::Transfer));
    assert!(!context.is_in_flight(OperationClass::GraphicsAndCompute));

    context.engine_wait(&[OperationClass::Transfer]).unwrap();
    let after_first = driver.stats();
    context.engine_wait(&[OperationClass::Transfer]).unwrap();
    assert_eq!(driver.stats(), after_first);
    assert!(!context.is_in_flight(OperationClass::Transfer));

    context.release_command_buffer(OperationClass::Transfer, &transfer).unwrap();
}
