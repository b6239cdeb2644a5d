//! Execution core
//!
//! Queues per operation class, command buffer pools, submission batching,
//! pooled dependency semaphores and the context tying them together.

pub mod batch;
pub mod command_pool;
pub mod context;
pub mod error;
pub mod operation;
pub mod resources;
pub mod semaphore_pool;

pub use batch::{BatchState, CommandBatch, Submission, SubmissionBatch};
pub use command_pool::{CommandBuffer, CommandBufferKey, CommandBufferLevel, CommandPool};
pub use context::{Context, PresentStatus, SharedContext, TrackedObjects};
pub use error::{ExecError, ExecResult};
pub use operation::{select_queue_families, OperationClass};
pub use resources::{
    find_memory_type, scale_pool_sizes, Buffer, BufferDesc, DescriptorArray, DescriptorLayoutSource, Image, ImageDesc,
    Memory,
};
pub use semaphore_pool::SemaphorePool;
