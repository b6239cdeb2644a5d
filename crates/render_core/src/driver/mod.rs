//! GPU driver boundary
//!
//! Everything the execution core needs from the device goes through the
//! [`Driver`] trait: queue family enumeration, queues, command pools and
//! buffers, synchronization objects, memory, images, buffers, submission and
//! presentation. Two implementations ship with the crate:
//!
//! - [`VulkanDriver`] talks to a real device through `ash`
//! - [`HeadlessDriver`] is a deterministic software device with observable
//!   execution order, used by tests and by hosts without a Vulkan loader
//!
//! Handles crossing the boundary are plain `ash::vk` handles, so recording
//! code elsewhere in the engine can keep using `ash` directly on a
//! [`VulkanDriver`] device.

use ash::prelude::VkResult;
use ash::vk;

use crate::exec::{ImageDesc, Submission};

pub mod headless;
pub mod vulkan;

pub use headless::{DeviceCommand, DriverStats, ExecutedCommand, HeadlessDriver, LiveObjects, SwapchainCreation};
pub use vulkan::{VulkanDriver, VulkanDriverConfig, WindowHandles};

bitflags::bitflags! {
    /// Operations a queue family can perform
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueCapabilities: u32 {
        /// Graphics pipelines and render passes
        const GRAPHICS = 1 << 0;
        /// Compute dispatches
        const COMPUTE = 1 << 1;
        /// Copies and clears
        const TRANSFER = 1 << 2;
        /// Presentation to the bound surface
        const PRESENT = 1 << 3;
    }
}

impl QueueCapabilities {
    /// Capabilities implied by Vulkan queue flags plus surface support
    ///
    /// Graphics and compute families always support transfer even when the
    /// driver does not advertise the bit.
    pub fn from_vk(flags: vk::QueueFlags, present: bool) -> Self {
        let mut caps = Self::empty();
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            caps |= Self::GRAPHICS | Self::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::COMPUTE) {
            caps |= Self::COMPUTE | Self::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::TRANSFER) {
            caps |= Self::TRANSFER;
        }
        if present {
            caps |= Self::PRESENT;
        }
        caps
    }
}

/// One queue family of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    /// Family index as the driver knows it
    pub index: u32,
    /// Supported operations
    pub capabilities: QueueCapabilities,
    /// Number of queues in the family
    pub queue_count: u32,
}

/// A single image layout transition recorded as a pipeline barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    /// Image to transition
    pub image: vk::Image,
    /// Aspect covered by the barrier
    pub aspect_mask: vk::ImageAspectFlags,
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Stages that must complete before the transition
    pub src_stage: vk::PipelineStageFlags,
    /// Stages that wait for the transition
    pub dst_stage: vk::PipelineStageFlags,
    /// Writes made available by the barrier
    pub src_access: vk::AccessFlags,
    /// Accesses the barrier makes the data visible to
    pub dst_access: vk::AccessFlags,
}

/// A presentation request for one acquired swap image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentRequest {
    /// Semaphores the presentation engine waits on
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Swap object owning the image
    pub swapchain: vk::SwapchainKHR,
    /// Index returned by the matching acquire
    pub image_index: u32,
}

/// Parameters for building or rebuilding a swap object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainRequest {
    /// Surface to present to
    pub surface: vk::SurfaceKHR,
    /// Extent used when the surface leaves the choice to the application
    pub extent: vk::Extent2D,
    /// Minimum number of swap images
    pub min_image_count: u32,
    /// Usage requested for the swap images
    pub usage: vk::ImageUsageFlags,
    /// Prefer mailbox over FIFO presentation
    pub prefer_mailbox: bool,
    /// Prefer an sRGB format
    pub prefer_srgb: bool,
}

/// A freshly built swap object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainImages {
    /// Swap object handle
    pub handle: vk::SwapchainKHR,
    /// Presentable images, owned by the swap object
    pub images: Vec<vk::Image>,
    /// Format of the images
    pub format: vk::Format,
    /// Extent of the images
    pub extent: vk::Extent2D,
}

/// The device as seen by the execution core
///
/// Methods mirror the Vulkan entry points they stand for and return the raw
/// `vk::Result` on failure; classification into the engine's error taxonomy
/// happens one layer up. Destruction calls never fail.
pub trait Driver: Send + Sync {
    /// Human readable device name for logs
    fn name(&self) -> &str;

    /// Queue families, indexed by family index
    fn queue_families(&self) -> &[QueueFamily];

    /// Memory types and heaps of the device
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;

    /// Queue 0 of the given family
    fn queue(&self, family: u32) -> vk::Queue;

    /// Create a resettable command pool for a family
    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool>;

    /// Destroy a command pool and every buffer allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocate command buffers at the given level
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;

    /// Return command buffers to their pool
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    /// Begin recording (implicitly resets the buffer)
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, usage: vk::CommandBufferUsageFlags) -> VkResult<()>;

    /// Finish recording
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Record image layout transitions
    fn cmd_transition_images(&self, buffer: vk::CommandBuffer, transitions: &[ImageTransition]);

    /// Create a binary semaphore
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;

    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Create a fence
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);

    /// Block until all (or any) of the fences are signaled
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: u64) -> VkResult<()>;

    /// Return fences to the unsignaled state
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    /// Non-blocking signaled query
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    /// Allocate device memory from a memory type
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory>;

    /// Free device memory
    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Create an unbound 2D image
    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image>;

    /// Memory requirements of an image
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    /// Bind memory to an image
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()>;

    /// Destroy an image
    fn destroy_image(&self, image: vk::Image);

    /// Create an unbound buffer
    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer>;

    /// Memory requirements of a buffer
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    /// Bind memory to a buffer
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()>;

    /// Destroy a buffer
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Create a descriptor pool
    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> VkResult<vk::DescriptorPool>;

    /// Destroy a descriptor pool, freeing every set allocated from it
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one set per layout from `pool`
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>>;

    /// Create a 2D view over the whole image
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView>;

    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);

    /// Create a single-layer framebuffer
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;

    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Submit work to a queue; `fence` may be null
    fn queue_submit(&self, queue: vk::Queue, submissions: &[Submission], fence: vk::Fence) -> VkResult<()>;

    /// Queue a presentation; `Ok(true)` means suboptimal
    fn queue_present(&self, queue: vk::Queue, request: &PresentRequest) -> VkResult<bool>;

    /// Block until every queue is idle
    fn device_wait_idle(&self) -> VkResult<()>;

    /// Build a swap object, handing over `old` (may be null) for retirement
    fn create_swapchain(&self, request: &SwapchainRequest, old: vk::SwapchainKHR) -> VkResult<SwapchainImages>;

    /// Destroy a swap object
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Acquire the next presentable image; `Ok((index, true))` means suboptimal
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graphics_family_implies_transfer() {
        let caps = QueueCapabilities::from_vk(vk::QueueFlags::GRAPHICS, false);
        assert!(caps.contains(QueueCapabilities::GRAPHICS | QueueCapabilities::TRANSFER));
        assert!(!caps.contains(QueueCapabilities::PRESENT));
    }

    #[test]
    fn test_present_support_is_a_capability() {
        let caps = QueueCapabilities::from_vk(vk::QueueFlags::TRANSFER, true);
        assert_eq!(caps, QueueCapabilities::TRANSFER | QueueCapabilities::PRESENT);
    }
}
