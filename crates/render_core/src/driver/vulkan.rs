//! `ash`-backed driver
//!
//! Owns the Vulkan instance, the optional presentation surface, the selected
//! physical device and a logical device with queue 0 of every family. The
//! execution core only ever reaches the device through [`Driver`].

use std::ffi::{c_char, CStr, CString};

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::prelude::VkResult;
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::{
    Driver, ImageTransition, PresentRequest, QueueCapabilities, QueueFamily, SwapchainImages, SwapchainRequest,
};
use crate::exec::{ExecError, ExecResult, ImageDesc, Submission};

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Undo steps for a partially built driver, run newest first on drop
#[derive(Default)]
struct Rollback<'a> {
    steps: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Rollback<'a> {
    fn push(&mut self, step: impl FnOnce() + 'a) {
        self.steps.push(Box::new(step));
    }

    /// Keep everything built so far
    fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

/// Instance-level settings for [`VulkanDriver::new`]
#[derive(Debug, Clone)]
pub struct VulkanDriverConfig {
    /// Application name reported to the driver
    pub application_name: String,
    /// Enable the Khronos validation layer (debug builds only)
    pub enable_validation: bool,
}

impl Default for VulkanDriverConfig {
    fn default() -> Self {
        Self {
            application_name: "render_core".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

/// Raw window handles a presentation surface is created from
///
/// Window creation itself is the windowing layer's job.
#[derive(Debug, Clone, Copy)]
pub struct WindowHandles {
    /// Display connection
    pub display: RawDisplayHandle,
    /// Native window
    pub window: RawWindowHandle,
}

/// Vulkan device wrapper with RAII cleanup
pub struct VulkanDriver {
    name: String,
    families: Vec<QueueFamily>,
    queues: Vec<vk::Queue>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    physical_device: vk::PhysicalDevice,
    device: Device,
    swapchain_loader: Option<SwapchainLoader>,
    surface: Option<vk::SurfaceKHR>,
    surface_loader: Surface,
    #[cfg(debug_assertions)]
    debug_messenger: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: Instance,
    _entry: Entry,
}

impl VulkanDriver {
    /// Load Vulkan, create the instance, optional surface and logical device
    ///
    /// With `window` set the selected device must be able to present to the
    /// surface, and the swapchain extension is enabled.
    pub fn new(config: &VulkanDriverConfig, window: Option<WindowHandles>) -> ExecResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| ExecError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| ExecError::InitializationFailed("application name contains a NUL byte".to_string()))?;
        let engine_name = CString::new("render_core")
            .map_err(|_| ExecError::InitializationFailed("engine name contains a NUL byte".to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions: Vec<*const c_char> = match window {
            Some(handles) => ash_window::enumerate_required_extensions(handles.display)?.to_vec(),
            None => Vec::new(),
        };

        let validation =
            cfg!(debug_assertions) && config.enable_validation && Self::has_layer(&entry, VALIDATION_LAYER);
        if config.enable_validation && cfg!(debug_assertions) && !validation {
            log::warn!("{VALIDATION_LAYER} requested but not installed, continuing without validation");
        }
        #[cfg(debug_assertions)]
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_name = CString::new(VALIDATION_LAYER)
            .map_err(|_| ExecError::InitializationFailed("invalid layer name".to_string()))?;
        let layers: Vec<*const c_char> = if validation { vec![layer_name.as_ptr()] } else { Vec::new() };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&create_info, None)? };
        // Declared ahead of `rollback` so they outlive the cleanup closures that borrow them
        #[cfg(debug_assertions)]
        let debug_messenger;
        let surface_loader;
        let mut rollback = Rollback::default();
        rollback.push(|| unsafe { instance.destroy_instance(None) });

        #[cfg(debug_assertions)]
        {
            debug_messenger = if validation {
                let debug_utils = DebugUtils::new(&entry, &instance);
                let messenger = Self::setup_debug_messenger(&debug_utils)?;
                Some((debug_utils, messenger))
            } else {
                None
            };
        }
        #[cfg(debug_assertions)]
        if let Some((debug_utils, messenger)) = &debug_messenger {
            rollback.push(move || unsafe { debug_utils.destroy_debug_utils_messenger(*messenger, None) });
        }

        surface_loader = Surface::new(&entry, &instance);
        let surface = match window {
            Some(handles) => Some(unsafe {
                ash_window::create_surface(&entry, &instance, handles.display, handles.window, None)?
            }),
            None => None,
        };
        if let Some(surface) = surface {
            let surface_loader = &surface_loader;
            rollback.push(move || unsafe { surface_loader.destroy_surface(surface, None) });
        }

        let selection = Self::select_physical_device(&instance, &surface_loader, surface)?;
        log::info!("Selected GPU: {}", selection.name);

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = selection
            .families
            .iter()
            .filter(|family| family.queue_count > 0)
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family.index)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let device_extensions: Vec<*const c_char> = if surface.is_some() {
            vec![SwapchainLoader::name().as_ptr()]
        } else {
            Vec::new()
        };
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions);
        let device = unsafe { instance.create_device(selection.physical_device, &device_info, None)? };
        rollback.disarm();

        let queues = selection
            .families
            .iter()
            .map(|family| {
                if family.queue_count > 0 {
                    unsafe { device.get_device_queue(family.index, 0) }
                } else {
                    vk::Queue::null()
                }
            })
            .collect();

        let swapchain_loader = surface.map(|_| SwapchainLoader::new(&instance, &device));
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(selection.physical_device) };

        log::debug!(
            "Vulkan device ready: {} queue families, {} memory types",
            selection.families.len(),
            memory_properties.memory_type_count
        );

        Ok(Self {
            name: selection.name,
            families: selection.families,
            queues,
            memory_properties,
            physical_device: selection.physical_device,
            device,
            swapchain_loader,
            surface,
            surface_loader,
            #[cfg(debug_assertions)]
            debug_messenger,
            instance,
            _entry: entry,
        })
    }

    /// Surface created from the window handles, if any
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    /// Raw logical device for recording commands with `ash`
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Selected physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    fn has_layer(entry: &Entry, name: &str) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers.iter().any(|layer| {
                    let layer_name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                    layer_name.to_str() == Ok(name)
                })
            })
            .unwrap_or(false)
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VkResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
    }

    fn select_physical_device(
        instance: &Instance,
        surface_loader: &Surface,
        surface: Option<vk::SurfaceKHR>,
    ) -> ExecResult<DeviceSelection> {
        let mut candidates = Vec::new();
        for physical_device in unsafe { instance.enumerate_physical_devices()? } {
            if let Some(selection) = Self::evaluate_device(instance, surface_loader, surface, physical_device)? {
                candidates.push(selection);
            }
        }

        // Discrete GPUs first, enumeration order otherwise.
        candidates.sort_by_key(|candidate| candidate.device_type != vk::PhysicalDeviceType::DISCRETE_GPU);
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| ExecError::InitializationFailed("No suitable GPU found".to_string()))
    }

    fn evaluate_device(
        instance: &Instance,
        surface_loader: &Surface,
        surface: Option<vk::SurfaceKHR>,
        physical_device: vk::PhysicalDevice,
    ) -> ExecResult<Option<DeviceSelection>> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let family_properties = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let mut families = Vec::with_capacity(family_properties.len());
        for (index, family) in family_properties.iter().enumerate() {
            let index = index as u32;
            let present = match surface {
                Some(surface) => unsafe {
                    surface_loader.get_physical_device_surface_support(physical_device, index, surface)?
                },
                None => false,
            };
            families.push(QueueFamily {
                index,
                capabilities: QueueCapabilities::from_vk(family.queue_flags, present),
                queue_count: family.queue_count,
            });
        }

        if !families.iter().any(|f| f.capabilities.contains(QueueCapabilities::GRAPHICS)) {
            log::debug!("Skipping {name}: no graphics queue family");
            return Ok(None);
        }

        if surface.is_some() {
            if !families.iter().any(|f| f.capabilities.contains(QueueCapabilities::PRESENT)) {
                log::debug!("Skipping {name}: cannot present to the surface");
                return Ok(None);
            }
            let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device)? };
            let has_swapchain = extensions.iter().any(|extension| {
                let extension_name = unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) };
                extension_name == SwapchainLoader::name()
            });
            if !has_swapchain {
                log::debug!("Skipping {name}: swapchain extension not supported");
                return Ok(None);
            }
        }

        Ok(Some(DeviceSelection {
            physical_device,
            device_type: properties.device_type,
            name,
            families,
        }))
    }

    fn swapchain_loader(&self) -> VkResult<&SwapchainLoader> {
        self.swapchain_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }
}

struct DeviceSelection {
    physical_device: vk::PhysicalDevice,
    device_type: vk::PhysicalDeviceType,
    name: String,
    families: Vec<QueueFamily>,
}

impl Driver for VulkanDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_families(&self) -> &[QueueFamily] {
        &self.families
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn queue(&self, family: u32) -> vk::Queue {
        self.queues.get(family as usize).copied().unwrap_or_else(vk::Queue::null)
    }

    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device.free_command_buffers(pool, buffers) }
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, usage: vk::CommandBufferUsageFlags) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(usage);
        unsafe { self.device.begin_command_buffer(buffer, &info) }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }
    }

    fn cmd_transition_images(&self, buffer: vk::CommandBuffer, transitions: &[ImageTransition]) {
        for transition in transitions {
            let barrier = vk::ImageMemoryBarrier::builder()
                .old_layout(transition.old_layout)
                .new_layout(transition.new_layout)
                .src_access_mask(transition.src_access)
                .dst_access_mask(transition.dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(transition.image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: transition.aspect_mask,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .build();

            unsafe {
                self.device.cmd_pipeline_barrier(
                    buffer,
                    transition.src_stage,
                    transition.dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(fences, wait_all, timeout) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        unsafe { self.device.create_image(&info, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&info, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes)
            .max_sets(max_sets);
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        unsafe { self.device.allocate_descriptor_sets(&info) }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device.create_image_view(&info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { self.device.create_framebuffer(&info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn queue_submit(&self, queue: vk::Queue, submissions: &[Submission], fence: vk::Fence) -> VkResult<()> {
        // Builders borrow the submission slices, which outlive the call.
        let infos: Vec<vk::SubmitInfo> = submissions
            .iter()
            .map(|submission| {
                vk::SubmitInfo::builder()
                    .wait_semaphores(submission.wait_semaphores())
                    .wait_dst_stage_mask(submission.wait_stages())
                    .command_buffers(submission.command_buffers())
                    .signal_semaphores(submission.signal_semaphores())
                    .build()
            })
            .collect();

        unsafe { self.device.queue_submit(queue, &infos, fence) }
    }

    fn queue_present(&self, queue: vk::Queue, request: &PresentRequest) -> VkResult<bool> {
        let swapchains = [request.swapchain];
        let image_indices = [request.image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&request.wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        unsafe { self.swapchain_loader()?.queue_present(queue, &info) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_swapchain(&self, request: &SwapchainRequest, old: vk::SwapchainKHR) -> VkResult<SwapchainImages> {
        let loader = self.swapchain_loader()?;
        let pd = self.physical_device;

        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(pd, request.surface)?
        };
        let formats = unsafe { self.surface_loader.get_physical_device_surface_formats(pd, request.surface)? };
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(pd, request.surface)?
        };

        let preferred = if request.prefer_srgb {
            vk::Format::B8G8R8A8_SRGB
        } else {
            vk::Format::B8G8R8A8_UNORM
        };
        let format = formats
            .iter()
            .find(|sf| sf.format == preferred && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .or_else(|| formats.first())
            .copied()
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;

        let present_mode = if request.prefer_mailbox && present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };

        let extent = if caps.current_extent.width == u32::MAX {
            vk::Extent2D {
                width: request
                    .extent
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: request
                    .extent
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        } else {
            caps.current_extent
        };

        let mut image_count = request.min_image_count.max(caps.min_image_count);
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(request.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(request.usage & caps.supported_usage_flags)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { loader.create_swapchain(&info, None)? };
        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(e);
            }
        };

        Ok(SwapchainImages {
            handle,
            images,
            format: format.format,
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = &self.swapchain_loader {
            unsafe { loader.destroy_swapchain(swapchain, None) }
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        unsafe { self.swapchain_loader()?.acquire_next_image(swapchain, timeout, semaphore, fence) }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                self.surface_loader.destroy_surface(surface, None);
            }

            #[cfg(debug_assertions)]
            if let Some((debug_utils, messenger)) = self.debug_messenger.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[test]
    fn test_rollback_undoes_newest_first() {
        let undone = RefCell::new(Vec::new());
        {
            let mut rollback = Rollback::default();
            rollback.push(|| undone.borrow_mut().push("instance"));
            rollback.push(|| undone.borrow_mut().push("messenger"));
            rollback.push(|| undone.borrow_mut().push("surface"));
        }
        assert_eq!(*undone.borrow(), vec!["surface", "messenger", "instance"]);
    }

    #[test]
    fn test_rollback_runs_on_early_return() {
        fn build(undone: &RefCell<Vec<&'static str>>, fail: bool) -> Result<(), &'static str> {
            let mut rollback = Rollback::default();
            rollback.push(|| undone.borrow_mut().push("instance"));
            if fail {
                return Err("no suitable device");
            }
            rollback.disarm();
            Ok(())
        }

        let undone = RefCell::new(Vec::new());
        assert!(build(&undone, false).is_ok());
        assert!(undone.borrow().is_empty());
        assert!(build(&undone, true).is_err());
        assert_eq!(*undone.borrow(), vec!["instance"]);
    }
}
