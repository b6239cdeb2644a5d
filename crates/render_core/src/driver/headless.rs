//! Deterministic software driver
//!
//! Models what the execution core can observe of a GPU without owning one:
//!
//! - every queue executes its work in submission order, and a piece of work
//!   starts only once all the semaphores it waits on are signaled (binary
//!   semaphores are consumed by the wait)
//! - fences are signaled when the work they were submitted with completes
//! - command buffers replay what was recorded into them into an execution
//!   log, so ordering across queues can be asserted without timing
//! - a single surface whose swap objects can be forced out of date or
//!   suboptimal
//!
//! Work normally runs as soon as it is submitted. [`HeadlessDriver::hold_queue`]
//! parks a queue to simulate a slow GPU; fence and idle waits drain held queues
//! the way a real device eventually finishes its work.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use super::{
    Driver, ImageTransition, PresentRequest, QueueCapabilities, QueueFamily, SwapchainImages, SwapchainRequest,
};
use crate::exec::{ImageDesc, Submission};

const QUEUE_HANDLE_BASE: u64 = 0x1_0000;
const REQUIREMENT_ALIGNMENT: vk::DeviceSize = 256;

/// A command as it executed on a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Image layout transition recorded into a command buffer
    Transition(ImageTransition),
    /// Free-form label recorded with [`HeadlessDriver::record_marker`]
    Marker(String),
    /// A swap image handed to the presentation engine
    Present {
        /// Swap object
        swapchain: vk::SwapchainKHR,
        /// Presented image
        image_index: u32,
    },
}

/// Entry of the execution log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    /// Family of the queue the command ran on
    pub family: u32,
    /// What ran
    pub command: DeviceCommand,
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// `queue_submit` calls
    pub submit_calls: usize,
    /// Individual submissions across all submit calls
    pub submissions: usize,
    /// `wait_for_fences` calls
    pub fence_waits: usize,
    /// `reset_fences` calls
    pub fence_resets: usize,
    /// `queue_present` calls
    pub presents: usize,
    /// `acquire_next_image` calls
    pub acquires: usize,
    /// `device_wait_idle` calls
    pub idle_waits: usize,
}

/// Record of one swap object construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreation {
    /// New swap object
    pub handle: vk::SwapchainKHR,
    /// Retiring swap object handed to the construction
    pub old: vk::SwapchainKHR,
    /// Extent of the new images
    pub extent: vk::Extent2D,
    /// Number of images
    pub image_count: u32,
}

/// Number of live objects of each kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    /// Command pools
    pub command_pools: usize,
    /// Command buffers
    pub command_buffers: usize,
    /// Semaphores
    pub semaphores: usize,
    /// Fences
    pub fences: usize,
    /// Memory allocations
    pub memory: usize,
    /// Images not owned by a swap object
    pub images: usize,
    /// Buffers
    pub buffers: usize,
    /// Descriptor pools
    pub descriptor_pools: usize,
    /// Descriptor sets still owned by a live pool
    pub descriptor_sets: usize,
    /// Image views
    pub image_views: usize,
    /// Framebuffers
    pub framebuffers: usize,
    /// Swap objects
    pub swapchains: usize,
}

impl LiveObjects {
    /// True when nothing is alive
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

enum WorkKind {
    Execute(Vec<vk::CommandBuffer>),
    Present { swapchain: vk::SwapchainKHR, image_index: u32 },
}

struct Work {
    wait: Vec<vk::Semaphore>,
    kind: WorkKind,
    signal: Vec<vk::Semaphore>,
    fence: vk::Fence,
}

#[derive(Default)]
struct QueueState {
    held: bool,
    pending: VecDeque<Work>,
}

#[derive(Default)]
struct RecordedBuffer {
    pool: vk::CommandPool,
    commands: Vec<DeviceCommand>,
}

struct SwapState {
    images: Vec<vk::Image>,
    next_image: u32,
    generation: u64,
    retired: bool,
}

struct DescriptorPoolState {
    max_sets: u32,
    sets: Vec<vk::DescriptorSet>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    queues: BTreeMap<u32, QueueState>,
    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, RecordedBuffer>,
    semaphores: HashMap<vk::Semaphore, bool>,
    fences: HashMap<vk::Fence, bool>,
    memory: HashSet<vk::DeviceMemory>,
    images: HashMap<vk::Image, vk::DeviceSize>,
    buffers: HashMap<vk::Buffer, vk::DeviceSize>,
    descriptor_pools: HashMap<vk::DescriptorPool, DescriptorPoolState>,
    image_views: HashMap<vk::ImageView, vk::Image>,
    framebuffers: HashMap<vk::Framebuffer, Vec<vk::ImageView>>,
    swapchains: HashMap<vk::SwapchainKHR, SwapState>,
    surfaces: HashSet<vk::SurfaceKHR>,
    surface_extent: vk::Extent2D,
    surface_generation: u64,
    forced_out_of_date: u32,
    forced_suboptimal: u32,
    failing_presents: u32,
    executed: Vec<ExecutedCommand>,
    creations: Vec<SwapchainCreation>,
    stats: DriverStats,
}

impl State {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn enqueue(&mut self, family: u32, work: Work) {
        self.queues.entry(family).or_default().pending.push_back(work);
    }

    /// Run queued work until nothing can make progress
    fn pump(&mut self, ignore_holds: bool) {
        loop {
            let families: Vec<u32> = self.queues.keys().copied().collect();
            let mut progressed = false;
            for family in families {
                while self.step(family, ignore_holds) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn step(&mut self, family: u32, ignore_holds: bool) -> bool {
        let Some(queue) = self.queues.get(&family) else {
            return false;
        };
        if queue.held && !ignore_holds {
            return false;
        }
        let Some(front) = queue.pending.front() else {
            return false;
        };
        if !front
            .wait
            .iter()
            .all(|semaphore| self.semaphores.get(semaphore).copied().unwrap_or(false))
        {
            return false;
        }

        let Some(work) = self.queues.get_mut(&family).and_then(|queue| queue.pending.pop_front()) else {
            return false;
        };

        for semaphore in &work.wait {
            self.semaphores.insert(*semaphore, false);
        }

        match work.kind {
            WorkKind::Execute(buffers) => {
                for buffer in buffers {
                    let commands = self
                        .command_buffers
                        .get(&buffer)
                        .map(|recorded| recorded.commands.clone())
                        .unwrap_or_default();
                    self.executed
                        .extend(commands.into_iter().map(|command| ExecutedCommand { family, command }));
                }
            }
            WorkKind::Present { swapchain, image_index } => {
                self.executed.push(ExecutedCommand {
                    family,
                    command: DeviceCommand::Present { swapchain, image_index },
                });
            }
        }

        for semaphore in &work.signal {
            if let Some(signaled) = self.semaphores.get_mut(semaphore) {
                *signaled = true;
            }
        }
        if let Some(signaled) = self.fences.get_mut(&work.fence) {
            *signaled = true;
        }
        true
    }

    fn swapchain_is_stale(&self, swapchain: vk::SwapchainKHR) -> bool {
        self.swapchains
            .get(&swapchain)
            .map_or(true, |swap| swap.retired || swap.generation != self.surface_generation)
    }
}

/// Software device with observable execution order
pub struct HeadlessDriver {
    families: Vec<QueueFamily>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    state: Mutex<State>,
}

impl Default for HeadlessDriver {
    fn default() -> Self {
        Self::typical()
    }
}

impl HeadlessDriver {
    /// Device with the given queue families and a typical memory layout
    pub fn new(families: Vec<QueueFamily>) -> Self {
        let mut state = State {
            surface_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..State::default()
        };
        for family in &families {
            state.queues.insert(family.index, QueueState::default());
        }

        Self {
            families,
            memory_properties: memory_properties(&[
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            ]),
            state: Mutex::new(state),
        }
    }

    /// Discrete-GPU-like layout
    ///
    /// Family 0 does everything including presentation, family 1 is an async
    /// compute family and family 2 a dedicated transfer family.
    pub fn typical() -> Self {
        use QueueCapabilities as C;
        Self::new(vec![
            QueueFamily {
                index: 0,
                capabilities: C::GRAPHICS | C::COMPUTE | C::TRANSFER | C::PRESENT,
                queue_count: 1,
            },
            QueueFamily {
                index: 1,
                capabilities: C::COMPUTE | C::TRANSFER,
                queue_count: 1,
            },
            QueueFamily {
                index: 2,
                capabilities: C::TRANSFER,
                queue_count: 1,
            },
        ])
    }

    /// Replace the memory type table
    pub fn with_memory_types(mut self, types: &[vk::MemoryPropertyFlags]) -> Self {
        self.memory_properties = memory_properties(types);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn family_of(&self, queue: vk::Queue) -> VkResult<u32> {
        let family = queue
            .as_raw()
            .checked_sub(QUEUE_HANDLE_BASE)
            .and_then(|raw| u32::try_from(raw).ok())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if self.families.iter().any(|f| f.index == family) {
            Ok(family)
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    /// Append a labelled marker to a command buffer
    pub fn record_marker(&self, buffer: vk::CommandBuffer, label: impl Into<String>) {
        if let Some(recorded) = self.state().command_buffers.get_mut(&buffer) {
            recorded.commands.push(DeviceCommand::Marker(label.into()));
        }
    }

    /// Stop a queue from executing until released or drained by a wait
    pub fn hold_queue(&self, family: u32) {
        self.state().queues.entry(family).or_default().held = true;
    }

    /// Let a held queue run again
    pub fn release_queue(&self, family: u32) {
        let mut state = self.state();
        state.queues.entry(family).or_default().held = false;
        state.pump(false);
    }

    /// Execute everything that can run, held queues included
    pub fn flush(&self) {
        self.state().pump(true);
    }

    /// Work still queued on a family
    pub fn pending(&self, family: u32) -> usize {
        self.state().queues.get(&family).map_or(0, |queue| queue.pending.len())
    }

    /// Execution log
    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.state().executed.clone()
    }

    /// Executed marker labels in order
    pub fn markers(&self) -> Vec<String> {
        self.state()
            .executed
            .iter()
            .filter_map(|entry| match &entry.command {
                DeviceCommand::Marker(label) => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    /// Call counters
    pub fn stats(&self) -> DriverStats {
        self.state().stats
    }

    /// Whether a semaphore is currently signaled
    pub fn is_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state().semaphores.get(&semaphore).copied().unwrap_or(false)
    }

    /// Whether a fence is currently signaled
    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence).copied().unwrap_or(false)
    }

    /// Create the presentation surface
    pub fn create_surface(&self) -> vk::SurfaceKHR {
        let mut state = self.state();
        let surface = vk::SurfaceKHR::from_raw(state.mint());
        state.surfaces.insert(surface);
        surface
    }

    /// Destroy a surface created with [`create_surface`](Self::create_surface)
    pub fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.state().surfaces.remove(&surface);
    }

    /// Resize the surface, making existing swap objects out of date
    pub fn resize_surface(&self, extent: vk::Extent2D) {
        let mut state = self.state();
        state.surface_extent = extent;
        state.surface_generation += 1;
    }

    /// Fail the next `count` acquires with `ERROR_OUT_OF_DATE_KHR`
    pub fn invalidate_surface(&self, count: u32) {
        self.state().forced_out_of_date = count;
    }

    /// Report the next `count` successful acquires as suboptimal
    pub fn force_suboptimal(&self, count: u32) {
        self.state().forced_suboptimal = count;
    }

    /// Fail the next `count` presents with `ERROR_OUT_OF_DATE_KHR`
    pub fn fail_next_presents(&self, count: u32) {
        self.state().failing_presents = count;
    }

    /// Every swap object constructed so far
    pub fn swapchain_creations(&self) -> Vec<SwapchainCreation> {
        self.state().creations.clone()
    }

    /// Objects not yet destroyed
    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state();
        LiveObjects {
            command_pools: state.command_pools.len(),
            command_buffers: state.command_buffers.len(),
            semaphores: state.semaphores.len(),
            fences: state.fences.len(),
            memory: state.memory.len(),
            images: state.images.len(),
            buffers: state.buffers.len(),
            descriptor_pools: state.descriptor_pools.len(),
            descriptor_sets: state.descriptor_pools.values().map(|pool| pool.sets.len()).sum(),
            image_views: state.image_views.len(),
            framebuffers: state.framebuffers.len(),
            swapchains: state.swapchains.len(),
        }
    }
}

fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
    let mut properties = vk::PhysicalDeviceMemoryProperties {
        memory_heap_count: 2,
        ..Default::default()
    };
    properties.memory_heaps[0] = vk::MemoryHeap {
        size: 8 << 30,
        flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
    };
    properties.memory_heaps[1] = vk::MemoryHeap {
        size: 16 << 30,
        flags: vk::MemoryHeapFlags::empty(),
    };

    let count = types.len().min(vk::MAX_MEMORY_TYPES);
    for (slot, flags) in properties.memory_types.iter_mut().zip(&types[..count]) {
        *slot = vk::MemoryType {
            property_flags: *flags,
            heap_index: u32::from(!flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)),
        };
    }
    properties.memory_type_count = count as u32;
    properties
}

impl Driver for HeadlessDriver {
    fn name(&self) -> &str {
        "Headless"
    }

    fn queue_families(&self) -> &[QueueFamily] {
        &self.families
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn queue(&self, family: u32) -> vk::Queue {
        vk::Queue::from_raw(QUEUE_HANDLE_BASE + u64::from(family))
    }

    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool> {
        if !self.families.iter().any(|f| f.index == family) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let mut state = self.state();
        let pool = vk::CommandPool::from_raw(state.mint());
        state.command_pools.insert(pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        state.command_pools.remove(&pool);
        state.command_buffers.retain(|_, recorded| recorded.pool != pool);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state();
        if !state.command_pools.contains(&pool) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok((0..count)
            .map(|_| {
                let buffer = vk::CommandBuffer::from_raw(state.mint());
                state.command_buffers.insert(
                    buffer,
                    RecordedBuffer {
                        pool,
                        commands: Vec::new(),
                    },
                );
                buffer
            })
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state();
        for buffer in buffers {
            state.command_buffers.remove(buffer);
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, _usage: vk::CommandBufferUsageFlags) -> VkResult<()> {
        let mut state = self.state();
        let recorded = state.command_buffers.get_mut(&buffer).ok_or(vk::Result::ERROR_UNKNOWN)?;
        recorded.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        if self.state().command_buffers.contains_key(&buffer) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn cmd_transition_images(&self, buffer: vk::CommandBuffer, transitions: &[ImageTransition]) {
        if let Some(recorded) = self.state().command_buffers.get_mut(&buffer) {
            recorded
                .commands
                .extend(transitions.iter().copied().map(DeviceCommand::Transition));
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state();
        let semaphore = vk::Semaphore::from_raw(state.mint());
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state().semaphores.remove(&semaphore);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state();
        let fence = vk::Fence::from_raw(state.mint());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state().fences.remove(&fence);
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, _timeout: u64) -> VkResult<()> {
        let mut state = self.state();
        state.stats.fence_waits += 1;
        state.pump(true);

        let signaled = |fence: &vk::Fence| state.fences.get(fence).copied().unwrap_or(false);
        let done = if wait_all {
            fences.iter().all(signaled)
        } else {
            fences.iter().any(signaled)
        };
        if done {
            Ok(())
        } else {
            Err(vk::Result::TIMEOUT)
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.state();
        state.stats.fence_resets += 1;
        for fence in fences {
            if let Some(signaled) = state.fences.get_mut(fence) {
                *signaled = false;
            }
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state().fences.get(&fence).copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn allocate_memory(&self, _size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        if memory_type_index >= self.memory_properties.memory_type_count {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let mut state = self.state();
        let memory = vk::DeviceMemory::from_raw(state.mint());
        state.memory.insert(memory);
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state().memory.remove(&memory);
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        let mut state = self.state();
        let image = vk::Image::from_raw(state.mint());
        let size = u64::from(desc.extent.width) * u64::from(desc.extent.height) * 4;
        state.images.insert(image, size);
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.state().images.get(&image).copied().unwrap_or(0),
            alignment: REQUIREMENT_ALIGNMENT,
            memory_type_bits: (1 << self.memory_properties.memory_type_count) - 1,
        }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, _offset: vk::DeviceSize) -> VkResult<()> {
        let state = self.state();
        if state.images.contains_key(&image) && state.memory.contains(&memory) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state().images.remove(&image);
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> VkResult<vk::Buffer> {
        let mut state = self.state();
        let buffer = vk::Buffer::from_raw(state.mint());
        state.buffers.insert(buffer, size);
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: self.state().buffers.get(&buffer).copied().unwrap_or(0),
            alignment: REQUIREMENT_ALIGNMENT,
            memory_type_bits: (1 << self.memory_properties.memory_type_count) - 1,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let state = self.state();
        if state.buffers.contains_key(&buffer) && state.memory.contains(&memory) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state().buffers.remove(&buffer);
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> VkResult<vk::DescriptorPool> {
        if sizes.is_empty() || max_sets == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let mut state = self.state();
        let pool = vk::DescriptorPool::from_raw(state.mint());
        state.descriptor_pools.insert(
            pool,
            DescriptorPoolState {
                max_sets,
                sets: Vec::new(),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state().descriptor_pools.remove(&pool);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state();
        let entry = state.descriptor_pools.get(&pool).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if entry.sets.len() + layouts.len() > entry.max_sets as usize {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }

        let sets: Vec<vk::DescriptorSet> = layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(state.mint()))
            .collect();
        if let Some(entry) = state.descriptor_pools.get_mut(&pool) {
            entry.sets.extend_from_slice(&sets);
        }
        Ok(sets)
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let mut state = self.state();
        let swap_image = state.swapchains.values().any(|swap| swap.images.contains(&image));
        if aspect.is_empty() || !(state.images.contains_key(&image) || swap_image) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let view = vk::ImageView::from_raw(state.mint());
        state.image_views.insert(view, image);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().image_views.remove(&view);
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let mut state = self.state();
        let views_known = attachments.iter().all(|view| state.image_views.contains_key(view));
        if render_pass == vk::RenderPass::null() || !views_known || extent.width == 0 || extent.height == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let framebuffer = vk::Framebuffer::from_raw(state.mint());
        state.framebuffers.insert(framebuffer, attachments.to_vec());
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state().framebuffers.remove(&framebuffer);
    }

    fn queue_submit(&self, queue: vk::Queue, submissions: &[Submission], fence: vk::Fence) -> VkResult<()> {
        let family = self.family_of(queue)?;
        let mut state = self.state();
        if fence != vk::Fence::null() && state.fences.get(&fence) == Some(&true) {
            log::error!("Fence {fence:?} submitted while still signaled");
        }

        state.stats.submit_calls += 1;
        state.stats.submissions += submissions.len();

        let last = submissions.len().saturating_sub(1);
        for (i, submission) in submissions.iter().enumerate() {
            state.enqueue(
                family,
                Work {
                    wait: submission.wait_semaphores().to_vec(),
                    kind: WorkKind::Execute(submission.command_buffers().to_vec()),
                    signal: submission.signal_semaphores().to_vec(),
                    fence: if i == last { fence } else { vk::Fence::null() },
                },
            );
        }
        if submissions.is_empty() && fence != vk::Fence::null() {
            state.enqueue(
                family,
                Work {
                    wait: Vec::new(),
                    kind: WorkKind::Execute(Vec::new()),
                    signal: Vec::new(),
                    fence,
                },
            );
        }

        state.pump(false);
        Ok(())
    }

    fn queue_present(&self, queue: vk::Queue, request: &PresentRequest) -> VkResult<bool> {
        let family = self.family_of(queue)?;
        let mut state = self.state();
        state.stats.presents += 1;

        state.enqueue(
            family,
            Work {
                wait: request.wait_semaphores.clone(),
                kind: WorkKind::Present {
                    swapchain: request.swapchain,
                    image_index: request.image_index,
                },
                signal: Vec::new(),
                fence: vk::Fence::null(),
            },
        );
        state.pump(false);

        if state.failing_presents > 0 {
            state.failing_presents -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if state.swapchain_is_stale(request.swapchain) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        Ok(false)
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state();
        state.stats.idle_waits += 1;
        state.pump(true);
        Ok(())
    }

    fn create_swapchain(&self, request: &SwapchainRequest, old: vk::SwapchainKHR) -> VkResult<SwapchainImages> {
        let mut state = self.state();
        if !state.surfaces.contains(&request.surface) {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        if let Some(retiring) = state.swapchains.get_mut(&old) {
            retiring.retired = true;
        }

        let handle = vk::SwapchainKHR::from_raw(state.mint());
        let image_count = request.min_image_count.max(2);
        let images: Vec<vk::Image> = (0..image_count).map(|_| vk::Image::from_raw(state.mint())).collect();
        let extent = state.surface_extent;
        let generation = state.surface_generation;

        state.swapchains.insert(
            handle,
            SwapState {
                images: images.clone(),
                next_image: 0,
                generation,
                retired: false,
            },
        );
        state.creations.push(SwapchainCreation {
            handle,
            old,
            extent,
            image_count,
        });

        Ok(SwapchainImages {
            handle,
            images,
            format: if request.prefer_srgb {
                vk::Format::B8G8R8A8_SRGB
            } else {
                vk::Format::B8G8R8A8_UNORM
            },
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state().swapchains.remove(&swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state();
        state.stats.acquires += 1;

        if state.forced_out_of_date > 0 {
            state.forced_out_of_date -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if state.swapchain_is_stale(swapchain) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        let swap = state.swapchains.get_mut(&swapchain).ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?;
        let index = swap.next_image;
        swap.next_image = (swap.next_image + 1) % swap.images.len() as u32;

        if let Some(signaled) = state.semaphores.get_mut(&semaphore) {
            *signaled = true;
        }
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = true;
        }

        let suboptimal = state.forced_suboptimal > 0;
        if suboptimal {
            state.forced_suboptimal -= 1;
        }
        Ok((index, suboptimal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandBatch;

    fn recorded_buffer(driver: &HeadlessDriver, family: u32, label: &str) -> vk::CommandBuffer {
        let pool = driver.create_command_pool(family).unwrap();
        let buffer = driver
            .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)
            .unwrap()[0];
        driver
            .begin_command_buffer(buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        driver.record_marker(buffer, label);
        driver.end_command_buffer(buffer).unwrap();
        buffer
    }

    #[test]
    fn test_work_waits_for_semaphore() {
        let driver = HeadlessDriver::typical();
        let semaphore = driver.create_semaphore().unwrap();
        let producer = recorded_buffer(&driver, 2, "upload");
        let consumer = recorded_buffer(&driver, 0, "draw");

        driver.hold_queue(2);

        let mut produce = CommandBatch::new();
        produce.add(producer).unwrap().signal(semaphore).unwrap();
        let mut consume = CommandBatch::new();
        consume
            .add(consumer)
            .unwrap()
            .wait(semaphore, vk::PipelineStageFlags::VERTEX_INPUT)
            .unwrap();

        driver
            .queue_submit(driver.queue(2), &[produce.build().unwrap()], vk::Fence::null())
            .unwrap();
        driver
            .queue_submit(driver.queue(0), &[consume.build().unwrap()], vk::Fence::null())
            .unwrap();
        assert!(driver.markers().is_empty());
        assert_eq!(driver.pending(0), 1);

        driver.release_queue(2);
        assert_eq!(driver.markers(), vec!["upload".to_string(), "draw".to_string()]);
        assert!(!driver.is_signaled(semaphore));
    }

    #[test]
    fn test_fence_signaled_by_last_submission() {
        let driver = HeadlessDriver::typical();
        let fence = driver.create_fence(false).unwrap();
        driver.hold_queue(0);
        driver
            .queue_submit(driver.queue(0), &[Submission::default(), Submission::default()], fence)
            .unwrap();
        assert!(!driver.is_fence_signaled(fence));

        driver.wait_for_fences(&[fence], true, u64::MAX).unwrap();
        assert!(driver.is_fence_signaled(fence));
        assert_eq!(driver.stats().submissions, 2);
    }

    #[test]
    fn test_unsubmitted_fence_times_out() {
        let driver = HeadlessDriver::typical();
        let fence = driver.create_fence(false).unwrap();
        assert_eq!(driver.wait_for_fences(&[fence], true, 0), Err(vk::Result::TIMEOUT));
    }

    #[test]
    fn test_resize_makes_swapchain_out_of_date() {
        let driver = HeadlessDriver::typical();
        let surface = driver.create_surface();
        let request = SwapchainRequest {
            surface,
            extent: vk::Extent2D { width: 64, height: 64 },
            min_image_count: 3,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            prefer_mailbox: true,
            prefer_srgb: true,
        };
        let swap = driver.create_swapchain(&request, vk::SwapchainKHR::null()).unwrap();
        assert_eq!(swap.images.len(), 3);
        assert_eq!(
            driver.acquire_next_image(swap.handle, u64::MAX, vk::Semaphore::null(), vk::Fence::null()),
            Ok((0, false))
        );

        driver.resize_surface(vk::Extent2D { width: 32, height: 32 });
        assert_eq!(
            driver.acquire_next_image(swap.handle, u64::MAX, vk::Semaphore::null(), vk::Fence::null()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );

        let rebuilt = driver.create_swapchain(&request, swap.handle).unwrap();
        driver.destroy_swapchain(swap.handle);
        assert_eq!(rebuilt.extent, vk::Extent2D { width: 32, height: 32 });
        assert_eq!(driver.swapchain_creations()[1].old, swap.handle);
        assert_eq!(driver.live_objects().swapchains, 1);
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let driver = HeadlessDriver::typical();
        let sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 4,
        }];
        let pool = driver.create_descriptor_pool(&sizes, 2).unwrap();
        let layouts = [vk::DescriptorSetLayout::from_raw(900); 2];

        let sets = driver.allocate_descriptor_sets(pool, &layouts).unwrap();
        assert_eq!(sets.len(), 2);
        assert_ne!(sets[0], sets[1]);
        assert_eq!(
            driver.allocate_descriptor_sets(pool, &layouts[..1]),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        );
        assert_eq!(driver.live_objects().descriptor_sets, 2);

        driver.destroy_descriptor_pool(pool);
        assert_eq!(driver.live_objects().descriptor_sets, 0);
    }
}
