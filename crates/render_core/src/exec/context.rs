//! Device context: queues, command pools, synchronization objects and resources
//!
//! A [`Context`] maps each registered [`OperationClass`] onto one queue and
//! keeps, per class, a primary and a secondary command pool plus an execution
//! fence for the engine's backpressure protocol. Every semaphore, fence,
//! allocation, image, buffer, framebuffer and descriptor pool created through it is tracked
//! so teardown can reclaim whatever the caller forgot to release.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use ash::vk;

use super::{
    find_memory_type, scale_pool_sizes, select_queue_families, Buffer, BufferDesc, CommandBuffer, CommandBufferLevel,
    CommandPool, DescriptorArray, DescriptorLayoutSource, ExecError, ExecResult, Image, ImageDesc, Memory,
    OperationClass, SubmissionBatch,
};
use crate::core::config::ContextConfig;
use crate::driver::{Driver, ImageTransition, PresentRequest};
use crate::frame::ImageSet;

/// Context shared between threads behind one coarse lock
pub type SharedContext = Arc<Mutex<Context>>;

/// Outcome of a presentation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    /// Image queued for display
    Presented,
    /// Image queued, but the swap object no longer matches the surface exactly
    Suboptimal,
    /// Image not presented, the swap object must be rebuilt
    OutOfDate,
}

impl PresentStatus {
    /// True if the swap object should be rebuilt
    pub fn needs_rebuild(self) -> bool {
        self != Self::Presented
    }
}

/// Number of objects currently tracked by a context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackedObjects {
    /// Command buffers across all pools
    pub command_buffers: usize,
    /// Semaphores
    pub semaphores: usize,
    /// Fences, execution fences excluded
    pub fences: usize,
    /// Memory allocations, including those backing images and buffers
    pub memory: usize,
    /// Images
    pub images: usize,
    /// Buffers
    pub buffers: usize,
    /// Descriptor pools, including those backing descriptor arrays
    pub descriptor_pools: usize,
    /// Framebuffers
    pub framebuffers: usize,
}

struct OperationSlot {
    family: u32,
    queue: vk::Queue,
    primary: CommandPool,
    secondary: CommandPool,
    execution_fence: vk::Fence,
    in_flight: bool,
}

impl OperationSlot {
    fn pool_mut(&mut self, level: CommandBufferLevel) -> &mut CommandPool {
        match level {
            CommandBufferLevel::Primary => &mut self.primary,
            CommandBufferLevel::Secondary => &mut self.secondary,
        }
    }

    fn pool(&self, level: CommandBufferLevel) -> &CommandPool {
        match level {
            CommandBufferLevel::Primary => &self.primary,
            CommandBufferLevel::Secondary => &self.secondary,
        }
    }
}

/// Execution engine over one device
pub struct Context {
    driver: Arc<dyn Driver>,
    slots: BTreeMap<OperationClass, OperationSlot>,
    semaphores: HashSet<vk::Semaphore>,
    fences: HashSet<vk::Fence>,
    memory: HashMap<vk::DeviceMemory, Memory>,
    images: HashMap<vk::Image, Arc<Image>>,
    buffers: HashMap<vk::Buffer, Arc<Buffer>>,
    descriptor_pools: HashSet<vk::DescriptorPool>,
    framebuffers: HashMap<vk::Framebuffer, Vec<vk::ImageView>>,
}

impl Context {
    /// Create a context registering the configured operation classes
    pub fn new(driver: Arc<dyn Driver>, config: &ContextConfig) -> ExecResult<Self> {
        config.validate()?;
        let families = select_queue_families(driver.queue_families(), &config.operation_classes)?;

        let mut context = Self {
            driver,
            slots: BTreeMap::new(),
            semaphores: HashSet::new(),
            fences: HashSet::new(),
            memory: HashMap::new(),
            images: HashMap::new(),
            buffers: HashMap::new(),
            descriptor_pools: HashSet::new(),
            framebuffers: HashMap::new(),
        };

        for (class, family) in families {
            let primary = CommandPool::new(Arc::clone(&context.driver), family, CommandBufferLevel::Primary)?;
            let secondary = CommandPool::new(Arc::clone(&context.driver), family, CommandBufferLevel::Secondary)?;
            let execution_fence = context.driver.create_fence(false)?;
            context.slots.insert(
                class,
                OperationSlot {
                    family,
                    queue: context.driver.queue(family),
                    primary,
                    secondary,
                    execution_fence,
                    in_flight: false,
                },
            );
        }

        log::debug!(
            "Context created on {} with {} operation classes",
            context.driver.name(),
            context.slots.len()
        );
        Ok(context)
    }

    /// Wrap the context for sharing between threads
    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    /// Driver the context was built on
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    fn slot(&self, op: OperationClass) -> ExecResult<&OperationSlot> {
        self.slots.get(&op).ok_or(ExecError::InvalidOperationClass(op))
    }

    /// Registered operation classes in ascending order
    pub fn operation_classes(&self) -> impl Iterator<Item = OperationClass> + '_ {
        self.slots.keys().copied()
    }

    /// Queue serving an operation class
    pub fn queue(&self, op: OperationClass) -> ExecResult<vk::Queue> {
        Ok(self.slot(op)?.queue)
    }

    /// Queue family serving an operation class
    pub fn queue_family(&self, op: OperationClass) -> ExecResult<u32> {
        Ok(self.slot(op)?.family)
    }

    /// True between `engine_execute` and the matching `engine_wait`
    pub fn is_in_flight(&self, op: OperationClass) -> bool {
        self.slots.get(&op).is_some_and(|slot| slot.in_flight)
    }

    // ---- command buffers ----

    /// Allocate command buffers from the pool of `op` at `level`
    pub fn allocate_command_buffer(
        &mut self,
        op: OperationClass,
        count: u32,
        level: CommandBufferLevel,
    ) -> ExecResult<Vec<CommandBuffer>> {
        let slot = self.slots.get_mut(&op).ok_or(ExecError::InvalidOperationClass(op))?;
        slot.pool_mut(level).allocate(count)
    }

    /// Free command buffers previously allocated for `op`
    ///
    /// Nothing is freed if any handle is stale or was allocated elsewhere.
    pub fn release_command_buffer(&mut self, op: OperationClass, buffers: &[CommandBuffer]) -> ExecResult<()> {
        let slot = self.slots.get_mut(&op).ok_or(ExecError::InvalidOperationClass(op))?;
        if !buffers.iter().all(|buffer| slot.pool(buffer.level()).contains(buffer)) {
            return Err(ExecError::UnknownCommandBuffer);
        }

        for level in [CommandBufferLevel::Primary, CommandBufferLevel::Secondary] {
            let batch: Vec<CommandBuffer> = buffers.iter().copied().filter(|b| b.level() == level).collect();
            if !batch.is_empty() {
                slot.pool_mut(level).release(&batch)?;
            }
        }
        Ok(())
    }

    /// Record image layout transitions into a command buffer of `op`
    ///
    /// The buffer is reset and left in the executable state, ready to be
    /// submitted any number of times.
    pub fn record_transitions(
        &self,
        op: OperationClass,
        buffer: &CommandBuffer,
        transitions: &[ImageTransition],
    ) -> ExecResult<()> {
        if !self.slot(op)?.pool(buffer.level()).contains(buffer) {
            return Err(ExecError::UnknownCommandBuffer);
        }

        self.driver
            .begin_command_buffer(buffer.raw(), vk::CommandBufferUsageFlags::SIMULTANEOUS_USE)?;
        self.driver.cmd_transition_images(buffer.raw(), transitions);
        self.driver.end_command_buffer(buffer.raw())?;
        Ok(())
    }

    // ---- synchronization objects ----

    /// Create `count` binary semaphores
    pub fn create_semaphore(&mut self, count: usize) -> ExecResult<Vec<vk::Semaphore>> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let semaphore = self.driver.create_semaphore()?;
            self.semaphores.insert(semaphore);
            created.push(semaphore);
        }
        Ok(created)
    }

    /// Destroy semaphores created by this context
    pub fn destroy_semaphore(&mut self, semaphores: &[vk::Semaphore]) {
        for semaphore in semaphores {
            if self.semaphores.remove(semaphore) {
                self.driver.destroy_semaphore(*semaphore);
            } else {
                log::warn!("Ignoring semaphore {semaphore:?} not owned by this context");
            }
        }
    }

    /// Create `count` fences
    pub fn create_fence(&mut self, count: usize, signaled: bool) -> ExecResult<Vec<vk::Fence>> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let fence = self.driver.create_fence(signaled)?;
            self.fences.insert(fence);
            created.push(fence);
        }
        Ok(created)
    }

    /// Destroy fences created by this context
    pub fn destroy_fence(&mut self, fences: &[vk::Fence]) {
        for fence in fences {
            if self.fences.remove(fence) {
                self.driver.destroy_fence(*fence);
            } else {
                log::warn!("Ignoring fence {fence:?} not owned by this context");
            }
        }
    }

    /// Block until all (or any) of the fences are signaled
    pub fn wait(&self, fences: &[vk::Fence], wait_all: bool) -> ExecResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        self.driver.wait_for_fences(fences, wait_all, u64::MAX)?;
        Ok(())
    }

    /// Return fences to the unsignaled state
    pub fn reset(&self, fences: &[vk::Fence]) -> ExecResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        self.driver.reset_fences(fences)?;
        Ok(())
    }

    /// Wait for all fences, then reset them
    pub fn wait_and_reset(&self, fences: &[vk::Fence]) -> ExecResult<()> {
        self.wait(fences, true)?;
        self.reset(fences)
    }

    // ---- memory and resources ----

    /// Allocate memory satisfying `requirements` with the given properties
    ///
    /// An exact match of `flags` is preferred over a superset. When no type
    /// qualifies the request fails as out of host memory if it asked for host
    /// visibility, out of device memory otherwise.
    pub fn allocate_memory(
        &mut self,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> ExecResult<Memory> {
        let Some(type_index) =
            find_memory_type(self.driver.memory_properties(), requirements.memory_type_bits, flags)
        else {
            return Err(if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                ExecError::OutOfHostMemory
            } else {
                ExecError::OutOfDeviceMemory
            });
        };

        let raw = self.driver.allocate_memory(requirements.size, type_index)?;
        let type_flags = self.driver.memory_properties().memory_types[type_index as usize].property_flags;
        let memory = Memory::new(raw, requirements.size, type_index, type_flags);
        self.memory.insert(raw, memory);
        log::trace!("Allocated {} bytes from memory type {}", requirements.size, type_index);
        Ok(memory)
    }

    /// Free an allocation made by [`allocate_memory`](Self::allocate_memory)
    pub fn free_memory(&mut self, memory: &Memory) {
        if self.memory.remove(&memory.raw()).is_some() {
            self.driver.free_memory(memory.raw());
        } else {
            log::warn!("Ignoring memory {:?} not owned by this context", memory.raw());
        }
    }

    /// Create a device-local image with dedicated memory
    pub fn create_image(&mut self, desc: &ImageDesc) -> ExecResult<Arc<Image>> {
        let raw = self.driver.create_image(desc)?;
        let requirements = self.driver.image_memory_requirements(raw);

        let memory = match self.allocate_memory(&requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(e) => {
                self.driver.destroy_image(raw);
                return Err(e);
            }
        };
        if let Err(e) = self.driver.bind_image_memory(raw, memory.raw(), 0) {
            self.driver.destroy_image(raw);
            self.free_memory(&memory);
            return Err(e.into());
        }

        let image = Arc::new(Image::owned(raw, *desc, memory));
        self.images.insert(raw, Arc::clone(&image));
        Ok(image)
    }

    /// Give up a reference to an image
    ///
    /// The image and its memory are destroyed once the last reference
    /// obtained from this context has been released.
    pub fn release_image(&mut self, image: Arc<Image>) {
        let raw = image.raw();
        drop(image);

        let last = self.images.get(&raw).is_some_and(|tracked| Arc::strong_count(tracked) == 1);
        if last {
            if let Some(image) = self.images.remove(&raw) {
                self.driver.destroy_image(raw);
                if let Some(memory) = image.memory() {
                    self.free_memory(memory);
                }
            }
        }
    }

    /// Create a buffer with dedicated memory
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> ExecResult<Arc<Buffer>> {
        let raw = self.driver.create_buffer(desc.size, desc.usage)?;
        let requirements = self.driver.buffer_memory_requirements(raw);

        let memory = match self.allocate_memory(&requirements, desc.memory_flags) {
            Ok(memory) => memory,
            Err(e) => {
                self.driver.destroy_buffer(raw);
                return Err(e);
            }
        };
        if let Err(e) = self.driver.bind_buffer_memory(raw, memory.raw(), 0) {
            self.driver.destroy_buffer(raw);
            self.free_memory(&memory);
            return Err(e.into());
        }

        let buffer = Arc::new(Buffer::new(raw, *desc, memory));
        self.buffers.insert(raw, Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Give up a reference to a buffer, destroying it with the last one
    pub fn release_buffer(&mut self, buffer: Arc<Buffer>) {
        let raw = buffer.raw();
        drop(buffer);

        let last = self.buffers.get(&raw).is_some_and(|tracked| Arc::strong_count(tracked) == 1);
        if last {
            if let Some(buffer) = self.buffers.remove(&raw) {
                self.driver.destroy_buffer(raw);
                self.free_memory(buffer.memory());
            }
        }
    }

    /// Create a descriptor pool holding `copies` sets of every layout of `source`
    pub fn create_descriptor_pool(
        &mut self,
        source: &dyn DescriptorLayoutSource,
        copies: u32,
    ) -> ExecResult<vk::DescriptorPool> {
        let sizes = scale_pool_sizes(&source.descriptor_pool_sizes(), copies);
        let max_sets = source.descriptor_set_count().saturating_mul(copies);
        let pool = self.driver.create_descriptor_pool(&sizes, max_sets)?;
        self.descriptor_pools.insert(pool);
        Ok(pool)
    }

    /// Destroy a descriptor pool created by this context
    pub fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        if self.descriptor_pools.remove(&pool) {
            self.driver.destroy_descriptor_pool(pool);
        }
    }

    /// Allocate `copies` copies of every set layout of `source` from a fresh pool
    pub fn create_descriptor_array(
        &mut self,
        source: &dyn DescriptorLayoutSource,
        copies: u32,
    ) -> ExecResult<DescriptorArray> {
        let layouts = source.descriptor_set_layouts();
        if layouts.is_empty() {
            return Err(ExecError::NoDescriptorSetLayouts);
        }

        let pool = self.create_descriptor_pool(source, copies)?;
        let all: Vec<vk::DescriptorSetLayout> = (0..copies).flat_map(|_| layouts.iter().copied()).collect();
        match self.driver.allocate_descriptor_sets(pool, &all) {
            Ok(sets) => Ok(DescriptorArray::new(pool, sets, layouts.len())),
            Err(e) => {
                self.destroy_descriptor_pool(pool);
                Err(e.into())
            }
        }
    }

    /// Destroy a descriptor array and its pool
    pub fn destroy_descriptor_array(&mut self, array: DescriptorArray) {
        self.destroy_descriptor_pool(array.pool());
    }

    /// Create a framebuffer over the images of one frame
    ///
    /// Attachments follow the set's role order, one view per image.
    pub fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        images: &ImageSet,
        extent: vk::Extent2D,
    ) -> ExecResult<vk::Framebuffer> {
        let mut views = Vec::with_capacity(images.len());
        for (_, image) in images.iter() {
            let desc = image.desc();
            match self.driver.create_image_view(image.raw(), desc.format, desc.aspect) {
                Ok(view) => views.push(view),
                Err(e) => {
                    self.destroy_image_views(&views);
                    return Err(e.into());
                }
            }
        }

        match self.driver.create_framebuffer(render_pass, &views, extent) {
            Ok(framebuffer) => {
                self.framebuffers.insert(framebuffer, views);
                Ok(framebuffer)
            }
            Err(e) => {
                self.destroy_image_views(&views);
                Err(e.into())
            }
        }
    }

    /// Destroy a framebuffer created by this context, with its image views
    pub fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        if let Some(views) = self.framebuffers.remove(&framebuffer) {
            self.driver.destroy_framebuffer(framebuffer);
            self.destroy_image_views(&views);
        }
    }

    fn destroy_image_views(&self, views: &[vk::ImageView]) {
        for &view in views {
            self.driver.destroy_image_view(view);
        }
    }

    // ---- submission ----

    /// Submit to the queue of `op` without waiting
    pub fn execute(&self, op: OperationClass, batch: &SubmissionBatch, fence: Option<vk::Fence>) -> ExecResult<()> {
        let slot = self.slot(op)?;
        let fence = fence.unwrap_or_else(vk::Fence::null);
        if batch.is_empty() && fence == vk::Fence::null() {
            return Ok(());
        }

        log::trace!("{:?}: submitting {} submissions", op, batch.len());
        self.driver.queue_submit(slot.queue, batch.as_slice(), fence)?;
        Ok(())
    }

    /// Submit and block until the work has completed
    pub fn execute_and_wait(&self, op: OperationClass, batch: &SubmissionBatch) -> ExecResult<()> {
        self.slot(op)?;
        let fence = self.driver.create_fence(false)?;

        let result = self
            .driver
            .queue_submit(self.slots[&op].queue, batch.as_slice(), fence)
            .and_then(|()| self.driver.wait_for_fences(&[fence], true, u64::MAX));

        self.driver.destroy_fence(fence);
        result.map_err(ExecError::from)
    }

    /// Present an acquired swap image on the `Present` queue
    pub fn present(&self, request: &PresentRequest) -> ExecResult<PresentStatus> {
        let slot = self.slot(OperationClass::Present)?;
        match self.driver.queue_present(slot.queue, request) {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Submit with the execution fence of `op` and mark it in flight
    ///
    /// If `op` is still in flight from an earlier call, that submission is
    /// waited on first, so at most one engine submission per class is ever
    /// outstanding. An empty batch submits nothing.
    pub fn engine_execute(&mut self, op: OperationClass, batch: &SubmissionBatch) -> ExecResult<()> {
        if self.slot(op)?.in_flight {
            log::trace!("{op:?}: still in flight, waiting before resubmitting");
            self.engine_wait(&[op])?;
        }
        if batch.is_empty() {
            return Ok(());
        }

        let slot = self.slots.get_mut(&op).ok_or(ExecError::InvalidOperationClass(op))?;
        self.driver
            .queue_submit(slot.queue, batch.as_slice(), slot.execution_fence)?;
        slot.in_flight = true;
        Ok(())
    }

    /// Wait for and reset the execution fence of every in-flight class in `ops`
    ///
    /// Classes that are not in flight are skipped without touching the device.
    pub fn engine_wait(&mut self, ops: &[OperationClass]) -> ExecResult<()> {
        for &op in ops {
            let slot = self.slots.get_mut(&op).ok_or(ExecError::InvalidOperationClass(op))?;
            if !slot.in_flight {
                continue;
            }

            let fences = [slot.execution_fence];
            self.driver.wait_for_fences(&fences, true, u64::MAX)?;
            self.driver.reset_fences(&fences)?;
            slot.in_flight = false;
        }
        Ok(())
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> ExecResult<()> {
        self.driver.device_wait_idle()?;
        Ok(())
    }

    /// Counts of tracked objects
    pub fn tracked_counts(&self) -> TrackedObjects {
        TrackedObjects {
            command_buffers: self
                .slots
                .values()
                .map(|slot| slot.primary.len() + slot.secondary.len())
                .sum(),
            semaphores: self.semaphores.len(),
            fences: self.fences.len(),
            memory: self.memory.len(),
            images: self.images.len(),
            buffers: self.buffers.len(),
            descriptor_pools: self.descriptor_pools.len(),
            framebuffers: self.framebuffers.len(),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.driver.device_wait_idle() {
            log::error!("Failed to wait for device idle during context teardown: {e:?}");
        }

        let leaked = self.tracked_counts();
        if leaked != TrackedObjects::default() {
            log::warn!("Context dropped with live objects: {leaked:?}");
        }

        for (framebuffer, views) in std::mem::take(&mut self.framebuffers) {
            self.driver.destroy_framebuffer(framebuffer);
            self.destroy_image_views(&views);
        }
        for pool in self.descriptor_pools.drain() {
            self.driver.destroy_descriptor_pool(pool);
        }
        for (raw, _) in self.buffers.drain() {
            self.driver.destroy_buffer(raw);
        }
        for (raw, _) in self.images.drain() {
            self.driver.destroy_image(raw);
        }
        for (raw, _) in self.memory.drain() {
            self.driver.free_memory(raw);
        }
        for fence in self.fences.drain() {
            self.driver.destroy_fence(fence);
        }
        for semaphore in self.semaphores.drain() {
            self.driver.destroy_semaphore(semaphore);
        }

        for (_, mut slot) in std::mem::take(&mut self.slots) {
            slot.primary.release_all();
            slot.secondary.release_all();
            self.driver.destroy_fence(slot.execution_fence);
        }
    }
}
