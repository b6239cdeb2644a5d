//! Frame chains
//!
//! A frame chain rotates a ring of image sets so the CPU can record frame
//! `n + 1` while the GPU still reads frame `n`. The *draw* slot is the one
//! being rendered into, the *read* slot holds the last completed frame.
//!
//! Offscreen chains own their images and advance round-robin. Surface chains
//! wrap the images of a swap object and advance to whatever index the
//! presentation engine hands out, rebuilding the swap object when it goes
//! out of date.
//!
//! Each slot carries two prebuilt submissions: `predraw` moves its images
//! into attachment layouts, `postdraw` moves them back to a sampleable
//! (offscreen) or presentable (surface) layout. They are recorded once and
//! re-recorded only when a rebuild replaces the images.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;

use super::swapchain::SurfaceTarget;
use crate::core::config::{FrameChainConfig, SwapchainConfig, MAX_FRAME_COUNT};
use crate::driver::ImageTransition;
use crate::exec::{
    CommandBatch, CommandBuffer, CommandBufferLevel, Context, ExecError, ExecResult, Image, ImageDesc,
    OperationClass, PresentStatus, Submission, SubmissionBatch,
};
use crate::foundation::time::FrameRateGate;

/// Role name of the single image in each surface image set
pub const SURFACE_COLOR_ROLE: &str = "color";

/// Read and draw cursors over a ring of `count` slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRing {
    count: usize,
    read: usize,
    draw: usize,
}

impl FrameRing {
    /// Ring of `count` slots, drawing into slot 0 with the last slot readable
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            count,
            read: count - 1,
            draw: 0,
        }
    }

    /// Move to the next slot in order
    pub fn advance(&mut self) {
        self.read = self.draw;
        self.draw = (self.draw + 1) % self.count;
    }

    /// Move to a slot chosen elsewhere, such as an acquired swap image
    pub fn advance_to(&mut self, index: usize) {
        self.read = self.draw;
        self.draw = index % self.count;
    }

    /// Change the slot count, keeping both cursors where they still fit
    pub fn set_count(&mut self, count: usize) {
        self.count = count.max(1);
        self.read = self.read.min(self.count - 1);
        self.draw = self.draw.min(self.count - 1);
    }

    /// Number of slots
    pub fn count(&self) -> usize {
        self.count
    }

    /// Slot holding the last completed frame
    pub fn read(&self) -> usize {
        self.read
    }

    /// Slot being rendered
    pub fn draw(&self) -> usize {
        self.draw
    }
}

/// A named image slot of an offscreen chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRole {
    /// Name the image is looked up by, e.g. `"color"` or `"depth"`
    pub name: String,
    /// Shape of the image created for every slot
    pub desc: ImageDesc,
}

impl ImageRole {
    /// Create a role
    pub fn new(name: impl Into<String>, desc: ImageDesc) -> Self {
        Self {
            name: name.into(),
            desc,
        }
    }
}

/// The images of one slot, by role name
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    images: BTreeMap<String, Arc<Image>>,
}

impl ImageSet {
    /// Image playing `role`
    pub fn get(&self, role: &str) -> Option<&Arc<Image>> {
        self.images.get(role)
    }

    /// Iterate `(role, image)` pairs in role order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Image>)> {
        self.images.iter().map(|(role, image)| (role.as_str(), image))
    }

    /// Number of images
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// True if the set has no images
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Construction parameters for a [`FrameChain`]
#[derive(Debug, Clone)]
pub struct FrameChainDesc {
    /// Ring size (minimum swap image count for surface chains)
    pub frame_count: usize,
    /// Optional cap on how often the chain renders
    pub target_fps: Option<f32>,
    /// Operation class the transition submissions run on
    pub operation_class: OperationClass,
    /// Image roles of offscreen chains
    pub roles: Vec<ImageRole>,
    /// Requested extent of surface chains
    pub extent: vk::Extent2D,
    /// Swap object preferences of surface chains
    pub swapchain: SwapchainConfig,
}

impl Default for FrameChainDesc {
    fn default() -> Self {
        Self::from_config(&FrameChainConfig::default(), &SwapchainConfig::default())
    }
}

impl FrameChainDesc {
    /// Description taking frame and swapchain settings from configuration
    pub fn from_config(frames: &FrameChainConfig, swapchain: &SwapchainConfig) -> Self {
        Self {
            frame_count: frames.frame_count,
            target_fps: frames.target_fps,
            operation_class: OperationClass::GraphicsAndCompute,
            roles: Vec::new(),
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            swapchain: swapchain.clone(),
        }
    }

    /// Add an image role
    pub fn with_role(mut self, name: impl Into<String>, desc: ImageDesc) -> Self {
        self.roles.push(ImageRole::new(name, desc));
        self
    }

    /// Set the ring size
    pub fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Cap the render rate
    pub fn with_target_fps(mut self, fps: f32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Run transitions on another operation class
    pub fn with_operation_class(mut self, operation_class: OperationClass) -> Self {
        self.operation_class = operation_class;
        self
    }

    /// Set the surface extent
    pub fn with_extent(mut self, extent: vk::Extent2D) -> Self {
        self.extent = extent;
        self
    }
}

/// Command buffers and prebuilt submissions of one slot
#[derive(Debug, Clone)]
pub struct SlotCommands {
    predraw: Submission,
    postdraw: Submission,
    buffers: Vec<CommandBuffer>,
}

/// What a frame chain renders into
#[derive(Debug)]
pub enum FrameTarget {
    /// Images owned by the chain
    Offscreen {
        /// Roles each slot is created with
        roles: Vec<ImageRole>,
    },
    /// Images of a swap object
    Surface(SurfaceTarget),
}

/// Ring of image sets with read/draw rotation
#[derive(Debug)]
pub struct FrameChain {
    operation_class: OperationClass,
    ring: FrameRing,
    gate: FrameRateGate,
    sets: Vec<ImageSet>,
    slots: Vec<SlotCommands>,
    target: FrameTarget,
}

impl FrameChain {
    /// Create an offscreen chain of `desc.frame_count` image sets
    pub fn offscreen(context: &mut Context, desc: &FrameChainDesc) -> ExecResult<Self> {
        Self::check_frame_count(desc.frame_count)?;
        context.queue(desc.operation_class)?;

        let mut chain = Self {
            operation_class: desc.operation_class,
            ring: FrameRing::new(desc.frame_count),
            gate: FrameRateGate::new(desc.target_fps),
            sets: Vec::new(),
            slots: Vec::new(),
            target: FrameTarget::Offscreen {
                roles: desc.roles.clone(),
            },
        };

        if let Err(e) = chain.populate(context) {
            chain.destroy(context);
            return Err(e);
        }
        log::debug!(
            "Offscreen frame chain: {} slots, {} roles",
            desc.frame_count,
            desc.roles.len()
        );
        Ok(chain)
    }

    /// Create a chain presenting to `surface`
    ///
    /// The ring size follows the number of images the swap object ends up
    /// with, which is at least `desc.frame_count`.
    pub fn surface(context: &mut Context, surface: vk::SurfaceKHR, desc: &FrameChainDesc) -> ExecResult<Self> {
        Self::check_frame_count(desc.frame_count)?;
        context.queue(desc.operation_class)?;
        context.queue(OperationClass::Present)?;

        let target = SurfaceTarget::new(context, surface, desc.extent, desc.frame_count as u32, &desc.swapchain)?;
        let mut chain = Self {
            operation_class: desc.operation_class,
            ring: FrameRing::new(target.images().len()),
            gate: FrameRateGate::new(desc.target_fps),
            sets: Vec::new(),
            slots: Vec::new(),
            target: FrameTarget::Surface(target),
        };

        if let Err(e) = chain.populate(context) {
            chain.destroy(context);
            return Err(e);
        }
        Ok(chain)
    }

    fn check_frame_count(frame_count: usize) -> ExecResult<()> {
        if (2..=MAX_FRAME_COUNT).contains(&frame_count) {
            Ok(())
        } else {
            Err(ExecError::InvalidFrameCount(frame_count))
        }
    }

    /// Build fresh image sets and slot transitions, then swap them in
    ///
    /// The current sets stay in place until the new ones are complete, so a
    /// failure leaves the chain as it was.
    fn populate(&mut self, context: &mut Context) -> ExecResult<()> {
        let mut sets = Vec::new();
        let mut slots = Vec::new();
        if let Err(e) = self.build_frames(context, &mut sets, &mut slots) {
            release_frames(context, self.operation_class, sets, slots);
            return Err(e);
        }

        self.release_slots(context);
        self.sets = sets;
        self.slots = slots;
        Ok(())
    }

    fn build_frames(
        &self,
        context: &mut Context,
        sets: &mut Vec<ImageSet>,
        slots: &mut Vec<SlotCommands>,
    ) -> ExecResult<()> {
        match &self.target {
            FrameTarget::Offscreen { roles } => {
                for _ in 0..self.ring.count() {
                    let mut set = ImageSet::default();
                    let created: ExecResult<()> = roles.iter().try_for_each(|role| {
                        let image = context.create_image(&role.desc)?;
                        set.images.insert(role.name.clone(), image);
                        Ok(())
                    });
                    sets.push(set);
                    created?;
                }
            }
            FrameTarget::Surface(target) => {
                let desc = ImageDesc {
                    extent: target.extent(),
                    format: target.format(),
                    usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    aspect: vk::ImageAspectFlags::COLOR,
                };
                sets.extend(target.images().iter().map(|&raw| ImageSet {
                    images: BTreeMap::from([(SURFACE_COLOR_ROLE.to_string(), Arc::new(Image::external(raw, desc)))]),
                }));
            }
        }

        let present = matches!(self.target, FrameTarget::Surface(_));
        for set in sets.iter() {
            let buffers = context.allocate_command_buffer(self.operation_class, 2, CommandBufferLevel::Primary)?;
            match Self::record_slot(context, self.operation_class, set, present, buffers.clone()) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    if let Err(release) = context.release_command_buffer(self.operation_class, &buffers) {
                        log::error!("Failed to release slot command buffers: {release}");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn record_slot(
        context: &Context,
        op: OperationClass,
        set: &ImageSet,
        present: bool,
        buffers: Vec<CommandBuffer>,
    ) -> ExecResult<SlotCommands> {
        let images: Vec<&Image> = set.images.values().map(|image| &**image).collect();
        let pre: Vec<ImageTransition> = images.iter().map(|image| predraw_transition(image)).collect();
        let post: Vec<ImageTransition> = images.iter().map(|image| postdraw_transition(image, present)).collect();

        context.record_transitions(op, &buffers[0], &pre)?;
        context.record_transitions(op, &buffers[1], &post)?;

        let mut predraw = CommandBatch::new();
        predraw.add(buffers[0])?;
        let mut postdraw = CommandBatch::new();
        postdraw.add(buffers[1])?;

        Ok(SlotCommands {
            predraw: predraw.build()?,
            postdraw: postdraw.build()?,
            buffers,
        })
    }

    /// Release slot command buffers and offscreen images
    fn release_slots(&mut self, context: &mut Context) {
        let sets = std::mem::take(&mut self.sets);
        let slots = std::mem::take(&mut self.slots);
        release_frames(context, self.operation_class, sets, slots);
    }

    /// Replace the swap object and rewrap its images
    ///
    /// The ring keeps its cursors, so the slot drawn before the rebuild
    /// becomes the read slot on the next acquire.
    fn rebuild_surface(&mut self, context: &mut Context) -> ExecResult<()> {
        let FrameTarget::Surface(target) = &mut self.target else {
            return Ok(());
        };
        target.rebuild(context)?;
        let count = target.images().len();

        if let Err(e) = self.populate(context) {
            if let FrameTarget::Surface(target) = &mut self.target {
                target.schedule_rebuild();
            }
            return Err(e);
        }
        self.ring.set_count(count);
        Ok(())
    }

    /// Image set of the last completed frame
    pub fn read_frame(&self) -> &ImageSet {
        &self.sets[self.ring.read()]
    }

    /// Image set being rendered
    pub fn draw_frame(&self) -> &ImageSet {
        &self.sets[self.ring.draw()]
    }

    /// Index of the read slot
    pub fn read_index(&self) -> usize {
        self.ring.read()
    }

    /// Index of the draw slot
    pub fn draw_index(&self) -> usize {
        self.ring.draw()
    }

    /// Number of slots
    pub fn frame_count(&self) -> usize {
        self.ring.count()
    }

    /// Operation class the transitions run on
    pub fn operation_class(&self) -> OperationClass {
        self.operation_class
    }

    /// Offscreen roles or the swap object
    pub fn target(&self) -> &FrameTarget {
        &self.target
    }

    /// True if the frame-rate cap allows rendering now
    pub fn ready_to_render(&mut self) -> bool {
        self.gate.ready()
    }

    /// Transition of the draw slot into attachment layouts
    pub fn predraw(&self) -> &Submission {
        &self.slots[self.ring.draw()].predraw
    }

    /// Transition of the draw slot back to a sampleable or presentable layout
    pub fn postdraw(&self) -> &Submission {
        &self.slots[self.ring.draw()].postdraw
    }

    /// `predraw`, the caller's work, then `postdraw`, as one batch
    pub fn wrap(&self, work: impl Into<SubmissionBatch>) -> SubmissionBatch {
        let mut batch = SubmissionBatch::from(self.predraw().clone());
        batch += work.into();
        batch += self.postdraw();
        batch
    }

    /// Advance an offscreen ring without any synchronization
    pub fn next_frame_now(&mut self) -> ExecResult<()> {
        match self.target {
            FrameTarget::Offscreen { .. } => {
                self.ring.advance();
                Ok(())
            }
            FrameTarget::Surface(_) => Err(ExecError::AcquireRequired),
        }
    }

    /// Advance to the next slot
    ///
    /// Offscreen chains rotate and, when a semaphore or fence is given,
    /// submit an empty submission signaling them so callers can wait the same
    /// way for both kinds of chain. Surface chains acquire the next swap
    /// image, which signals `semaphore` and `fence`; an out-of-date swap
    /// object is rebuilt, `fence` reset and the acquire retried up to the
    /// configured number of times.
    pub fn next_frame(
        &mut self,
        context: &mut Context,
        semaphore: Option<vk::Semaphore>,
        fence: Option<vk::Fence>,
    ) -> ExecResult<()> {
        if matches!(self.target, FrameTarget::Offscreen { .. }) {
            self.ring.advance();
            if semaphore.is_some() || fence.is_some() {
                let signal = Submission::signal_only(semaphore.into_iter().collect::<Vec<_>>());
                context.execute(self.operation_class, &SubmissionBatch::from(signal), fence)?;
            }
            return Ok(());
        }

        let mut rebuilds = 0;
        loop {
            let FrameTarget::Surface(target) = &mut self.target else {
                return Ok(());
            };
            let max_rebuild_attempts = target.max_rebuild_attempts();

            if target.needs_rebuild() {
                self.rebuild_surface(context)?;
                continue;
            }

            if let Some(index) = target.try_acquire(context, semaphore, fence)? {
                self.ring.advance_to(index as usize);
                return Ok(());
            }

            if rebuilds == max_rebuild_attempts {
                log::error!("Swapchain still out of date after {rebuilds} rebuilds");
                return Err(ExecError::SwapchainRebuildExhausted { attempts: rebuilds });
            }
            rebuilds += 1;
            self.rebuild_surface(context)?;
            if let Some(fence) = fence {
                context.reset(&[fence])?;
            }
        }
    }

    /// Present the draw slot of a surface chain
    ///
    /// Out-of-date and suboptimal results are returned as status and schedule
    /// a rebuild before the next acquire. Offscreen chains report `Presented`.
    pub fn present_frame(&mut self, context: &Context, wait_semaphores: &[vk::Semaphore]) -> ExecResult<PresentStatus> {
        match &mut self.target {
            FrameTarget::Offscreen { .. } => Ok(PresentStatus::Presented),
            FrameTarget::Surface(target) => target.present(context, wait_semaphores),
        }
    }

    /// Recreate every image set and its transitions
    ///
    /// Surface chains rebuild the swap object.
    pub fn recreate(&mut self, context: &mut Context) -> ExecResult<()> {
        if matches!(self.target, FrameTarget::Surface(_)) {
            return self.rebuild_surface(context);
        }

        context.wait_idle()?;
        self.populate(context)
    }

    /// Recreate at a new extent
    ///
    /// On failure an offscreen chain keeps its previous images and extent.
    pub fn resize(&mut self, context: &mut Context, extent: vk::Extent2D) -> ExecResult<()> {
        let previous = match &mut self.target {
            FrameTarget::Offscreen { roles } => {
                let previous = roles.clone();
                for role in roles.iter_mut() {
                    role.desc.extent = extent;
                }
                Some(previous)
            }
            FrameTarget::Surface(target) => {
                target.set_extent(extent);
                None
            }
        };

        let result = self.recreate(context);
        if let (Err(_), Some(previous), FrameTarget::Offscreen { roles }) = (&result, previous, &mut self.target) {
            *roles = previous;
        }
        result
    }

    /// Release images, command buffers and the swap object
    pub fn destroy(mut self, context: &mut Context) {
        self.release_slots(context);
        if let FrameTarget::Surface(target) = &mut self.target {
            target.destroy(context);
        }
    }
}

impl Drop for FrameChain {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            log::warn!("Frame chain dropped without destroy, {} slots leaked", self.slots.len());
        }
    }
}

fn release_frames(context: &mut Context, op: OperationClass, sets: Vec<ImageSet>, slots: Vec<SlotCommands>) {
    let buffers: Vec<CommandBuffer> = slots.into_iter().flat_map(|slot| slot.buffers).collect();
    if !buffers.is_empty() {
        if let Err(e) = context.release_command_buffer(op, &buffers) {
            log::error!("Failed to release frame chain command buffers: {e}");
        }
    }
    for set in sets {
        for (_, image) in set.images {
            context.release_image(image);
        }
    }
}

fn predraw_transition(image: &Image) -> ImageTransition {
    let desc = image.desc();
    let (new_layout, dst_stage, dst_access) = if desc.is_depth() {
        (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
    } else {
        (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
    };

    ImageTransition {
        image: image.raw(),
        aspect_mask: desc.aspect,
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout,
        src_stage: vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage,
        src_access: vk::AccessFlags::empty(),
        dst_access,
    }
}

fn postdraw_transition(image: &Image, present: bool) -> ImageTransition {
    let desc = image.desc();
    let (old_layout, src_stage, src_access) = if desc.is_depth() {
        (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
    } else {
        (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
    };
    let (new_layout, dst_stage, dst_access) = if present {
        (
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        )
    } else if desc.is_depth() {
        (
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        )
    } else {
        (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        )
    };

    ImageTransition {
        image: image.raw(),
        aspect_mask: desc.aspect,
        old_layout,
        new_layout,
        src_stage,
        dst_stage,
        src_access,
        dst_access,
    }
}
