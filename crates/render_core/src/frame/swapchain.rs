//! Swap object owned by a surface frame chain

use ash::vk;

use crate::core::config::SwapchainConfig;
use crate::driver::{PresentRequest, SwapchainRequest};
use crate::exec::{Context, ExecError, ExecResult, PresentStatus};

/// Surface binding and the live swap object presenting to it
///
/// The surface itself belongs to whoever created it (the driver or the
/// windowing layer); the swap object is created, rebuilt and destroyed here.
#[derive(Debug)]
pub struct SurfaceTarget {
    request: SwapchainRequest,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
    max_rebuild_attempts: u32,
    needs_rebuild: bool,
    acquired: Option<u32>,
    rebuilds: u32,
}

impl SurfaceTarget {
    /// Build the first swap object for `surface`
    pub fn new(
        context: &Context,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
        min_image_count: u32,
        config: &SwapchainConfig,
    ) -> ExecResult<Self> {
        let request = SwapchainRequest {
            surface,
            extent,
            min_image_count,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            prefer_mailbox: config.prefer_mailbox,
            prefer_srgb: config.prefer_srgb,
        };
        let created = context.driver().create_swapchain(&request, vk::SwapchainKHR::null())?;
        log::debug!(
            "Swapchain created: {} images, {:?}, {}x{}",
            created.images.len(),
            created.format,
            created.extent.width,
            created.extent.height
        );

        Ok(Self {
            request,
            swapchain: created.handle,
            images: created.images,
            format: created.format,
            extent: created.extent,
            max_rebuild_attempts: config.max_rebuild_attempts.max(1),
            needs_rebuild: false,
            acquired: None,
            rebuilds: 0,
        })
    }

    /// Replace the swap object, retiring the current one
    ///
    /// Waits for the device to go idle first so no submission still
    /// references the old images.
    pub fn rebuild(&mut self, context: &Context) -> ExecResult<()> {
        context.wait_idle()?;

        let old = self.swapchain;
        let created = context.driver().create_swapchain(&self.request, old)?;
        context.driver().destroy_swapchain(old);

        self.swapchain = created.handle;
        self.images = created.images;
        self.format = created.format;
        self.extent = created.extent;
        self.needs_rebuild = false;
        self.acquired = None;
        self.rebuilds += 1;

        log::warn!(
            "Swapchain rebuilt ({} images, {}x{})",
            self.images.len(),
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    /// Acquire the next image
    ///
    /// Returns `None` when the swap object is out of date. A suboptimal
    /// image is still returned and a rebuild is scheduled.
    pub fn try_acquire(
        &mut self,
        context: &Context,
        semaphore: Option<vk::Semaphore>,
        fence: Option<vk::Fence>,
    ) -> ExecResult<Option<u32>> {
        let result = context.driver().acquire_next_image(
            self.swapchain,
            u64::MAX,
            semaphore.unwrap_or_else(vk::Semaphore::null),
            fence.unwrap_or_else(vk::Fence::null),
        );

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal, rebuild scheduled");
                    self.needs_rebuild = true;
                }
                self.acquired = Some(index);
                Ok(Some(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date during acquire");
                self.needs_rebuild = true;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Present the acquired image once `wait_semaphores` are signaled
    pub fn present(&mut self, context: &Context, wait_semaphores: &[vk::Semaphore]) -> ExecResult<PresentStatus> {
        let image_index = self.acquired.take().ok_or(ExecError::NoAcquiredImage)?;
        let status = context.present(&PresentRequest {
            wait_semaphores: wait_semaphores.to_vec(),
            swapchain: self.swapchain,
            image_index,
        })?;

        if status.needs_rebuild() {
            log::warn!("Swapchain {status:?} during present, rebuild scheduled");
            self.needs_rebuild = true;
        }
        Ok(status)
    }

    /// Change the extent used by the next rebuild
    pub fn set_extent(&mut self, extent: vk::Extent2D) {
        self.request.extent = extent;
        self.needs_rebuild = true;
    }

    /// Force a rebuild before the next acquire
    pub fn schedule_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Destroy the swap object
    pub fn destroy(&mut self, context: &Context) {
        if self.swapchain != vk::SwapchainKHR::null() {
            context.driver().destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
            self.images.clear();
            self.acquired = None;
        }
    }

    /// Surface presented to
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.request.surface
    }

    /// Live swap object
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Swap images in index order
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Image format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Whether the next acquire will rebuild first
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Image acquired and not yet presented
    pub fn acquired_image(&self) -> Option<u32> {
        self.acquired
    }

    /// Rebuilds performed so far
    pub fn rebuild_count(&self) -> u32 {
        self.rebuilds
    }

    /// Consecutive out-of-date acquires tolerated by one `next_frame`
    pub fn max_rebuild_attempts(&self) -> u32 {
        self.max_rebuild_attempts
    }
}
