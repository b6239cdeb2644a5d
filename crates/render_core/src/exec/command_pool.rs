//! Command pools and generation-checked command buffer handles

use std::sync::Arc;

use ash::vk;
use slotmap::SlotMap;

use super::{ExecError, ExecResult};
use crate::driver::Driver;

slotmap::new_key_type! {
    /// Generation-checked key of a command buffer inside its pool
    pub struct CommandBufferKey;
}

/// Command buffer level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    /// Submitted directly to a queue
    Primary,
    /// Executed from a primary buffer
    Secondary,
}

impl From<CommandBufferLevel> for vk::CommandBufferLevel {
    fn from(level: CommandBufferLevel) -> Self {
        match level {
            CommandBufferLevel::Primary => Self::PRIMARY,
            CommandBufferLevel::Secondary => Self::SECONDARY,
        }
    }
}

/// Handle to a command buffer allocated from a [`CommandPool`]
///
/// Copying the handle does not duplicate the buffer. Once the buffer is
/// released every copy goes stale and is rejected by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBuffer {
    key: CommandBufferKey,
    raw: vk::CommandBuffer,
    level: CommandBufferLevel,
}

impl CommandBuffer {
    /// Raw handle for recording
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }

    /// Level the buffer was allocated at
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Key inside the owning pool
    pub fn key(&self) -> CommandBufferKey {
        self.key
    }
}

impl From<CommandBuffer> for vk::CommandBuffer {
    fn from(buffer: CommandBuffer) -> Self {
        buffer.raw
    }
}

/// Command pool bound to one queue family and one buffer level
///
/// Buffers are individually resettable. Dropping the pool destroys it
/// together with every buffer still allocated.
pub struct CommandPool {
    driver: Arc<dyn Driver>,
    raw: vk::CommandPool,
    family: u32,
    level: CommandBufferLevel,
    buffers: SlotMap<CommandBufferKey, vk::CommandBuffer>,
}

impl CommandPool {
    /// Create a pool for `family` handing out buffers at `level`
    pub fn new(driver: Arc<dyn Driver>, family: u32, level: CommandBufferLevel) -> ExecResult<Self> {
        let raw = driver.create_command_pool(family)?;
        Ok(Self {
            driver,
            raw,
            family,
            level,
            buffers: SlotMap::with_key(),
        })
    }

    /// Allocate `count` command buffers
    pub fn allocate(&mut self, count: u32) -> ExecResult<Vec<CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let raw_buffers = self.driver.allocate_command_buffers(self.raw, self.level.into(), count)?;
        let level = self.level;
        Ok(raw_buffers
            .into_iter()
            .map(|raw| CommandBuffer {
                key: self.buffers.insert(raw),
                raw,
                level,
            })
            .collect())
    }

    /// Free command buffers
    ///
    /// All handles are checked before anything is freed, so a stale handle
    /// leaves the pool untouched.
    pub fn release(&mut self, buffers: &[CommandBuffer]) -> ExecResult<()> {
        if !buffers.iter().all(|buffer| self.contains(buffer)) {
            return Err(ExecError::UnknownCommandBuffer);
        }

        let raw: Vec<vk::CommandBuffer> = buffers
            .iter()
            .filter_map(|buffer| self.buffers.remove(buffer.key))
            .collect();
        self.driver.free_command_buffers(self.raw, &raw);
        Ok(())
    }

    /// Free every live buffer, invalidating all outstanding handles
    pub fn release_all(&mut self) {
        let raw: Vec<vk::CommandBuffer> = self.buffers.drain().map(|(_, raw)| raw).collect();
        self.driver.free_command_buffers(self.raw, &raw);
    }

    /// True if the handle refers to a live buffer of this pool
    pub fn contains(&self, buffer: &CommandBuffer) -> bool {
        self.buffers.get(buffer.key) == Some(&buffer.raw)
    }

    /// Number of live buffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// True if no buffers are allocated
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Queue family the pool belongs to
    pub fn family(&self) -> u32 {
        self.family
    }

    /// Level of the buffers handed out
    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Raw pool handle
    pub fn raw(&self) -> vk::CommandPool {
        self.raw
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            log::warn!(
                "Command pool for family {} dropped with {} buffers still allocated",
                self.family,
                self.buffers.len()
            );
        }
        self.driver.destroy_command_pool(self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HeadlessDriver;

    fn pool() -> CommandPool {
        let driver: Arc<dyn Driver> = Arc::new(HeadlessDriver::typical());
        CommandPool::new(driver, 0, CommandBufferLevel::Primary).unwrap()
    }

    #[test]
    fn test_allocate_and_release() {
        let mut pool = pool();
        let buffers = pool.allocate(3).unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(pool.len(), 3);
        assert!(buffers.iter().all(|b| pool.contains(b)));

        pool.release(&buffers[..2]).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(&buffers[0]));
        assert!(pool.contains(&buffers[2]));
    }

    #[test]
    fn test_stale_handle_rejected_without_side_effects() {
        let mut pool = pool();
        let buffers = pool.allocate(2).unwrap();
        pool.release(&buffers[..1]).unwrap();

        let result = pool.release(&buffers);
        assert!(matches!(result, Err(ExecError::UnknownCommandBuffer)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_zero_count_allocates_nothing() {
        let mut pool = pool();
        assert!(pool.allocate(0).unwrap().is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_empty_handle_list() {
        let mut pool = pool();
        pool.release(&[]).unwrap();
        assert_eq!(pool.family(), 0);
        assert_eq!(pool.level(), CommandBufferLevel::Primary);
    }
}
