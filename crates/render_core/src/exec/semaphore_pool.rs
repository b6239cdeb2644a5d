//! Fixed-size pool of binary semaphores for dependency edges

use std::collections::HashSet;

use ash::vk;

use super::{Context, ExecError, ExecResult};

/// Pre-created semaphores handed out one at a time
///
/// Acquisition scans the fixed array in order and returns the first
/// semaphore not in use, so the same semaphore comes back after a release.
#[derive(Debug)]
pub struct SemaphorePool {
    semaphores: Vec<vk::Semaphore>,
    in_use: HashSet<vk::Semaphore>,
}

impl SemaphorePool {
    /// Create `size` semaphores through the context
    pub fn new(context: &mut Context, size: usize) -> ExecResult<Self> {
        let semaphores = context.create_semaphore(size)?;
        log::debug!("Created semaphore pool with {size} semaphores");
        Ok(Self::from_semaphores(semaphores))
    }

    /// Wrap semaphores created elsewhere
    pub fn from_semaphores(semaphores: Vec<vk::Semaphore>) -> Self {
        Self {
            in_use: HashSet::with_capacity(semaphores.len()),
            semaphores,
        }
    }

    /// Take a free semaphore
    pub fn acquire(&mut self) -> ExecResult<vk::Semaphore> {
        let semaphore = self
            .semaphores
            .iter()
            .copied()
            .find(|semaphore| !self.in_use.contains(semaphore))
            .ok_or(ExecError::SemaphorePoolExhausted {
                capacity: self.semaphores.len(),
            })?;
        self.in_use.insert(semaphore);
        Ok(semaphore)
    }

    /// Return a semaphore; false if it was not in use
    pub fn release(&mut self, semaphore: vk::Semaphore) -> bool {
        self.in_use.remove(&semaphore)
    }

    /// Mark every semaphore free
    ///
    /// Only valid once all submissions using them have completed.
    pub fn reset(&mut self) {
        self.in_use.clear();
    }

    /// Number of semaphores handed out
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Total number of semaphores
    pub fn capacity(&self) -> usize {
        self.semaphores.len()
    }

    /// Number of semaphores available to acquire
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use()
    }

    /// Destroy the semaphores through the context that created them
    pub fn destroy(self, context: &mut Context) {
        context.destroy_semaphore(&self.semaphores);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pool(size: u64) -> SemaphorePool {
        SemaphorePool::from_semaphores((1..=size).map(vk::Semaphore::from_raw).collect())
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = pool(2);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(ExecError::SemaphorePoolExhausted { capacity: 2 })));
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_and_reuse() {
        let mut pool = pool(2);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_ne!(first, second);

        assert!(pool.release(first));
        assert!(!pool.release(first));
        assert_eq!(pool.acquire().unwrap(), first);
    }

    #[test]
    fn test_reset_frees_everything() {
        let mut pool = pool(3);
        for _ in 0..3 {
            pool.acquire().unwrap();
        }
        pool.reset();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn test_release_foreign_semaphore() {
        let mut pool = pool(1);
        assert!(!pool.release(vk::Semaphore::from_raw(99)));
    }
}
