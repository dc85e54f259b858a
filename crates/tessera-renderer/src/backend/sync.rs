//! Owning wrappers around backend fences and semaphores

use super::{FenceHandle, SemaphoreHandle, SharedBackend};
use std::fmt;
use std::time::Duration;
use tessera_core::Result;

/// A fence owned by one CPU-side object, destroyed with it
pub struct Fence {
    backend: SharedBackend,
    handle: FenceHandle,
}

impl Fence {
    pub fn new(backend: SharedBackend, signaled: bool) -> Result<Self> {
        let handle = backend.create_fence(signaled)?;
        Ok(Self { backend, handle })
    }

    pub fn handle(&self) -> FenceHandle {
        self.handle
    }

    /// Block until signaled, without timeout
    pub fn wait(&self) -> Result<()> {
        self.backend.wait_fence(self.handle, None).map(|_| ())
    }

    /// Block until signaled or `timeout` elapsed. Returns whether the fence signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.backend.wait_fence(self.handle, Some(timeout))
    }

    pub fn is_signaled(&self) -> bool {
        self.backend.fence_signaled(self.handle)
    }

    pub fn reset(&self) {
        self.backend.reset_fence(self.handle);
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.backend.destroy_fence(self.handle);
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fence").field(&self.handle).finish()
    }
}

/// A semaphore owned by one CPU-side object, destroyed with it
pub struct Semaphore {
    backend: SharedBackend,
    handle: SemaphoreHandle,
}

impl Semaphore {
    pub fn new(backend: SharedBackend) -> Result<Self> {
        let handle = backend.create_semaphore()?;
        Ok(Self { backend, handle })
    }

    pub fn handle(&self) -> SemaphoreHandle {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.backend.destroy_semaphore(self.handle);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.handle).finish()
    }
}
