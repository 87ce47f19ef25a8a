use crate::hal::LoopOps;
use crate::{LoopDevice, LoopManager};
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr;

/// RAII guard that detaches a loop device when dropped.
#[derive(Debug)]
pub struct LoopGuard<'a, H: LoopOps> {
    manager: &'a LoopManager<H>,
    device: LoopDevice,
}

impl<'a, H: LoopOps> LoopGuard<'a, H> {
    pub fn new(manager: &'a LoopManager<H>, device: LoopDevice) -> Self {
        Self { manager, device }
    }

    /// Prevent automatic detach and return the device handle.
    pub fn release(self) -> LoopDevice {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the device is moved out exactly once.
        unsafe { ptr::read(&this.device) }
    }
}

impl<'a, H: LoopOps> Deref for LoopGuard<'a, H> {
    type Target = LoopDevice;

    fn deref(&self) -> &LoopDevice {
        &self.device
    }
}

impl<'a, H: LoopOps> Drop for LoopGuard<'a, H> {
    fn drop(&mut self) {
        if let Err(err) = self.manager.detach(&mut self.device) {
            log::warn!(
                "loop guard failed to detach {}: {}",
                self.device.path().display(),
                err
            );
        }
    }
}
