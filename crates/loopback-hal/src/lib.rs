//! Loop block device management for Linux hosts.
//!
//! Binds a regular backing file to a free `/dev/loopN` node and releases it
//! again. [`LoopManager::attach`] validates the backing file, allocates a free
//! device through the loop control node, binds it and applies [`LoopParams`].
//! [`LoopManager::detach`] clears the binding, riding out the kernel's
//! asynchronous teardown with bounded retries.

mod allocator;
mod binding;
mod config;
mod device;
mod error;
pub mod hal;
mod sys;
pub mod sysfs;

pub use allocator::DeviceAllocator;
pub use binding::{attach_loop_device, detach_loop_devices, LoopManager};
pub use config::{
    LoopConfig, RetryPolicy, DEFAULT_ALLOCATION_ATTEMPTS, DEFAULT_BACKOFF_BASE,
    DEFAULT_BACKOFF_MAX, DEFAULT_BIND_ATTEMPTS, DEFAULT_DETACH_ATTEMPTS,
};
pub use device::{BindState, FreeDevice, LoopDevice, LoopStatus};
pub use error::{LoopError, LoopRequest, LoopResult};
pub use hal::{FakeHal, LinuxHal, LoopGuard, LoopOps, LoopParams, Operation};
pub use sys::LoopInfo64;
