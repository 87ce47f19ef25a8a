//! HAL trait definitions and implementations.
//!
//! `LoopOps` is the kernel request seam. `LinuxHal` issues real ioctls;
//! `FakeHal` models the slot table in memory for tests.

pub mod fake_hal;
pub mod guards;
pub mod linux_hal;
pub mod loop_ops;

pub use fake_hal::{FakeHal, Operation};
pub use guards::LoopGuard;
pub use linux_hal::LinuxHal;
pub use loop_ops::{LoopOps, LoopParams};
