//! Paths and retry budgets used by the allocator and binding manager.

use crate::sys;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fresh `LOOP_CTL_GET_FREE` requests made while the returned node keeps vanishing.
pub const DEFAULT_ALLOCATION_ATTEMPTS: u32 = 10;
/// Allocate-and-bind rounds made while `LOOP_SET_FD` reports the slot taken.
pub const DEFAULT_BIND_ATTEMPTS: u32 = 10;
/// `LOOP_CLR_FD` requests made while the device reports busy.
pub const DEFAULT_DETACH_ATTEMPTS: u32 = 20;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(10);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Bounded retry budgets for the transient kernel conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryPolicy {
    pub allocation_attempts: u32,
    pub bind_attempts: u32,
    pub detach_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
            detach_attempts: DEFAULT_DETACH_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (1-based): grows linearly, capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(attempt.max(1))
            .min(self.backoff_max)
    }

    /// Same budgets with no sleeping between attempts.
    pub fn without_backoff(self) -> Self {
        Self {
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            ..self
        }
    }
}

/// Where the loop control node, device nodes and sysfs entries live.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoopConfig {
    pub control_path: PathBuf,
    pub dev_dir: PathBuf,
    pub sys_block_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            control_path: PathBuf::from(sys::LOOP_CONTROL_PATH),
            dev_dir: PathBuf::from(sys::DEV_DIR),
            sys_block_dir: PathBuf::from(sys::SYS_BLOCK_DIR),
            retry: RetryPolicy::default(),
        }
    }
}

impl LoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root every path under `dir`: `<dir>/loop-control`, `<dir>/loopN`, `<dir>/block`.
    pub fn rooted_at(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            control_path: dir.join("loop-control"),
            dev_dir: dir.to_path_buf(),
            sys_block_dir: dir.join("block"),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn device_name(index: u32) -> String {
        format!("loop{}", index)
    }

    pub fn device_path(&self, index: u32) -> PathBuf {
        self.dev_dir.join(Self::device_name(index))
    }
}
