//! Loop device kernel requests.

use crate::sys::{LoopInfo64, LO_FLAGS_AUTOCLEAR, LO_FLAGS_PARTSCAN, LO_FLAGS_READ_ONLY};
use nix::errno::Errno;
use std::fs::File;

/// Options applied when binding a backing file to a loop device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoopParams {
    /// Bind read-only; writes through the device node fail.
    pub readonly: bool,
    /// Let the kernel drop the binding when the last open reference closes.
    pub autoclear: bool,
    /// Ask the kernel to scan the device for partitions (`losetup -P`).
    pub partscan: bool,
    /// Request direct I/O against the backing file.
    ///
    /// The kernel ignores `LO_FLAGS_DIRECT_IO` in a status request, so this is
    /// applied with a separate `LOOP_SET_DIRECT_IO` after the status. A refusal
    /// (unaligned backing file, filesystem without O_DIRECT) leaves the device
    /// on buffered I/O.
    pub direct: bool,
}

impl LoopParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn autoclear(mut self, autoclear: bool) -> Self {
        self.autoclear = autoclear;
        self
    }

    pub fn partscan(mut self, partscan: bool) -> Self {
        self.partscan = partscan;
        self
    }

    pub fn direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    /// Flags settable through `LOOP_SET_STATUS64`. Direct I/O is not among them.
    pub(crate) fn lo_flags(&self) -> u32 {
        let mut flags = 0;
        if self.readonly {
            flags |= LO_FLAGS_READ_ONLY;
        }
        if self.autoclear {
            flags |= LO_FLAGS_AUTOCLEAR;
        }
        if self.partscan {
            flags |= LO_FLAGS_PARTSCAN;
        }
        flags
    }
}

/// The kernel requests behind loop device management.
///
/// Each method maps onto exactly one ioctl and reports the raw errno; the
/// allocator and binding manager decide what is transient and what is fatal.
pub trait LoopOps: Send + Sync {
    /// `LOOP_CTL_GET_FREE` on an open control node. Returns the index of a free
    /// device, creating one if the kernel allows it.
    fn get_free(&self, control: &File) -> Result<u32, Errno>;

    /// `LOOP_SET_FD`: bind `backing` to `device`.
    fn set_fd(&self, device: &File, backing: &File) -> Result<(), Errno>;

    /// `LOOP_SET_STATUS64`: apply flags and the recorded file name.
    fn set_status(&self, device: &File, info: &LoopInfo64) -> Result<(), Errno>;

    /// `LOOP_GET_STATUS64`: read back what the kernel holds for `device`.
    fn get_status(&self, device: &File) -> Result<LoopInfo64, Errno>;

    /// `LOOP_SET_DIRECT_IO`: switch direct I/O on or off for a bound `device`.
    fn set_direct_io(&self, device: &File, enabled: bool) -> Result<(), Errno>;

    /// `LOOP_CLR_FD`: drop the binding of `device`.
    fn clear_fd(&self, device: &File) -> Result<(), Errno>;
}
