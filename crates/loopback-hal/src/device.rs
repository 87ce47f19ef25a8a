//! Handles for allocated and bound loop devices.

use crate::hal::LoopParams;
use crate::sys::{
    LoopInfo64, LO_FLAGS_AUTOCLEAR, LO_FLAGS_DIRECT_IO, LO_FLAGS_PARTSCAN, LO_FLAGS_READ_ONLY,
};
use std::ffi::OsStr;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// An open, currently unbound loop device node.
#[derive(Debug)]
pub struct FreeDevice {
    pub(crate) index: u32,
    pub(crate) path: PathBuf,
    pub(crate) file: File,
}

impl FreeDevice {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Bound,
    Unbound,
}

/// A loop device bound to a backing file by [`crate::LoopManager::attach`].
///
/// Holds the device node open. Once detached the handle stays unbound; a new
/// binding needs a new attach.
#[derive(Debug)]
pub struct LoopDevice {
    index: u32,
    path: PathBuf,
    file: File,
    backing: PathBuf,
    params: LoopParams,
    state: BindState,
}

impl LoopDevice {
    pub(crate) fn bound(device: FreeDevice, backing: PathBuf, params: LoopParams) -> Self {
        Self {
            index: device.index,
            path: device.path,
            file: device.file,
            backing,
            params,
            state: BindState::Bound,
        }
    }

    pub(crate) fn mark_unbound(&mut self) {
        self.state = BindState::Unbound;
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Device node path, e.g. `/dev/loop7`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn backing_path(&self) -> &Path {
        &self.backing
    }

    pub fn params(&self) -> LoopParams {
        self.params
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state == BindState::Bound
    }

    /// Close the handle and hand back the node path.
    ///
    /// With `autoclear` set and no other open references, the kernel releases
    /// the binding as the descriptor closes.
    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

impl AsFd for LoopDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for LoopDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Snapshot of the kernel's view of a bound device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub index: u32,
    /// Backing path as recorded at bind time, truncated to 63 bytes.
    pub file_name: PathBuf,
    pub offset: u64,
    pub size_limit: u64,
    pub readonly: bool,
    pub autoclear: bool,
    pub partscan: bool,
    pub direct: bool,
}

impl From<&LoopInfo64> for LoopStatus {
    fn from(info: &LoopInfo64) -> Self {
        let flags = info.lo_flags;
        Self {
            index: info.lo_number,
            file_name: PathBuf::from(OsStr::from_bytes(info.file_name())),
            offset: info.lo_offset,
            size_limit: info.lo_sizelimit,
            readonly: flags & LO_FLAGS_READ_ONLY != 0,
            autoclear: flags & LO_FLAGS_AUTOCLEAR != 0,
            partscan: flags & LO_FLAGS_PARTSCAN != 0,
            direct: flags & LO_FLAGS_DIRECT_IO != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decodes_flags_and_name() {
        let mut info = LoopInfo64 {
            lo_number: 4,
            lo_flags: LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR,
            ..LoopInfo64::default()
        };
        info.set_file_name(b"/var/lib/images/rootfs.img");

        let status = LoopStatus::from(&info);
        assert_eq!(status.index, 4);
        assert_eq!(status.file_name, Path::new("/var/lib/images/rootfs.img"));
        assert!(status.readonly);
        assert!(status.autoclear);
        assert!(!status.partscan);
        assert!(!status.direct);
    }
}
