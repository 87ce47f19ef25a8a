//! Linux HAL implementation issuing real loop ioctls.

use super::LoopOps;
use crate::sys::{self, LoopInfo64};
use nix::errno::Errno;
use std::fs::File;
use std::os::fd::AsRawFd;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

impl LoopOps for LinuxHal {
    fn get_free(&self, control: &File) -> Result<u32, Errno> {
        // SAFETY: LOOP_CTL_GET_FREE takes no argument; the fd is open for the call.
        let index = unsafe { sys::loop_ctl_get_free(control.as_raw_fd()) }?;
        u32::try_from(index).map_err(|_| Errno::ERANGE)
    }

    fn set_fd(&self, device: &File, backing: &File) -> Result<(), Errno> {
        // SAFETY: both descriptors stay open for the duration of the call.
        unsafe { sys::loop_set_fd(device.as_raw_fd(), backing.as_raw_fd()) }?;
        Ok(())
    }

    fn set_status(&self, device: &File, info: &LoopInfo64) -> Result<(), Errno> {
        // SAFETY: `info` is a live, correctly laid out loop_info64.
        unsafe { sys::loop_set_status64(device.as_raw_fd(), info) }?;
        Ok(())
    }

    fn get_status(&self, device: &File) -> Result<LoopInfo64, Errno> {
        let mut info = LoopInfo64::default();
        // SAFETY: the kernel writes at most size_of::<loop_info64>() bytes into `info`.
        unsafe { sys::loop_get_status64(device.as_raw_fd(), &mut info) }?;
        Ok(info)
    }

    fn set_direct_io(&self, device: &File, enabled: bool) -> Result<(), Errno> {
        // SAFETY: LOOP_SET_DIRECT_IO takes its argument by value.
        unsafe { sys::loop_set_direct_io(device.as_raw_fd(), nix::libc::c_int::from(enabled)) }?;
        Ok(())
    }

    fn clear_fd(&self, device: &File) -> Result<(), Errno> {
        // SAFETY: LOOP_CLR_FD takes no argument.
        unsafe { sys::loop_clr_fd(device.as_raw_fd()) }?;
        Ok(())
    }
}
