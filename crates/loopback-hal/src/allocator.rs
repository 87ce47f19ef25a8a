//! Free loop device allocation through the loop control node.

use crate::config::LoopConfig;
use crate::device::FreeDevice;
use crate::error::io_errno;
use crate::hal::LoopOps;
use crate::{LoopError, LoopRequest, LoopResult};
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::thread::sleep;

/// Obtains exclusive access to one currently unused loop device node.
///
/// Slot state is never cached: every attempt asks the kernel for a fresh free
/// index, so concurrent allocators in other processes are arbitrated by the
/// kernel alone.
#[derive(Debug)]
pub struct DeviceAllocator<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    config: &'a LoopConfig,
}

impl<'a, H: LoopOps + ?Sized> DeviceAllocator<'a, H> {
    pub fn new(hal: &'a H, config: &'a LoopConfig) -> Self {
        Self { hal, config }
    }

    /// Open the control node, request a free index and open that device read-write.
    pub fn allocate_free_device(&self) -> LoopResult<FreeDevice> {
        let control = self.open_control()?;
        let retry = &self.config.retry;

        for attempt in 1..=retry.allocation_attempts {
            let index = self.hal.get_free(&control).map_err(|errno| match errno {
                Errno::ENOSPC | Errno::ENODEV => LoopError::Exhausted,
                errno => LoopError::KernelRequestFailed {
                    request: LoopRequest::GetFree,
                    device: self.config.control_path.clone(),
                    errno,
                },
            })?;

            let path = self.config.device_path(index);
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => {
                    log::debug!("allocated free loop device {}", path.display());
                    return Ok(FreeDevice { index, path, file });
                }
                Err(err) => match io_errno(&err) {
                    Errno::ENOENT | Errno::ENXIO | Errno::ENODEV | Errno::EBUSY => {
                        log::debug!(
                            "loop device {} went away before open ({}), attempt {}/{}",
                            path.display(),
                            err,
                            attempt,
                            retry.allocation_attempts
                        );
                        if attempt < retry.allocation_attempts {
                            sleep(retry.backoff(attempt));
                        }
                    }
                    errno @ (Errno::EACCES | Errno::EPERM) => {
                        return Err(LoopError::ResourceUnavailable { path, errno });
                    }
                    _ => return Err(LoopError::Io(err)),
                },
            }
        }

        Err(LoopError::AllocationRace {
            attempts: retry.allocation_attempts,
        })
    }

    fn open_control(&self) -> LoopResult<File> {
        let path = &self.config.control_path;
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| LoopError::ResourceUnavailable {
                path: path.clone(),
                errno: io_errno(&err),
            })
    }
}
