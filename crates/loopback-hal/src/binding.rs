//! Binding manager: attach backing files to loop devices and release them.

use crate::allocator::DeviceAllocator;
use crate::config::LoopConfig;
use crate::device::{FreeDevice, LoopDevice, LoopStatus};
use crate::hal::{LinuxHal, LoopOps, LoopParams};
use crate::sys::LoopInfo64;
use crate::{LoopError, LoopRequest, LoopResult};
use nix::errno::Errno;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread::sleep;

/// Attaches backing files to free loop devices and detaches them again.
#[derive(Debug, Clone, Default)]
pub struct LoopManager<H: LoopOps = LinuxHal> {
    hal: H,
    config: LoopConfig,
}

impl LoopManager<LinuxHal> {
    /// Manager for the host's real loop devices under `/dev`.
    pub fn linux() -> Self {
        Self::new(LinuxHal::new(), LoopConfig::default())
    }
}

impl<H: LoopOps> LoopManager<H> {
    pub fn new(hal: H, config: LoopConfig) -> Self {
        Self { hal, config }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn allocator(&self) -> DeviceAllocator<'_, H> {
        DeviceAllocator::new(&self.hal, &self.config)
    }

    /// Bind `backing` to a free loop device and apply `params`.
    ///
    /// The backing file is validated before any kernel request is made. If
    /// configuring the device fails after it was bound, the binding is cleared
    /// before the error is returned.
    pub fn attach(&self, backing: impl AsRef<Path>, params: LoopParams) -> LoopResult<LoopDevice> {
        let backing = backing.as_ref();
        let backing_file = open_backing_file(backing, params.readonly)?;
        let retry = &self.config.retry;

        for attempt in 1..=retry.bind_attempts {
            let device = self.allocator().allocate_free_device()?;
            log::debug!(
                "binding {} to {}",
                backing.display(),
                device.path().display()
            );

            match self.hal.set_fd(&device.file, &backing_file) {
                Ok(()) => {}
                Err(Errno::EBUSY) => {
                    // Another process bound the slot between GET_FREE and SET_FD.
                    log::debug!(
                        "{} was claimed before bind, attempt {}/{}",
                        device.path().display(),
                        attempt,
                        retry.bind_attempts
                    );
                    if attempt < retry.bind_attempts {
                        sleep(retry.backoff(attempt));
                    }
                    continue;
                }
                Err(errno) => {
                    return Err(LoopError::KernelRequestFailed {
                        request: LoopRequest::SetFd,
                        device: device.path,
                        errno,
                    });
                }
            }

            if let Err(errno) = self.configure(&device, backing, params) {
                self.unwind(&device);
                return Err(LoopError::KernelRequestFailed {
                    request: LoopRequest::SetStatus,
                    device: device.path,
                    errno,
                });
            }

            if params.direct {
                self.enable_direct_io(&device);
            }

            log::info!(
                "attached {} to {}{}",
                backing.display(),
                device.path().display(),
                if params.readonly { " (read-only)" } else { "" }
            );
            return Ok(LoopDevice::bound(device, backing.to_path_buf(), params));
        }

        Err(LoopError::AllocationRace {
            attempts: retry.bind_attempts,
        })
    }

    fn configure(&self, device: &FreeDevice, backing: &Path, params: LoopParams) -> Result<(), Errno> {
        let mut info = LoopInfo64 {
            lo_flags: params.lo_flags(),
            ..LoopInfo64::default()
        };
        info.set_file_name(backing.as_os_str().as_bytes());
        self.hal.set_status(&device.file, &info)
    }

    /// Direct I/O is best effort: a refusal leaves the device on buffered I/O.
    fn enable_direct_io(&self, device: &FreeDevice) {
        if let Err(errno) = self.hal.set_direct_io(&device.file, true) {
            log::debug!(
                "{} rejected direct I/O ({}), staying buffered",
                device.path().display(),
                errno
            );
        }
    }

    /// Clear a binding left by a failed attach, riding out transient busy
    /// reports the same way detach does.
    fn unwind(&self, device: &FreeDevice) {
        if let Err(err) = self.clear_binding(&device.file, &device.path) {
            log::warn!(
                "failed to clear partial binding on {}: {}",
                device.path().display(),
                err
            );
        }
    }

    /// Release the binding behind `device`.
    ///
    /// Retries while the kernel reports the device busy. Detaching an already
    /// unbound handle is a no-op.
    pub fn detach(&self, device: &mut LoopDevice) -> LoopResult<()> {
        if !device.is_bound() {
            return Ok(());
        }
        self.clear_binding(device.file(), device.path())?;
        device.mark_unbound();
        log::info!("detached {}", device.path().display());
        Ok(())
    }

    /// Release whatever is bound to the device node at `path`.
    pub fn detach_path(&self, path: impl AsRef<Path>) -> LoopResult<()> {
        let path = path.as_ref();
        let file = File::open(path)?;
        self.clear_binding(&file, path)?;
        log::info!("detached {}", path.display());
        Ok(())
    }

    fn clear_binding(&self, file: &File, path: &Path) -> LoopResult<()> {
        let retry = &self.config.retry;
        for attempt in 1..=retry.detach_attempts {
            match self.hal.clear_fd(file) {
                Ok(()) => return Ok(()),
                Err(Errno::ENXIO) => {
                    log::debug!("{} already unbound", path.display());
                    return Ok(());
                }
                Err(Errno::EBUSY) => {
                    log::debug!(
                        "{} busy, detach attempt {}/{}",
                        path.display(),
                        attempt,
                        retry.detach_attempts
                    );
                    if attempt < retry.detach_attempts {
                        sleep(retry.backoff(attempt));
                    }
                }
                Err(errno) => {
                    return Err(LoopError::KernelRequestFailed {
                        request: LoopRequest::ClearFd,
                        device: path.to_path_buf(),
                        errno,
                    });
                }
            }
        }
        Err(LoopError::DetachTimeout {
            device: path.to_path_buf(),
            attempts: retry.detach_attempts,
        })
    }

    /// Kernel's current view of `device`.
    pub fn status(&self, device: &LoopDevice) -> LoopResult<LoopStatus> {
        let info = self
            .hal
            .get_status(device.file())
            .map_err(|errno| LoopError::KernelRequestFailed {
                request: LoopRequest::GetStatus,
                device: device.path().to_path_buf(),
                errno,
            })?;
        Ok(LoopStatus::from(&info))
    }

    /// Backing file the kernel reports for `device` through sysfs, if bound.
    pub fn backing_file(&self, device: &LoopDevice) -> anyhow::Result<Option<PathBuf>> {
        let name = crate::sysfs::block::device_basename(device.path())?;
        Ok(crate::sysfs::block::loop_backing_file(
            &self.config.sys_block_dir,
            &name,
        ))
    }
}

fn open_backing_file(path: &Path, readonly: bool) -> LoopResult<File> {
    let backing_err = |source: io::Error| LoopError::BackingFile {
        path: path.to_path_buf(),
        source,
    };

    let metadata = fs::metadata(path).map_err(backing_err)?;
    if !metadata.is_file() {
        return Err(backing_err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }

    OpenOptions::new()
        .read(true)
        .write(!readonly)
        .open(path)
        .map_err(backing_err)
}

/// Attach `backing` with default parameters and return the device node path.
///
/// The handle is closed on return; the binding stays until
/// [`detach_loop_devices`] releases it.
pub fn attach_loop_device(backing: impl AsRef<Path>) -> LoopResult<PathBuf> {
    let device = LoopManager::linux().attach(backing, LoopParams::default())?;
    Ok(device.into_path())
}

/// Detach each device node in order, stopping at the first failure.
pub fn detach_loop_devices<P: AsRef<Path>>(devices: &[P]) -> LoopResult<()> {
    let manager = LoopManager::linux();
    for device in devices {
        manager.detach_path(device)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{FakeHal, Operation};
    use crate::sys::{LO_FLAGS_AUTOCLEAR, LO_FLAGS_READ_ONLY};
    use crate::BindState;
    use tempfile::{tempdir, NamedTempFile, TempDir};

    fn fake_manager() -> (TempDir, LoopManager<FakeHal>) {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new(dir.path()).unwrap();
        let config = hal.config();
        (dir, LoopManager::new(hal, config))
    }

    fn backing_file() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(512).unwrap();
        file
    }

    #[test]
    fn attach_missing_backing_file_issues_no_requests() {
        let (dir, manager) = fake_manager();
        let err = manager
            .attach(dir.path().join("no-such-file"), LoopParams::new())
            .unwrap_err();
        assert!(matches!(err, LoopError::BackingFile { .. }));
        assert_eq!(manager.hal().operation_count(), 0);
    }

    #[test]
    fn attach_directory_is_backing_file_error() {
        let (dir, manager) = fake_manager();
        let err = manager.attach(dir.path(), LoopParams::new()).unwrap_err();
        assert!(matches!(err, LoopError::BackingFile { .. }));
        assert_eq!(manager.hal().operation_count(), 0);
    }

    #[test]
    fn attach_binds_and_applies_flags_in_order() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        let params = LoopParams::new().readonly(true).autoclear(true);

        let device = manager.attach(backing.path(), params).unwrap();
        assert_eq!(device.state(), BindState::Bound);
        assert_eq!(device.backing_path(), backing.path());
        assert!(manager.hal().is_bound(device.index()));

        assert_eq!(
            manager.hal().operations(),
            vec![
                Operation::GetFree,
                Operation::SetFd { index: 0 },
                Operation::SetStatus {
                    index: 0,
                    flags: LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR,
                },
            ]
        );

        let status = manager.status(&device).unwrap();
        assert!(status.readonly);
        assert!(status.autoclear);
        assert_eq!(status.file_name, backing.path());

        let info = manager.hal().slot_info(device.index()).unwrap();
        assert_eq!(info.lo_flags, LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR);
        assert_eq!(info.file_name(), backing.path().as_os_str().as_bytes());
    }

    #[test]
    fn failed_status_request_unwinds_binding() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        manager.hal().fail_next(LoopRequest::SetStatus, Errno::EINVAL);

        let err = manager.attach(backing.path(), LoopParams::new()).unwrap_err();
        assert!(matches!(
            err,
            LoopError::KernelRequestFailed {
                request: LoopRequest::SetStatus,
                errno: Errno::EINVAL,
                ..
            }
        ));
        assert!(!manager.hal().is_bound(0));
        assert!(manager
            .hal()
            .has_operation(|op| *op == Operation::ClearFd { index: 0 }));
    }

    #[test]
    fn busy_clear_during_unwind_is_retried() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        manager.hal().fail_next(LoopRequest::SetStatus, Errno::EINVAL);
        manager.hal().fail_times(LoopRequest::ClearFd, Errno::EBUSY, 2);

        let err = manager.attach(backing.path(), LoopParams::new()).unwrap_err();
        assert!(matches!(
            err,
            LoopError::KernelRequestFailed {
                request: LoopRequest::SetStatus,
                errno: Errno::EINVAL,
                ..
            }
        ));
        assert!(!manager.hal().is_bound(0));
        let clears = manager
            .hal()
            .operations()
            .iter()
            .filter(|op| matches!(op, Operation::ClearFd { .. }))
            .count();
        assert_eq!(clears, 3);
    }

    #[test]
    fn failed_unwind_still_reports_status_error() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        manager.hal().fail_next(LoopRequest::SetStatus, Errno::EINVAL);
        manager.hal().fail_next(LoopRequest::ClearFd, Errno::EPERM);

        let err = manager.attach(backing.path(), LoopParams::new()).unwrap_err();
        assert!(matches!(
            err,
            LoopError::KernelRequestFailed {
                request: LoopRequest::SetStatus,
                errno: Errno::EINVAL,
                ..
            }
        ));
        // A hard clear failure is not retried.
        let clears = manager
            .hal()
            .operations()
            .iter()
            .filter(|op| matches!(op, Operation::ClearFd { .. }))
            .count();
        assert_eq!(clears, 1);
        assert!(manager.hal().is_bound(0));
    }

    #[test]
    fn direct_io_is_applied_after_status() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();

        let device = manager
            .attach(backing.path(), LoopParams::new().direct(true))
            .unwrap();
        let ops = manager.hal().operations();
        assert_eq!(
            &ops[2..],
            &[
                Operation::SetStatus { index: 0, flags: 0 },
                Operation::SetDirectIo {
                    index: 0,
                    enabled: true,
                },
            ]
        );
        assert!(manager.status(&device).unwrap().direct);
    }

    #[test]
    fn rejected_direct_io_falls_back_to_buffered() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        manager.hal().fail_next(LoopRequest::SetDirectIo, Errno::EINVAL);

        let device = manager
            .attach(backing.path(), LoopParams::new().direct(true))
            .unwrap();
        assert!(device.is_bound());
        let status = manager.status(&device).unwrap();
        assert!(!status.direct);
        assert!(!manager
            .hal()
            .has_operation(|op| matches!(op, Operation::ClearFd { .. })));
    }

    #[test]
    fn busy_slot_on_bind_is_retried_with_fresh_allocation() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        manager.hal().fail_times(LoopRequest::SetFd, Errno::EBUSY, 2);

        let device = manager.attach(backing.path(), LoopParams::new()).unwrap();
        assert!(device.is_bound());
        let binds = manager
            .hal()
            .operations()
            .iter()
            .filter(|op| matches!(op, Operation::SetFd { .. }))
            .count();
        assert_eq!(binds, 3);
    }

    #[test]
    fn bind_race_exhaustion_is_allocation_race() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        let attempts = manager.config().retry.bind_attempts;
        manager
            .hal()
            .fail_times(LoopRequest::SetFd, Errno::EBUSY, attempts as usize);

        let err = manager.attach(backing.path(), LoopParams::new()).unwrap_err();
        assert!(matches!(err, LoopError::AllocationRace { .. }));
        assert!(!manager.hal().is_bound(0));
    }

    #[test]
    fn attach_then_detach_leaves_slot_allocatable() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();

        let mut device = manager.attach(backing.path(), LoopParams::new()).unwrap();
        let index = device.index();
        manager.detach(&mut device).unwrap();
        assert_eq!(device.state(), BindState::Unbound);
        assert!(!manager.hal().is_bound(index));

        let again = manager.attach(backing.path(), LoopParams::new()).unwrap();
        assert_eq!(again.index(), index);
    }

    #[test]
    fn detach_retries_while_busy() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        let mut device = manager.attach(backing.path(), LoopParams::new()).unwrap();
        manager.hal().fail_times(LoopRequest::ClearFd, Errno::EBUSY, 3);

        manager.detach(&mut device).unwrap();
        assert!(!device.is_bound());
        let clears = manager
            .hal()
            .operations()
            .iter()
            .filter(|op| matches!(op, Operation::ClearFd { .. }))
            .count();
        assert_eq!(clears, 4);
    }

    #[test]
    fn detach_held_busy_past_budget_times_out() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        let mut device = manager.attach(backing.path(), LoopParams::new()).unwrap();
        let attempts = manager.config().retry.detach_attempts;
        manager
            .hal()
            .fail_times(LoopRequest::ClearFd, Errno::EBUSY, attempts as usize);

        let err = manager.detach(&mut device).unwrap_err();
        assert!(matches!(err, LoopError::DetachTimeout { attempts: a, .. } if a == attempts));
        assert!(device.is_bound());
        assert!(manager.hal().is_bound(device.index()));

        // Blocker gone: a later detach goes through.
        manager.detach(&mut device).unwrap();
        assert!(!device.is_bound());
    }

    #[test]
    fn detach_after_autoclear_release_succeeds() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        let mut device = manager
            .attach(backing.path(), LoopParams::new().autoclear(true))
            .unwrap();
        manager.hal().fail_next(LoopRequest::ClearFd, Errno::ENXIO);

        manager.detach(&mut device).unwrap();
        assert!(!device.is_bound());
    }

    #[test]
    fn detaching_unbound_handle_is_noop() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        let mut device = manager.attach(backing.path(), LoopParams::new()).unwrap();
        manager.detach(&mut device).unwrap();
        manager.hal().clear();

        manager.detach(&mut device).unwrap();
        assert_eq!(manager.hal().operation_count(), 0);
    }

    #[test]
    fn detach_path_clears_binding_by_node_path() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        let device = manager.attach(backing.path(), LoopParams::new()).unwrap();
        let index = device.index();
        let path = device.into_path();

        manager.detach_path(&path).unwrap();
        assert!(!manager.hal().is_bound(index));
    }

    #[test]
    fn detach_path_on_missing_node_is_io_error() {
        let (dir, manager) = fake_manager();
        let err = manager.detach_path(dir.path().join("loop42")).unwrap_err();
        assert!(matches!(err, LoopError::Io(_)));
    }

    #[test]
    fn unexpected_clear_errno_is_not_retried() {
        let (_dir, manager) = fake_manager();
        let backing = backing_file();
        let mut device = manager.attach(backing.path(), LoopParams::new()).unwrap();
        manager.hal().fail_next(LoopRequest::ClearFd, Errno::EPERM);

        let err = manager.detach(&mut device).unwrap_err();
        assert!(matches!(
            err,
            LoopError::KernelRequestFailed {
                request: LoopRequest::ClearFd,
                errno: Errno::EPERM,
                ..
            }
        ));
        assert!(device.is_bound());
    }

    #[test]
    fn backing_file_reads_sysfs_entry() {
        let (dir, manager) = fake_manager();
        let backing = backing_file();
        let device = manager.attach(backing.path(), LoopParams::new()).unwrap();

        assert_eq!(manager.backing_file(&device).unwrap(), None);

        let loop_dir = dir.path().join("block/loop0/loop");
        std::fs::create_dir_all(&loop_dir).unwrap();
        std::fs::write(
            loop_dir.join("backing_file"),
            format!("{}\n", backing.path().display()),
        )
        .unwrap();
        assert_eq!(
            manager.backing_file(&device).unwrap(),
            Some(backing.path().to_path_buf())
        );
    }
}
