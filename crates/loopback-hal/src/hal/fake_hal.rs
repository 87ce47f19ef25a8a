//! Fake HAL implementation for testing.
//!
//! Device nodes are plain files in a scratch directory; the kernel's slot
//! table is modelled in memory. Every request is recorded, and errno faults
//! can be queued per request so retry and unwind paths run without root.

use super::LoopOps;
use crate::config::LoopConfig;
use crate::sys::{LoopInfo64, LO_FLAGS_DIRECT_IO};
use crate::LoopRequest;
use nix::errno::Errno;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    GetFree,
    SetFd { index: u32 },
    SetStatus { index: u32, flags: u32 },
    GetStatus { index: u32 },
    SetDirectIo { index: u32, enabled: bool },
    ClearFd { index: u32 },
}

#[derive(Debug, Clone, Copy, Default)]
struct FakeSlot {
    bound: bool,
    info: LoopInfo64,
}

#[derive(Debug, Default)]
struct FakeHalState {
    operations: Vec<Operation>,
    slots: BTreeMap<u32, FakeSlot>,
    /// Inode of each created node file, mapped to its slot index.
    nodes: HashMap<u64, u32>,
    faults: HashMap<LoopRequest, VecDeque<Errno>>,
    next_index: u32,
    vanishing: u32,
    max_devices: Option<u32>,
}

impl FakeHalState {
    fn take_fault(&mut self, request: LoopRequest) -> Result<(), Errno> {
        match self.faults.get_mut(&request).and_then(VecDeque::pop_front) {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn index_of(&self, device: &File) -> Result<u32, Errno> {
        let ino = device.metadata().map_err(|_| Errno::EBADF)?.ino();
        self.nodes.get(&ino).copied().ok_or(Errno::ENOTTY)
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut FakeSlot, Errno> {
        self.slots.get_mut(&index).ok_or(Errno::ENXIO)
    }
}

/// Fake HAL that models the loop slot table in memory.
#[derive(Debug, Clone)]
pub struct FakeHal {
    dev_dir: PathBuf,
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    /// Use `dev_dir` as the device directory and create its `loop-control` node.
    pub fn new(dev_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dev_dir = dev_dir.into();
        File::create(dev_dir.join("loop-control"))?;
        Ok(Self {
            dev_dir,
            state: Arc::new(Mutex::new(FakeHalState::default())),
        })
    }

    /// Config pointing at this fake's directory, with retries that never sleep.
    pub fn config(&self) -> LoopConfig {
        let config = LoopConfig::rooted_at(&self.dev_dir);
        let retry = config.retry.without_backoff();
        config.with_retry(retry)
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }

    fn lock(&self) -> MutexGuard<'_, FakeHalState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.lock().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.lock().operations.iter().any(check)
    }

    /// Clear all recorded operations. Slot state is kept.
    pub fn clear(&self) {
        self.lock().operations.clear();
    }

    /// Fail the next `times` requests of kind `request` with `errno`.
    pub fn fail_times(&self, request: LoopRequest, errno: Errno, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(request).or_default();
        queue.extend(std::iter::repeat(errno).take(times));
    }

    pub fn fail_next(&self, request: LoopRequest, errno: Errno) {
        self.fail_times(request, errno, 1);
    }

    /// The next `count` free indices handed out have no device node behind them.
    pub fn vanish_next_nodes(&self, count: u32) {
        self.lock().vanishing += count;
    }

    /// Refuse to create more than `max` devices.
    pub fn limit_devices(&self, max: u32) {
        self.lock().max_devices = Some(max);
    }

    pub fn is_bound(&self, index: u32) -> bool {
        self.lock().slots.get(&index).is_some_and(|slot| slot.bound)
    }

    /// Status held for a bound slot.
    pub fn slot_info(&self, index: u32) -> Option<LoopInfo64> {
        self.lock()
            .slots
            .get(&index)
            .filter(|slot| slot.bound)
            .map(|slot| slot.info)
    }

    /// Bind a slot as if another process had done it.
    pub fn bind_externally(&self, index: u32) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(&index) {
            slot.bound = true;
        }
    }

    fn create_node(&self, state: &mut FakeHalState, index: u32) -> Result<(), Errno> {
        let path = self.dev_dir.join(LoopConfig::device_name(index));
        let node = File::create(&path).map_err(|_| Errno::EIO)?;
        let ino = node.metadata().map_err(|_| Errno::EIO)?.ino();
        state.nodes.insert(ino, index);
        state.slots.insert(index, FakeSlot::default());
        Ok(())
    }
}

impl LoopOps for FakeHal {
    fn get_free(&self, _control: &File) -> Result<u32, Errno> {
        let mut state = self.lock();
        state.operations.push(Operation::GetFree);
        state.take_fault(LoopRequest::GetFree)?;

        if state.vanishing > 0 {
            state.vanishing -= 1;
            let index = state.next_index;
            state.next_index += 1;
            return Ok(index);
        }

        if let Some((&index, _)) = state.slots.iter().find(|(_, slot)| !slot.bound) {
            return Ok(index);
        }

        if state
            .max_devices
            .is_some_and(|max| state.slots.len() as u32 >= max)
        {
            return Err(Errno::ENOSPC);
        }

        let index = state.next_index;
        state.next_index += 1;
        self.create_node(&mut state, index)?;
        Ok(index)
    }

    fn set_fd(&self, device: &File, _backing: &File) -> Result<(), Errno> {
        let mut state = self.lock();
        let index = state.index_of(device)?;
        state.operations.push(Operation::SetFd { index });
        state.take_fault(LoopRequest::SetFd)?;

        let slot = state.slot_mut(index)?;
        if slot.bound {
            return Err(Errno::EBUSY);
        }
        slot.bound = true;
        slot.info = LoopInfo64 {
            lo_number: index,
            ..LoopInfo64::default()
        };
        Ok(())
    }

    fn set_status(&self, device: &File, info: &LoopInfo64) -> Result<(), Errno> {
        let mut state = self.lock();
        let index = state.index_of(device)?;
        state.operations.push(Operation::SetStatus {
            index,
            flags: info.lo_flags,
        });
        state.take_fault(LoopRequest::SetStatus)?;

        let slot = state.slot_mut(index)?;
        if !slot.bound {
            return Err(Errno::ENXIO);
        }
        // Direct I/O is not settable through a status request.
        let direct = slot.info.lo_flags & LO_FLAGS_DIRECT_IO;
        slot.info = LoopInfo64 {
            lo_number: index,
            lo_flags: (info.lo_flags & !LO_FLAGS_DIRECT_IO) | direct,
            ..*info
        };
        Ok(())
    }

    fn get_status(&self, device: &File) -> Result<LoopInfo64, Errno> {
        let mut state = self.lock();
        let index = state.index_of(device)?;
        state.operations.push(Operation::GetStatus { index });
        state.take_fault(LoopRequest::GetStatus)?;

        let slot = state.slot_mut(index)?;
        if !slot.bound {
            return Err(Errno::ENXIO);
        }
        Ok(slot.info)
    }

    fn set_direct_io(&self, device: &File, enabled: bool) -> Result<(), Errno> {
        let mut state = self.lock();
        let index = state.index_of(device)?;
        state
            .operations
            .push(Operation::SetDirectIo { index, enabled });
        state.take_fault(LoopRequest::SetDirectIo)?;

        let slot = state.slot_mut(index)?;
        if !slot.bound {
            return Err(Errno::ENXIO);
        }
        if enabled {
            slot.info.lo_flags |= LO_FLAGS_DIRECT_IO;
        } else {
            slot.info.lo_flags &= !LO_FLAGS_DIRECT_IO;
        }
        Ok(())
    }

    fn clear_fd(&self, device: &File) -> Result<(), Errno> {
        let mut state = self.lock();
        let index = state.index_of(device)?;
        state.operations.push(Operation::ClearFd { index });
        state.take_fault(LoopRequest::ClearFd)?;

        let slot = state.slot_mut(index)?;
        if !slot.bound {
            return Err(Errno::ENXIO);
        }
        *slot = FakeSlot::default();
        Ok(())
    }
}
