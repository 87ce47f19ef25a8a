use nix::errno::Errno;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type LoopResult<T> = std::result::Result<T, LoopError>;

/// Kernel requests issued against the loop control node or a loop device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopRequest {
    GetFree,
    SetFd,
    SetStatus,
    GetStatus,
    SetDirectIo,
    ClearFd,
}

impl fmt::Display for LoopRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopRequest::GetFree => "LOOP_CTL_GET_FREE",
            LoopRequest::SetFd => "LOOP_SET_FD",
            LoopRequest::SetStatus => "LOOP_SET_STATUS64",
            LoopRequest::GetStatus => "LOOP_GET_STATUS64",
            LoopRequest::SetDirectIo => "LOOP_SET_DIRECT_IO",
            LoopRequest::ClearFd => "LOOP_CLR_FD",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Backing file {}: {source}", .path.display())]
    BackingFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Loop control unavailable at {}: {errno}", .path.display())]
    ResourceUnavailable {
        path: PathBuf,
        #[source]
        errno: Errno,
    },

    #[error("No free loop device available")]
    Exhausted,

    #[error("Lost the race for a free loop device {attempts} times")]
    AllocationRace { attempts: u32 },

    #[error("Loop device {} still busy after {attempts} detach attempts", .device.display())]
    DetachTimeout { device: PathBuf, attempts: u32 },

    #[error("{request} failed on {}: {errno}", .device.display())]
    KernelRequestFailed {
        request: LoopRequest,
        device: PathBuf,
        #[source]
        errno: Errno,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoopError {
    /// The OS error code behind this failure, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            LoopError::ResourceUnavailable { errno, .. }
            | LoopError::KernelRequestFailed { errno, .. } => Some(*errno),
            LoopError::BackingFile { source, .. } | LoopError::Io(source) => {
                source.raw_os_error().map(Errno::from_raw)
            }
            LoopError::Exhausted
            | LoopError::AllocationRace { .. }
            | LoopError::DetachTimeout { .. } => None,
        }
    }
}

/// Converts an `open(2)` failure into the errno it carries.
pub(crate) fn io_errno(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::UnknownErrno)
}
