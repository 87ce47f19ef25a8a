//! Helpers related to loop block devices in sysfs.

use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub fn device_basename(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("invalid device path {}", path.display()))?
        .to_string_lossy()
        .to_string();
    Ok(name)
}

/// Reads `<sys_block>/<name>/loop/backing_file`.
///
/// The kernel only exposes the `loop/` directory while the device is bound,
/// so `None` means no binding.
pub fn loop_backing_file(sys_block_dir: &Path, name: &str) -> Option<PathBuf> {
    read_trimmed(sys_block_dir.join(name).join("loop/backing_file")).map(PathBuf::from)
}

/// Reads `<sys_block>/<name>/loop/autoclear` (`1` or `0`).
pub fn loop_autoclear(sys_block_dir: &Path, name: &str) -> Option<bool> {
    read_trimmed(sys_block_dir.join(name).join("loop/autoclear")).map(|v| v == "1")
}

fn read_trimmed(path: PathBuf) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
