//! Character-device sniffer source.
//!
//! Wraps the `fa_sniffer` kernel driver's device node. Newer drivers
//! expose an ioctl interface (version, restart-in-place, halt, precise
//! block timestamps, configurable entry count); older ones only support
//! plain reads of 256-entry frames, with reset by close-and-reopen and
//! software timestamps.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use fa_core::timestamp::now_micros;
use fa_core::{FaError, Result};

use crate::{SnifferSource, SnifferStatus};

/// First driver version with timestamp and entry-count ioctls.
const IOCTL_TIMESTAMP_VERSION: i32 = 2;

// Linux ioctl request encoding: dir << 30 | size << 16 | type << 8 | nr.
const fn io(nr: u64) -> u64 {
    (b'C' as u64) << 8 | nr
}
const fn ior(nr: u64, size: usize) -> u64 {
    2 << 30 | (size as u64) << 16 | (b'C' as u64) << 8 | nr
}
const fn iow(nr: u64, size: usize) -> u64 {
    1 << 30 | (size as u64) << 16 | (b'C' as u64) << 8 | nr
}

const IOCTL_GET_VERSION: u64 = io(0);
const IOCTL_RESTART: u64 = io(1);
const IOCTL_HALT: u64 = io(2);
const IOCTL_GET_STATUS: u64 = ior(3, std::mem::size_of::<SnifferStatus>());
const IOCTL_GET_TIMESTAMP: u64 = ior(4, std::mem::size_of::<BlockTimestamp>());
const IOCTL_GET_ENTRY_COUNT: u64 = io(5);
const IOCTL_SET_ENTRY_COUNT: u64 = iow(6, std::mem::size_of::<u32>());

/// Timestamp record returned by the driver for the last completed read.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BlockTimestamp {
    /// µs since epoch at the end of the block.
    timestamp: u64,
    /// Bytes of the block not covered by this timestamp; non-zero means
    /// the read size did not match the driver's block size.
    residue: u32,
    _pad: u32,
}

/// The real sniffer device.
pub struct DeviceSource {
    path: PathBuf,
    /// Write lock only for swapping the handle on legacy reset; reads
    /// and ioctls share it so `interrupt` works mid-read.
    file: RwLock<File>,
    ioctl_version: Option<i32>,
}

impl DeviceSource {
    /// Open the device and negotiate the entry count.
    pub fn open(path: &Path, entry_count: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            FaError::Device(format!("can't open sniffer device {}: {e}", path.display()))
        })?;

        let ioctl_version = match unsafe_ioctl(&file, IOCTL_GET_VERSION, std::ptr::null_mut()) {
            Ok(version) => {
                info!(version, "sniffer ioctl interface available");
                Some(version)
            }
            Err(_) => {
                debug!("sniffer device has no ioctl interface");
                None
            }
        };

        let source = DeviceSource {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            ioctl_version,
        };

        if source.ioctl_version.unwrap_or(0) >= IOCTL_TIMESTAMP_VERSION {
            source.configure_entry_count(entry_count)?;
        } else if entry_count != 256 {
            return Err(FaError::Device(format!(
                "driver only supports 256 entries, not {entry_count}"
            )));
        }
        Ok(source)
    }

    fn configure_entry_count(&self, entry_count: usize) -> Result<()> {
        let file = self.file.read();
        let current = unsafe_ioctl(&file, IOCTL_GET_ENTRY_COUNT, std::ptr::null_mut())?;
        drop(file);
        if current as usize == entry_count {
            return Ok(());
        }
        // Changing the count mid-stream would deliver mis-sized frames,
        // so the handle is closed and reopened around the change.
        let mut count = entry_count as u32;
        let mut file = self.file.write();
        unsafe_ioctl(
            &file,
            IOCTL_SET_ENTRY_COUNT,
            &mut count as *mut u32 as *mut libc::c_void,
        )
        .map_err(|e| {
            FaError::Device(format!("unable to set sniffer entry count to {entry_count}: {e}"))
        })?;
        *file = File::open(&self.path)?;
        info!(entry_count, "sniffer entry count configured");
        Ok(())
    }
}

impl SnifferSource for DeviceSource {
    fn reset(&self) -> Result<()> {
        if self.ioctl_version.is_some() {
            let file = self.file.read();
            unsafe_ioctl(&file, IOCTL_RESTART, std::ptr::null_mut())?;
        } else {
            // Legacy driver: close and reopen.
            let mut file = self.file.write();
            *file = File::open(&self.path)?;
        }
        Ok(())
    }

    fn read_block(&self, block: &mut [u8]) -> Result<u64> {
        let file = self.file.read();
        let mut filled = 0;
        while filled < block.len() {
            // io::Read for &File, so the shared lock suffices.
            let n = (&*file).read(&mut block[filled..])?;
            if n == 0 {
                return Err(FaError::Device("sniffer read returned no data".into()));
            }
            filled += n;
        }

        if self.ioctl_version.unwrap_or(0) >= IOCTL_TIMESTAMP_VERSION {
            let mut stamp = BlockTimestamp::default();
            unsafe_ioctl(
                &file,
                IOCTL_GET_TIMESTAMP,
                &mut stamp as *mut BlockTimestamp as *mut libc::c_void,
            )?;
            if stamp.residue != 0 {
                return Err(FaError::Device(format!(
                    "block size mismatch: {} bytes of residue",
                    stamp.residue
                )));
            }
            Ok(stamp.timestamp)
        } else {
            Ok(now_micros())
        }
    }

    fn status(&self) -> Result<SnifferStatus> {
        let file = self.file.read();
        let mut status = SnifferStatus::default();
        unsafe_ioctl(
            &file,
            IOCTL_GET_STATUS,
            &mut status as *mut SnifferStatus as *mut libc::c_void,
        )
        .map_err(|e| FaError::Device(format!("unable to read sniffer status: {e}")))?;
        Ok(status)
    }

    fn interrupt(&self) -> Result<()> {
        if self.ioctl_version.is_none() {
            return Err(FaError::Device("interrupt not supported".into()));
        }
        let file = self.file.read();
        unsafe_ioctl(&file, IOCTL_HALT, std::ptr::null_mut())?;
        Ok(())
    }
}

fn unsafe_ioctl(file: &File, request: u64, argument: *mut libc::c_void) -> Result<i32> {
    // SAFETY: the fd is owned and open; the request codes above match
    // the driver's interface and `argument` points at an appropriately
    // sized value (or is null for argument-less requests).
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as libc::c_ulong, argument) };
    if rc < 0 {
        Err(FaError::Io(std::io::Error::last_os_error()))
    } else {
        Ok(rc)
    }
}
