//! Shared archive state.
//!
//! One [`Archive`] value exists per process and is passed explicitly to
//! every subsystem (transform, disk writer, reader, server); the cyclic
//! header ↔ transform ↔ writer relationships of the design are broken by
//! this single context value rather than by globals.
//!
//! The transform lock is the heart of the read/write interlock: all major
//! blocks other than `current_major_block` are valid for reading, the
//! current block is being assembled or written, and the pointer only
//! advances under this lock. Readers take the same lock for the O(1)
//! sections where they sample the cursor or the index.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use fa_core::{FaError, FilterMask, Result};

use crate::layout::{validate_header, ArchiveGeometry, DiskHeader, MetadataMap};

/// How to open the archive file for the write path.
#[derive(Debug, Clone, Copy)]
pub struct OpenMode {
    /// Open the data-write handle with `O_DIRECT`. Disabled for tests and
    /// for filesystems without direct I/O support (tmpfs).
    pub direct_io: bool,
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode { direct_io: true }
    }
}

/// State guarded by the transform lock.
#[derive(Debug, Clone, Copy)]
pub struct TransformCursor {
    pub current_major_block: u32,
    /// Write cursor into the DD ring, in slots.
    pub dd_offset: u32,
}

/// Shared per-archive context.
pub struct Archive {
    pub geometry: ArchiveGeometry,
    pub metadata: MetadataMap,
    /// The transform lock.
    pub lock: Mutex<TransformCursor>,
    /// Live archive mask; replaced only by a layout-preserving update.
    pub mask: RwLock<FilterMask>,
    /// IIR-smoothed major block duration estimate, µs.
    pub last_duration: AtomicU32,
    /// Peak ring backlog since the last header flush.
    pub write_backlog: AtomicU32,
}

impl Archive {
    /// Open and validate an existing archive.
    ///
    /// Returns the shared context plus the write handle the disk writer
    /// thread takes ownership of. The metadata mapping is created from
    /// the write handle so header flushes and external readers see one
    /// coherent file.
    pub fn open(path: &Path, mode: OpenMode) -> Result<(Arc<Archive>, File)> {
        let probe = File::open(path)?;
        let header = read_header_from(&probe)?;
        let file_size = probe.metadata()?.len();
        let (geometry, mask) = validate_header(&header, file_size)?;

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if mode.direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        let write_file = options.open(path)?;
        let metadata = MetadataMap::map(&write_file, &geometry)?;

        let current = header.current_major_block;
        info!(
            path = %path.display(),
            entries = geometry.fa_entry_count,
            archived = geometry.archived_id_count,
            major_blocks = geometry.major_block_count,
            current_major_block = current,
            clean = header.disk_status == 0,
            "archive opened"
        );

        let archive = Arc::new(Archive {
            lock: Mutex::new(TransformCursor {
                current_major_block: current,
                dd_offset: current * geometry.dd_sample_count() as u32,
            }),
            mask: RwLock::new(mask),
            last_duration: AtomicU32::new(header.last_duration),
            write_backlog: AtomicU32::new(0),
            geometry,
            metadata,
        });
        Ok((archive, write_file))
    }

    /// Open a plain buffered handle for the query path.
    pub fn open_read_handle(path: &Path) -> Result<File> {
        Ok(File::open(path)?)
    }

    /// Replace the archive mask with a layout-preserving update.
    ///
    /// The major-block and DD layouts are sized by the archived id count
    /// at prepare time, so only masks with the same popcount are
    /// accepted. The change takes effect from the next major block.
    pub fn update_mask(&self, new_mask: FilterMask) -> Result<()> {
        if new_mask.entry_count() != self.geometry.fa_entry_count {
            return Err(FaError::protocol("Mask entry count mismatch"));
        }
        if new_mask.count() != self.geometry.archived_id_count {
            return Err(FaError::protocol(format!(
                "Mask must select exactly {} ids",
                self.geometry.archived_id_count
            )));
        }
        let mut mask = self.mask.write();
        info!(from = %mask.format(), to = %new_mask.format(), "archive mask updated");
        *mask = new_mask;
        Ok(())
    }
}

/// Read the header through a plain (non-direct) handle.
pub fn read_header_from(file: &File) -> Result<DiskHeader> {
    let mut buf = vec![0u8; std::mem::size_of::<DiskHeader>()];
    file.read_exact_at(&mut buf, 0)?;
    // SAFETY: buf is exactly size_of::<DiskHeader>() bytes;
    // read_unaligned copies the bytes regardless of alignment, and every
    // field of DiskHeader is valid for any bit pattern.
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const DiskHeader) })
}
