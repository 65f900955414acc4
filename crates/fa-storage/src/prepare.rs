//! Archive preparation.
//!
//! `fa-prepare` formats a single pre-allocated file: the fixed header is
//! written, the data index and DD ring are zeroed, and the data region is
//! extended sparsely. The daemon later opens the file, validates the
//! header and resumes writing from the recorded position.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::info;

use fa_core::{FaError, FilterMask, Result};

use crate::archive::read_header_from;
use crate::layout::{ArchiveGeometry, DISK_MAGIC};

/// Formatting request for a new archive.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub geometry: ArchiveGeometry,
    pub mask: FilterMask,
    /// Refuse to clobber a live archive unless set.
    pub force: bool,
}

/// Create (or reformat) an archive file at `path`.
///
/// The geometry's `archived_id_count` is taken from the mask. Fails when
/// the target already holds an archive whose header says a daemon is
/// still writing, unless `force` is set.
pub fn prepare_archive(path: &Path, request: &PrepareRequest) -> Result<u64> {
    let mut geometry = request.geometry.clone();
    geometry.archived_id_count = request.mask.count();
    if request.mask.entry_count() != geometry.fa_entry_count {
        return Err(FaError::Geometry(format!(
            "mask covers {} ids but the archive has {}",
            request.mask.entry_count(),
            geometry.fa_entry_count
        )));
    }
    geometry.validate()?;

    if !request.force {
        if let Ok(existing) = std::fs::File::open(path) {
            if let Ok(header) = read_header_from(&existing) {
                if header.magic == DISK_MAGIC && header.disk_status != 0 {
                    return Err(FaError::Header(
                        "archive is marked as in use (disk_status = 1); \
                         stop the daemon or pass --force"
                            .into(),
                    ));
                }
            }
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    // The data region is sparse; only the metadata prefix is materialised.
    let total = geometry.total_file_size();
    file.set_len(total)?;

    let header = geometry.to_header(&request.mask);
    let mut metadata = vec![0u8; geometry.major_data_start() as usize];
    // SAFETY: the buffer is at least size_of::<DiskHeader>() bytes and
    // write_unaligned has no alignment requirement.
    unsafe {
        std::ptr::write_unaligned(metadata.as_mut_ptr() as *mut crate::layout::DiskHeader, header)
    };
    use std::os::unix::fs::FileExt;
    file.write_all_at(&metadata, 0)?;
    file.sync_all()?;

    info!(
        path = %path.display(),
        size = total,
        entries = geometry.fa_entry_count,
        mask = %request.mask.format(),
        major_blocks = geometry.major_block_count,
        major_block_size = geometry.major_block_size(),
        "archive formatted"
    );
    Ok(total)
}

/// Derive the largest major block count that fits a requested file size.
///
/// The metadata prefix itself grows with the block count (index entries
/// and DD slots), so the count is found by walking down from the upper
/// bound until header, metadata and data all fit.
pub fn block_count_for_size(geometry: &ArchiveGeometry, file_size: u64) -> Result<usize> {
    let mut g = geometry.clone();
    let mut count = (file_size / g.major_block_size() as u64) as usize;
    while count >= 4 {
        g.major_block_count = count;
        if g.total_file_size() <= file_size {
            return Ok(count);
        }
        count -= 1;
    }
    Err(FaError::Geometry(format!(
        "{file_size} bytes cannot hold the minimum of 4 major blocks"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, OpenMode};

    fn request() -> PrepareRequest {
        let mut mask = FilterMask::empty(256).unwrap();
        for id in 0..8 {
            mask.set(id).unwrap();
        }
        PrepareRequest {
            geometry: ArchiveGeometry {
                fa_entry_count: 256,
                first_decimation_log2: 6,
                second_decimation_log2: 7,
                input_block_size: 65536,
                major_sample_count: 65536,
                major_block_count: 4,
                archived_id_count: 8,
            },
            mask,
            force: false,
        }
    }

    #[test]
    fn formatted_archive_opens_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fa");
        let request = request();
        let size = prepare_archive(&path, &request).unwrap();
        assert_eq!(size, request.geometry.total_file_size());

        let (archive, _file) = Archive::open(&path, OpenMode { direct_io: false }).unwrap();
        assert_eq!(archive.geometry, request.geometry);
        assert_eq!(*archive.mask.read(), request.mask);
        assert_eq!(archive.lock.lock().current_major_block, 0);

        // A fresh archive has no written blocks.
        for i in 0..4 {
            assert_eq!(archive.metadata.index_entry(i).duration, 0);
        }
    }

    #[test]
    fn block_count_derivation_converges() {
        let request = request();
        let mut six = request.geometry.clone();
        six.major_block_count = 6;

        // An exact fit resolves to exactly that count, and one byte less
        // drops a block.
        let exact = six.total_file_size();
        assert_eq!(block_count_for_size(&request.geometry, exact).unwrap(), 6);
        assert_eq!(block_count_for_size(&request.geometry, exact - 1).unwrap(), 5);

        let one_block = request.geometry.major_block_size() as u64;
        assert!(block_count_for_size(&request.geometry, one_block).is_err());
    }
}
