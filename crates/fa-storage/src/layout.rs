//! On-disk archive layout.
//!
//! A prepared archive is a single pre-allocated file:
//!
//! ```text
//! offset 0        fixed 64 KiB header: DiskHeader + reserved zeros
//! 64 KiB          data index: major_block_count × DataIndexEntry
//!                 DD ring: archived_id_count planes × dd_total_count slots
//! major_data_start (4096-aligned)
//!                 data region: major_block_count × major_block_size
//! ```
//!
//! Each major block stores, per archived BPM id in ascending order, a
//! contiguous column of `major_sample_count` FA entries (the FA area),
//! followed by per-id columns of `major_sample_count / D1` decimated
//! slots (the D area).
//!
//! The structures are `#[repr(C)]` and written in native byte order; the
//! format is not portable across endianness. Layout changes must bump
//! [`DISK_VERSION`].

use fa_core::mask::MASK_BYTES;
use fa_core::{DecimatedSlot, FaError, FilterMask, Result, DECIMATED_SLOT_SIZE, FA_ENTRY_SIZE};
use memmap2::MmapMut;

/// Identifies a file as an FA archive.
pub const DISK_MAGIC: [u8; 8] = *b"FAARCH01";

/// On-disk format version.
pub const DISK_VERSION: u32 = 3;

/// Size of the fixed header region at the start of the file.
pub const DISK_HEADER_SIZE: usize = 64 * 1024;

/// Maximum number of contiguous archive segments recorded in the header.
pub const MAX_HEADER_BLOCKS: usize = 8;

/// Alignment of the data region and of every major block within it.
pub const DATA_ALIGNMENT: usize = 4096;

/// One contiguous archive segment: a byte range of the circular data
/// region written without an interior gap, most recent first in
/// [`DiskHeader::segments`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRecord {
    pub start_sec: u64,
    pub stop_sec: u64,
    pub start_offset: i64,
    /// -1 while the segment is still being written.
    pub stop_offset: i64,
}

/// Index entry for one major block.
///
/// `duration == 0` marks a block that has been initialised but never
/// written; such blocks delimit the start of the archive.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataIndexEntry {
    /// Estimated timestamp of the block's first sample, µs since epoch.
    pub timestamp: u64,
    /// Estimated duration of the block in µs.
    pub duration: u32,
    /// Hardware frame counter (id 0 x field) at the block's first frame.
    pub id_zero: u32,
}

/// Size of one packed [`DataIndexEntry`].
pub const INDEX_ENTRY_SIZE: usize = 16;

const _: () = assert!(std::mem::size_of::<DataIndexEntry>() == INDEX_ENTRY_SIZE);
const _: () = assert!(std::mem::size_of::<SegmentRecord>() == 32);

/// Fixed archive header, resident in the first bytes of the file.
///
/// The daemon keeps a private copy and publishes it to the mmap'd file
/// under an fcntl write lock, so external tools always observe a
/// consistent header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DiskHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub fa_entry_count: u32,
    pub first_decimation_log2: u32,
    pub second_decimation_log2: u32,
    pub input_block_size: u32,
    pub major_sample_count: u32,
    pub major_block_count: u32,
    pub dd_sample_count: u32,
    pub dd_total_count: u32,
    /// 0 after a clean shutdown, 1 while the daemon is writing.
    pub disk_status: u32,
    /// Peak ring-buffer backlog since the previous header flush.
    pub write_backlog: u32,
    /// Ring-buffer block count the daemon was started with.
    pub write_buffer: u32,
    pub current_major_block: u32,
    /// Number of live entries in `segments`.
    pub block_count: u32,
    /// IIR-smoothed estimate of the major block duration in µs.
    pub last_duration: u32,
    _pad: u32,
    pub major_block_size: u64,
    pub major_data_start: u64,
    /// Base of the circular data region; segment offsets are relative to
    /// this.
    pub data_start: u64,
    pub data_size: u64,
    pub archive_mask: [u8; MASK_BYTES],
    pub segments: [SegmentRecord; MAX_HEADER_BLOCKS],
}

const _: () = assert!(std::mem::size_of::<DiskHeader>() <= DISK_HEADER_SIZE);

/// Validated archive geometry with every derived size and offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveGeometry {
    pub fa_entry_count: usize,
    pub first_decimation_log2: u32,
    pub second_decimation_log2: u32,
    pub input_block_size: usize,
    pub major_sample_count: usize,
    pub major_block_count: usize,
    pub archived_id_count: usize,
}

impl ArchiveGeometry {
    /// Check the geometry is self-consistent and compatible with direct
    /// I/O alignment for any archive mask.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(FaError::Geometry(msg));

        if self.fa_entry_count == 0
            || self.fa_entry_count % 8 != 0
            || self.fa_entry_count > fa_core::mask::MAX_ENTRY_COUNT
        {
            return fail(format!("bad FA entry count {}", self.fa_entry_count));
        }
        if self.first_decimation_log2 == 0 || self.second_decimation_log2 == 0 {
            return fail("decimation factors must be at least 2".into());
        }
        if self.first_decimation_log2 + self.second_decimation_log2 >= 32 {
            return fail("combined decimation factor too large".into());
        }
        if self.input_block_size == 0 || self.input_block_size % self.frame_size() != 0 {
            return fail(format!(
                "input block size {} is not a whole number of {}-byte frames",
                self.input_block_size,
                self.frame_size()
            ));
        }
        if self.major_sample_count % self.input_frame_count() != 0
            || self.timestamp_count() < 2
        {
            return fail(format!(
                "major sample count {} must cover at least two input blocks",
                self.major_sample_count
            ));
        }
        if self.major_sample_count % self.double_decimation() != 0 {
            return fail(format!(
                "major sample count {} not divisible by double decimation {}",
                self.major_sample_count,
                self.double_decimation()
            ));
        }
        // DD slots are emitted on input-block boundaries, so the double
        // decimation interval must be a whole number of input blocks.
        if self.double_decimation() % self.input_frame_count() != 0 {
            return fail(format!(
                "double decimation {} must be a multiple of the {}-frame input block",
                self.double_decimation(),
                self.input_frame_count()
            ));
        }
        if self.major_sample_count * FA_ENTRY_SIZE % DATA_ALIGNMENT != 0
            || self.d_sample_count() * DECIMATED_SLOT_SIZE % DATA_ALIGNMENT != 0
        {
            return fail("per-id FA and decimated areas must be 4096-byte multiples".into());
        }
        if self.major_block_count < 4 {
            return fail(format!(
                "need at least 4 major blocks, have {}",
                self.major_block_count
            ));
        }
        if self.archived_id_count == 0 || self.archived_id_count > self.fa_entry_count {
            return fail(format!(
                "archived id count {} out of range",
                self.archived_id_count
            ));
        }
        // A u32 duration field caps a major block at ~71 minutes; at the
        // nominal 10 kHz this bound is generous but must still hold for
        // pathological sample counts.
        if self.major_sample_count as u64 * 1_000 > u64::from(u32::MAX) {
            return fail("major block duration would overflow the index".into());
        }
        Ok(())
    }

    pub fn frame_size(&self) -> usize {
        self.fa_entry_count * FA_ENTRY_SIZE
    }

    pub fn input_frame_count(&self) -> usize {
        self.input_block_size / self.frame_size()
    }

    /// Number of minor-block timestamps collected per major block.
    pub fn timestamp_count(&self) -> usize {
        self.major_sample_count / self.input_frame_count()
    }

    pub fn first_decimation(&self) -> usize {
        1 << self.first_decimation_log2
    }

    pub fn double_decimation(&self) -> usize {
        1 << (self.first_decimation_log2 + self.second_decimation_log2)
    }

    /// First-stage decimated samples per major block.
    pub fn d_sample_count(&self) -> usize {
        self.major_sample_count >> self.first_decimation_log2
    }

    /// Double-decimated samples per major block.
    pub fn dd_sample_count(&self) -> usize {
        self.major_sample_count >> (self.first_decimation_log2 + self.second_decimation_log2)
    }

    /// Total double-decimated samples held in the in-memory ring.
    pub fn dd_total_count(&self) -> usize {
        self.major_block_count * self.dd_sample_count()
    }

    /// FA area size within one major block.
    pub fn fa_area_size(&self) -> usize {
        self.archived_id_count * self.major_sample_count * FA_ENTRY_SIZE
    }

    pub fn major_block_size(&self) -> usize {
        self.fa_area_size() + self.archived_id_count * self.d_sample_count() * DECIMATED_SLOT_SIZE
    }

    /// Byte offset of one FA sample within a major block.
    pub fn fa_data_offset(&self, archived_index: usize, fa_offset: usize) -> usize {
        (archived_index * self.major_sample_count + fa_offset) * FA_ENTRY_SIZE
    }

    /// Byte offset of one decimated slot within a major block.
    pub fn d_data_offset(&self, archived_index: usize, d_offset: usize) -> usize {
        self.fa_area_size()
            + (archived_index * self.d_sample_count() + d_offset) * DECIMATED_SLOT_SIZE
    }

    pub fn index_region_offset(&self) -> usize {
        DISK_HEADER_SIZE
    }

    pub fn index_region_size(&self) -> usize {
        self.major_block_count * INDEX_ENTRY_SIZE
    }

    pub fn dd_region_offset(&self) -> usize {
        self.index_region_offset() + self.index_region_size()
    }

    pub fn dd_region_size(&self) -> usize {
        self.archived_id_count * self.dd_total_count() * DECIMATED_SLOT_SIZE
    }

    /// Start of the data region, rounded up for direct I/O.
    pub fn major_data_start(&self) -> u64 {
        let end = self.dd_region_offset() + self.dd_region_size();
        (end as u64).div_ceil(DATA_ALIGNMENT as u64) * DATA_ALIGNMENT as u64
    }

    pub fn data_size(&self) -> u64 {
        self.major_block_count as u64 * self.major_block_size() as u64
    }

    pub fn total_file_size(&self) -> u64 {
        self.major_data_start() + self.data_size()
    }

    /// Build the header for a freshly formatted archive.
    pub fn to_header(&self, mask: &FilterMask) -> DiskHeader {
        DiskHeader {
            magic: DISK_MAGIC,
            version: DISK_VERSION,
            fa_entry_count: self.fa_entry_count as u32,
            first_decimation_log2: self.first_decimation_log2,
            second_decimation_log2: self.second_decimation_log2,
            input_block_size: self.input_block_size as u32,
            major_sample_count: self.major_sample_count as u32,
            major_block_count: self.major_block_count as u32,
            dd_sample_count: self.dd_sample_count() as u32,
            dd_total_count: self.dd_total_count() as u32,
            disk_status: 0,
            write_backlog: 0,
            write_buffer: 0,
            current_major_block: 0,
            block_count: 0,
            last_duration: 0,
            _pad: 0,
            major_block_size: self.major_block_size() as u64,
            major_data_start: self.major_data_start(),
            data_start: self.major_data_start(),
            data_size: self.data_size(),
            archive_mask: *mask.as_bytes(),
            segments: [SegmentRecord::default(); MAX_HEADER_BLOCKS],
        }
    }
}

/// Validate a header read from disk against the file size and reconstruct
/// the geometry and archive mask.
pub fn validate_header(
    header: &DiskHeader,
    file_size: u64,
) -> Result<(ArchiveGeometry, FilterMask)> {
    if header.magic != DISK_MAGIC {
        return Err(FaError::Header(format!(
            "bad magic {:02x?}, not an FA archive",
            header.magic
        )));
    }
    if header.version != DISK_VERSION {
        return Err(FaError::Header(format!(
            "unsupported version {} (expected {DISK_VERSION})",
            header.version
        )));
    }

    let mask = FilterMask::from_bytes(&header.archive_mask, header.fa_entry_count as usize)
        .map_err(|e| FaError::Header(format!("bad archive mask: {e}")))?;

    let geometry = ArchiveGeometry {
        fa_entry_count: header.fa_entry_count as usize,
        first_decimation_log2: header.first_decimation_log2,
        second_decimation_log2: header.second_decimation_log2,
        input_block_size: header.input_block_size as usize,
        major_sample_count: header.major_sample_count as usize,
        major_block_count: header.major_block_count as usize,
        archived_id_count: mask.count(),
    };
    geometry.validate()?;

    // The stored derived fields must agree with the geometry, otherwise
    // the file was written by an incompatible build.
    let consistent = header.major_block_size == geometry.major_block_size() as u64
        && header.major_data_start == geometry.major_data_start()
        && header.data_start == geometry.major_data_start()
        && header.data_size == geometry.data_size()
        && header.dd_sample_count as usize == geometry.dd_sample_count()
        && header.dd_total_count as usize == geometry.dd_total_count()
        && (header.current_major_block as usize) < geometry.major_block_count
        && header.block_count as usize <= MAX_HEADER_BLOCKS;
    if !consistent {
        return Err(FaError::Header("derived header fields inconsistent".into()));
    }
    if file_size < geometry.total_file_size() {
        return Err(FaError::Header(format!(
            "file is {file_size} bytes but the geometry needs {}",
            geometry.total_file_size()
        )));
    }
    Ok((geometry, mask))
}

/// Memory-mapped metadata prefix of the archive file: the fixed header,
/// the data index and the DD ring.
///
/// Concurrent access is coordinated by the callers: the index and DD
/// regions are only touched under the transform lock, and the header
/// region is only written by the disk writer (under the file's fcntl
/// lock for the benefit of external readers).
pub struct MetadataMap {
    /// Kept alive for the lifetime of `base`.
    mmap: MmapMut,
    base: *mut u8,
    index_offset: usize,
    index_count: usize,
    dd_offset: usize,
    dd_total_count: usize,
    dd_planes: usize,
}

// SAFETY: MetadataMap owns its mapping; all reads and writes go through
// raw pointers confined to the mapped range, and the callers serialise
// access per region as described above.
unsafe impl Send for MetadataMap {}
// SAFETY: as for Send; `&self` methods never create overlapping Rust
// references into the mapping.
unsafe impl Sync for MetadataMap {}

impl MetadataMap {
    /// Map the metadata prefix (everything before `major_data_start`) of
    /// an open archive file.
    pub fn map(file: &std::fs::File, geometry: &ArchiveGeometry) -> Result<Self> {
        let len = geometry.major_data_start() as usize;
        // SAFETY: the file stays open for the lifetime of the map and its
        // size was validated against the geometry by the caller.
        let mut mmap = unsafe {
            memmap2::MmapOptions::new()
                .len(len)
                .map_mut(file)
                .map_err(FaError::Io)?
        };
        let base = mmap.as_mut_ptr();
        Ok(MetadataMap {
            mmap,
            base,
            index_offset: geometry.index_region_offset(),
            index_count: geometry.major_block_count,
            dd_offset: geometry.dd_region_offset(),
            dd_total_count: geometry.dd_total_count(),
            dd_planes: geometry.archived_id_count,
        })
    }

    /// Copy the header out of the mapping.
    pub fn read_header(&self) -> DiskHeader {
        // SAFETY: the mapping is at least DISK_HEADER_SIZE bytes and
        // DiskHeader fits within it; read_unaligned has no alignment
        // requirement.
        unsafe { std::ptr::read_unaligned(self.base as *const DiskHeader) }
    }

    /// Publish a header copy into the mapping.
    pub fn write_header(&self, header: &DiskHeader) {
        // SAFETY: as for read_header; the disk writer is the only caller.
        unsafe { std::ptr::write_unaligned(self.base as *mut DiskHeader, *header) }
    }

    fn index_ptr(&self, index: usize) -> *mut DataIndexEntry {
        assert!(index < self.index_count, "index {index} out of range");
        // SAFETY: bounds asserted; the index region lies inside the map.
        unsafe {
            self.base
                .add(self.index_offset + index * INDEX_ENTRY_SIZE)
                .cast()
        }
    }

    pub fn index_entry(&self, index: usize) -> DataIndexEntry {
        // SAFETY: index_ptr is in bounds.
        unsafe { std::ptr::read_unaligned(self.index_ptr(index)) }
    }

    pub fn set_index_entry(&self, index: usize, entry: &DataIndexEntry) {
        // SAFETY: index_ptr is in bounds.
        unsafe { std::ptr::write_unaligned(self.index_ptr(index), *entry) }
    }

    fn dd_ptr(&self, plane: usize, slot: usize) -> *mut u8 {
        assert!(
            plane < self.dd_planes && slot < self.dd_total_count,
            "DD slot ({plane}, {slot}) out of range"
        );
        let offset =
            self.dd_offset + (plane * self.dd_total_count + slot) * DECIMATED_SLOT_SIZE;
        // SAFETY: bounds asserted; the DD region lies inside the map.
        unsafe { self.base.add(offset) }
    }

    pub fn dd_slot(&self, plane: usize, slot: usize) -> DecimatedSlot {
        // SAFETY: dd_ptr is in bounds for DECIMATED_SLOT_SIZE bytes.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.dd_ptr(plane, slot), DECIMATED_SLOT_SIZE)
        };
        DecimatedSlot::read_from(bytes)
    }

    pub fn set_dd_slot(&self, plane: usize, slot: usize, value: &DecimatedSlot) {
        // SAFETY: dd_ptr is in bounds for DECIMATED_SLOT_SIZE bytes, and
        // the transform lock serialises writers against readers.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.dd_ptr(plane, slot), DECIMATED_SLOT_SIZE)
        };
        value.write_to(bytes);
    }

    /// Schedule write-back of the whole metadata region.
    pub fn flush_async(&self) -> Result<()> {
        self.mmap.flush_async().map_err(FaError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> ArchiveGeometry {
        ArchiveGeometry {
            fa_entry_count: 256,
            first_decimation_log2: 6,
            second_decimation_log2: 7,
            input_block_size: 65536,
            major_sample_count: 65536,
            major_block_count: 4,
            archived_id_count: 8,
        }
    }

    #[test]
    fn reference_geometry_validates() {
        let g = geometry();
        g.validate().unwrap();
        assert_eq!(g.input_frame_count(), 32);
        assert_eq!(g.timestamp_count(), 2048);
        assert_eq!(g.d_sample_count(), 1024);
        assert_eq!(g.dd_sample_count(), 8);
        assert_eq!(g.dd_total_count(), 32);
        // 8 ids × (64 KiB samples × 8 bytes + 1024 slots × 32 bytes)
        assert_eq!(g.major_block_size(), 8 * (65536 * 8 + 1024 * 32));
        assert_eq!(g.major_data_start() % DATA_ALIGNMENT as u64, 0);
    }

    #[test]
    fn rejects_misaligned_and_short_geometry() {
        let mut g = geometry();
        g.major_sample_count = 65536 + 64; // not a multiple of D1·D2
        assert!(g.validate().is_err());

        let mut g = geometry();
        g.major_block_count = 2;
        assert!(g.validate().is_err());

        let mut g = geometry();
        g.input_block_size = 1000; // not a whole number of frames
        assert!(g.validate().is_err());

        let mut g = geometry();
        g.archived_id_count = 0;
        assert!(g.validate().is_err());
    }

    #[test]
    fn header_round_trips_through_validation() {
        let g = geometry();
        let mut mask = FilterMask::empty(256).unwrap();
        for id in 0..8 {
            mask.set(id).unwrap();
        }
        let header = g.to_header(&mask);
        let (g2, mask2) = validate_header(&header, g.total_file_size()).unwrap();
        assert_eq!(g2, g);
        assert_eq!(mask2, mask);
    }

    #[test]
    fn validation_rejects_corrupt_headers() {
        let g = geometry();
        let mut mask = FilterMask::empty(256).unwrap();
        mask.set(0).unwrap();
        // Mask popcount no longer matches the derived sizes.
        let mut header = geometry().to_header(&{
            let mut m = FilterMask::empty(256).unwrap();
            for id in 0..8 {
                m.set(id).unwrap();
            }
            m
        });
        header.archive_mask = *mask.as_bytes();
        assert!(validate_header(&header, g.total_file_size()).is_err());

        let mut header = g.to_header(&{
            let mut m = FilterMask::empty(256).unwrap();
            for id in 0..8 {
                m.set(id).unwrap();
            }
            m
        });
        header.magic = *b"NOTANARC";
        assert!(validate_header(&header, g.total_file_size()).is_err());

        let good = g.to_header(&{
            let mut m = FilterMask::empty(256).unwrap();
            for id in 0..8 {
                m.set(id).unwrap();
            }
            m
        });
        assert!(validate_header(&good, 1024).is_err(), "file too small");
    }
}
