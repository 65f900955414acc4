//! Indexed query layer.
//!
//! Reads are parameterised by a time range, an id mask and a data class
//! (raw FA, first decimation, double decimation). Block lookup is a
//! cyclic binary search over the data index; every block except the one
//! currently being assembled (plus the two-block safety band behind it)
//! is readable at any time.
//!
//! FA and decimated data stream from the data region with positioned
//! reads on a plain file handle, re-interleaving the transposed per-id
//! columns into frames. Double-decimated data streams from the in-memory
//! ring under the transform lock. A block is re-validated against the
//! index after its data has been read; if the writer overwrote it in the
//! meantime the stream terminates early rather than deliver torn data.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::warn;

use fa_core::{FaError, FilterMask, Result, DECIMATED_SLOT_SIZE, FA_ENTRY_SIZE};

use crate::archive::{Archive, TransformCursor};
use crate::layout::ArchiveGeometry;

/// Blocks immediately after the current one are skipped by the binary
/// search so a read never races the writer overwriting them.
pub const INDEX_SKIP: usize = 2;

/// Largest tolerated discontinuity between consecutive blocks before a
/// gap is reported, in µs.
pub const MAX_DELTA_T: i64 = 1000;

/// Upper bound on the working buffer while streaming.
const READ_CHUNK_BYTES: usize = 1 << 20;

/// What kind of samples a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataClass {
    /// Raw FA entries, 8 bytes per id per sample.
    Fa,
    /// First-stage decimated slots, 32 bytes per id per sample.
    Dec,
    /// Double-decimated slots from the in-memory ring.
    DoubleDec,
}

impl DataClass {
    pub fn slot_size(self) -> usize {
        match self {
            DataClass::Fa => FA_ENTRY_SIZE,
            DataClass::Dec | DataClass::DoubleDec => DECIMATED_SLOT_SIZE,
        }
    }

    pub fn decimation_log2(self, geometry: &ArchiveGeometry) -> u32 {
        match self {
            DataClass::Fa => 0,
            DataClass::Dec => geometry.first_decimation_log2,
            DataClass::DoubleDec => {
                geometry.first_decimation_log2 + geometry.second_decimation_log2
            }
        }
    }

    /// Samples of this class held by one major block.
    pub fn samples_per_block(self, geometry: &ArchiveGeometry) -> usize {
        geometry.major_sample_count >> self.decimation_log2(geometry)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFlags {
    /// Tolerate gaps inside the requested range instead of refusing.
    pub all_data: bool,
    /// Require the hardware frame counter to advance exactly one major
    /// block per block when checking for gaps.
    pub check_id0: bool,
    /// Prefix the stream with the sample count (u64).
    pub send_sample_count: bool,
    /// Prefix the stream with the first sample's timestamp (u64 µs).
    pub send_timestamp: bool,
}

/// How the end of the range is specified.
#[derive(Debug, Clone, Copy)]
pub enum EndSpec {
    /// Inclusive end timestamp, µs since epoch.
    Time(u64),
    /// Number of samples (in the data class's units).
    Samples(u64),
}

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub class: DataClass,
    pub mask: FilterMask,
    /// Start timestamp, µs since epoch.
    pub start_us: u64,
    pub end: EndSpec,
    pub flags: ReadFlags,
}

/// A validated read, ready to stream.
#[derive(Debug)]
pub struct ReadPlan {
    class: DataClass,
    /// Archived plane index per requested id, ascending id order.
    planes: Vec<usize>,
    start_block: usize,
    /// Offset into the first block, in class units.
    start_offset: usize,
    /// Total samples to deliver, in class units.
    pub count: u64,
    /// Timestamp of the first delivered sample.
    pub first_timestamp: u64,
    pub flags: ReadFlags,
}

impl ReadPlan {
    /// Bytes per delivered frame.
    pub fn frame_size(&self) -> usize {
        self.planes.len() * self.class.slot_size()
    }
}

/// Query handle over one archive.
pub struct Reader {
    archive: Arc<Archive>,
    file: Arc<File>,
}

impl Reader {
    pub fn new(archive: Arc<Archive>, file: Arc<File>) -> Self {
        Reader { archive, file }
    }

    /// Timestamp of the oldest readable sample, 0 when the archive has
    /// never been written.
    pub fn earliest_timestamp(&self) -> u64 {
        let cursor = self.archive.lock.lock();
        let block = self.binary_search(&cursor, 1);
        self.archive.metadata.index_entry(block).timestamp
    }

    /// End timestamp of the newest completed block, 0 when empty.
    pub fn latest_timestamp(&self) -> u64 {
        let cursor = self.archive.lock.lock();
        let n = self.archive.geometry.major_block_count;
        let last = (cursor.current_major_block as usize + n - 1) % n;
        let entry = self.archive.metadata.index_entry(last);
        if entry.duration == 0 {
            0
        } else {
            entry.timestamp + u64::from(entry.duration)
        }
    }

    /// Validate a request against the live index.
    ///
    /// Every failure is a protocol error carrying the client-visible
    /// message; nothing has been written to the client yet.
    pub fn prepare(&self, request: &ReadRequest) -> Result<ReadPlan> {
        let g = &self.archive.geometry;
        if request.mask.is_empty() {
            return Err(FaError::protocol("Empty mask"));
        }

        // Map requested ids onto their planes within the major block.
        let planes = {
            let archive_mask = self.archive.mask.read();
            let mut plane_of = vec![usize::MAX; g.fa_entry_count];
            for (plane, id) in archive_mask.iter().enumerate() {
                plane_of[id] = plane;
            }
            let mut planes = Vec::with_capacity(request.mask.count());
            for id in request.mask.iter() {
                if id >= g.fa_entry_count || plane_of[id] == usize::MAX {
                    return Err(FaError::protocol(format!("BPM id {id} is not archived")));
                }
                planes.push(plane_of[id]);
            }
            planes
        };

        let class_ms = request.class.samples_per_block(g);
        let log2 = request.class.decimation_log2(g);

        let cursor = self.archive.lock.lock();
        let n = g.major_block_count;
        let current = cursor.current_major_block as usize;

        let (start_block, start_fa) = self.timestamp_to_block(&cursor, request.start_us, true);
        if start_block == current {
            return Err(FaError::protocol("Start time too late"));
        }
        let start_entry = self.archive.metadata.index_entry(start_block);
        if !request.flags.all_data && start_entry.timestamp > request.start_us {
            return Err(FaError::protocol("Start time in data gap"));
        }
        let start_offset = start_fa >> log2;

        let between = (current + n - start_block) % n;
        let available = (between * class_ms - start_offset) as u64;

        let count = match request.end {
            EndSpec::Samples(0) => return Err(FaError::protocol("No samples requested")),
            EndSpec::Samples(samples) => samples.min(available),
            EndSpec::Time(end_us) => {
                if end_us <= request.start_us {
                    return Err(FaError::protocol("Time range is empty"));
                }
                let (end_block, end_fa) = self.timestamp_to_block(&cursor, end_us, false);
                let end_entry = self.archive.metadata.index_entry(end_block);
                let block_end = end_entry.timestamp + u64::from(end_entry.duration);
                if !request.flags.all_data && end_us > block_end {
                    return Err(FaError::protocol("End timestamp too late"));
                }
                let end_offset = end_fa >> log2;
                let span = ((end_block + n - start_block) % n) as i64 * class_ms as i64
                    + end_offset as i64
                    - start_offset as i64
                    + 1;
                if span <= 0 {
                    return Err(FaError::protocol("Time range is empty"));
                }
                (span as u64).min(available)
            }
        };
        if count == 0 {
            return Err(FaError::protocol("Start time too late"));
        }

        if !request.flags.all_data {
            let covered =
                (start_offset as u64 + count).div_ceil(class_ms as u64) as usize;
            if self.find_gap(start_block, covered, request.flags.check_id0) {
                return Err(FaError::protocol("Data gap in selected range"));
            }
        }

        let first_timestamp = start_entry.timestamp
            + start_fa as u64 * u64::from(start_entry.duration) / g.major_sample_count as u64;

        Ok(ReadPlan {
            class: request.class,
            planes,
            start_block,
            start_offset,
            count,
            first_timestamp,
            flags: request.flags,
        })
    }

    /// Stream the planned samples to `out`, frame by frame.
    ///
    /// The stream ends early (without error) if the writer overwrites a
    /// block mid-read; the client sees a short byte count.
    pub fn stream(&self, plan: &ReadPlan, out: &mut dyn Write) -> Result<()> {
        let g = &self.archive.geometry;
        let n = g.major_block_count;
        let class_ms = plan.class.samples_per_block(g);
        let slot = plan.class.slot_size();
        let ids = plan.planes.len();
        let chunk_samples = (READ_CHUNK_BYTES / (ids * slot)).max(1);

        let mut column = vec![0u8; chunk_samples * slot];
        let mut frames = vec![0u8; chunk_samples * ids * slot];

        let mut remaining = plan.count;
        let mut block = plan.start_block;
        let mut offset = plan.start_offset;
        while remaining > 0 {
            let take = remaining
                .min((class_ms - offset) as u64)
                .min(chunk_samples as u64) as usize;

            let entry = {
                let cursor = self.archive.lock.lock();
                if block == cursor.current_major_block as usize {
                    warn!(block, "read caught up with the writer, ending stream");
                    return Ok(());
                }
                self.archive.metadata.index_entry(block)
            };
            if entry.duration == 0 {
                warn!(block, "read reached an unwritten block, ending stream");
                return Ok(());
            }

            match plan.class {
                DataClass::Fa | DataClass::Dec => {
                    for (k, &plane) in plan.planes.iter().enumerate() {
                        let in_block = match plan.class {
                            DataClass::Fa => g.fa_data_offset(plane, offset),
                            _ => g.d_data_offset(plane, offset),
                        };
                        let position = g.major_data_start()
                            + block as u64 * g.major_block_size() as u64
                            + in_block as u64;
                        self.file
                            .read_exact_at(&mut column[..take * slot], position)?;
                        for sample in 0..take {
                            frames[(sample * ids + k) * slot..][..slot]
                                .copy_from_slice(&column[sample * slot..(sample + 1) * slot]);
                        }
                    }
                }
                DataClass::DoubleDec => {
                    let _cursor = self.archive.lock.lock();
                    let base = block * g.dd_sample_count();
                    for sample in 0..take {
                        for (k, &plane) in plan.planes.iter().enumerate() {
                            let dd =
                                self.archive.metadata.dd_slot(plane, base + offset + sample);
                            dd.write_to(&mut frames[(sample * ids + k) * slot..][..slot]);
                        }
                    }
                }
            }

            // Re-validate: if the index entry changed, the writer lapped
            // us and the bytes just read are torn.
            let after = {
                let _cursor = self.archive.lock.lock();
                self.archive.metadata.index_entry(block)
            };
            if after.timestamp != entry.timestamp || after.duration != entry.duration {
                warn!(block, "block overwritten during read, ending stream");
                return Ok(());
            }

            out.write_all(&frames[..take * ids * slot])?;
            remaining -= take as u64;
            offset += take;
            if offset == class_ms {
                offset = 0;
                block = (block + 1) % n;
            }
        }
        Ok(())
    }

    /// Cyclic binary search over `[current+1+INDEX_SKIP, current)` for
    /// the latest block whose timestamp does not exceed `ts`. The high
    /// block is never inspected, which is as well because the current
    /// block's entry is invalid.
    fn binary_search(&self, cursor: &MutexGuard<'_, TransformCursor>, ts: u64) -> usize {
        let n = self.archive.geometry.major_block_count;
        let current = cursor.current_major_block as usize;
        let mut low = (current + 1 + INDEX_SKIP) % n;
        let high = current;
        let mut high_cursor = high;
        while (low + 1) % n != high_cursor {
            let mid = if low < high_cursor {
                (low + high_cursor) / 2
            } else {
                (low + high_cursor + n) / 2 % n
            };
            if ts < self.archive.metadata.index_entry(mid).timestamp {
                high_cursor = mid;
            } else {
                low = mid;
            }
        }
        // Zero-duration blocks mark the start of the archive; do not
        // land on one.
        if self.archive.metadata.index_entry(low).duration == 0 {
            high_cursor
        } else {
            low
        }
    }

    /// Locate the block and FA-sample offset for a timestamp. With
    /// `skip_gap`, a timestamp falling in the dead time after a block
    /// moves to the start of the next one; otherwise it clamps to the
    /// block's last sample.
    fn timestamp_to_block(
        &self,
        cursor: &MutexGuard<'_, TransformCursor>,
        ts: u64,
        skip_gap: bool,
    ) -> (usize, usize) {
        let g = &self.archive.geometry;
        let block = self.binary_search(cursor, ts);
        let entry = self.archive.metadata.index_entry(block);
        let block_size = g.major_sample_count;
        if entry.duration == 0 || ts < entry.timestamp {
            // Before the earliest block (or an empty archive): start at
            // the block's beginning.
            (block, 0)
        } else if ts - entry.timestamp < u64::from(entry.duration) {
            let offset =
                (ts - entry.timestamp) * block_size as u64 / u64::from(entry.duration);
            (block, offset as usize)
        } else if skip_gap {
            ((block + 1) % g.major_block_count, 0)
        } else {
            (block, block_size - 1)
        }
    }

    /// Walk `blocks` consecutive index entries from `start` and report
    /// whether any adjacent pair disagrees with contiguous capture:
    /// timestamps continuing within ±[`MAX_DELTA_T`], and (with
    /// `check_id0`) the frame counter advancing by exactly one major
    /// block.
    fn find_gap(&self, start: usize, blocks: usize, check_id0: bool) -> bool {
        let g = &self.archive.geometry;
        let mut index = start;
        let mut entry = self.archive.metadata.index_entry(index);
        let mut expected_ts = entry.timestamp + u64::from(entry.duration);
        let mut expected_id0 = entry.id_zero.wrapping_add(g.major_sample_count as u32);
        for _ in 1..blocks {
            index = (index + 1) % g.major_block_count;
            entry = self.archive.metadata.index_entry(index);
            let delta = entry.timestamp as i64 - expected_ts as i64;
            if (check_id0 && entry.id_zero != expected_id0) || delta.abs() > MAX_DELTA_T {
                return true;
            }
            expected_ts = entry.timestamp + u64::from(entry.duration);
            expected_id0 = entry.id_zero.wrapping_add(g.major_sample_count as u32);
        }
        false
    }
}
