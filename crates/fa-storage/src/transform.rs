//! Block transform: transpose, decimate, index.
//!
//! The transform runs in the consumer thread's context, one ring block at
//! a time. For every data block it transposes the masked columns into the
//! current major buffer, computes the first-stage decimation, feeds the
//! second-stage accumulators, and records the block timestamp for the
//! least-squares index fit. A completed major buffer is handed to the
//! disk writer through a bounded channel and the double buffer swaps.
//!
//! A gap discards all work on the partial major block; completed blocks
//! are unaffected, and the next completed block opens a new archive
//! segment on disk.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use fa_core::{FaEntry, FaError, Result, StatAccumulator, DECIMATED_SLOT_SIZE, FA_ENTRY_SIZE};

use crate::archive::Archive;
use crate::io::AlignedVec;
use crate::layout::DataIndexEntry;

/// Smoothing factor for the header's running duration estimate.
const TIMESTAMP_IIR: f64 = 0.1;

/// A completed major buffer on its way to the disk writer.
pub struct WriteRequest {
    /// Index of the major block this buffer belongs to.
    pub block_index: u32,
    /// The first write after startup or after a gap opens a new archive
    /// segment.
    pub new_segment: bool,
    pub buffer: AlignedVec,
}

/// Per-archive stream processor. Owned by the consumer thread; everything
/// shared sits behind [`Archive`].
pub struct Transform {
    archive: Arc<Archive>,
    writer_tx: Sender<WriteRequest>,
    empty_rx: Receiver<AlignedVec>,
    current: AlignedVec,

    /// Ids archived in this major block, latched at the block's first
    /// frame so a mask update cannot tear a block.
    active_ids: Vec<usize>,
    fa_offset: usize,
    d_offset: usize,

    timestamps: Vec<i64>,
    timestamp_index: usize,
    first_timestamp: u64,
    id_zero: u32,

    dd_accumulators: Vec<StatAccumulator>,
    pending_segment: bool,
}

impl Transform {
    /// Build the transform and its two page-aligned major buffers; one
    /// starts as the assembly target, the other is parked in the empty
    /// channel for the writer to hand back.
    pub fn new(
        archive: Arc<Archive>,
        writer_tx: Sender<WriteRequest>,
        empty_rx: Receiver<AlignedVec>,
        empty_tx: &Sender<AlignedVec>,
    ) -> Self {
        let g = &archive.geometry;
        let current = AlignedVec::zeroed(g.major_block_size());
        empty_tx
            .send(AlignedVec::zeroed(g.major_block_size()))
            .expect("empty buffer channel rejected the initial buffer");
        let archived = g.archived_id_count;
        let timestamp_count = g.timestamp_count();
        Transform {
            current,
            active_ids: Vec::with_capacity(archived),
            fa_offset: 0,
            d_offset: 0,
            timestamps: vec![0; timestamp_count],
            timestamp_index: 0,
            first_timestamp: 0,
            id_zero: 0,
            dd_accumulators: vec![StatAccumulator::new(); archived],
            pending_segment: true,
            archive,
            writer_tx,
            empty_rx,
        }
    }

    /// Process one raw block from the ring buffer.
    pub fn process_block(&mut self, block: &[u8], timestamp: u64) -> Result<()> {
        let g = &self.archive.geometry;
        debug_assert_eq!(block.len(), g.input_block_size);

        if self.fa_offset == 0 {
            self.latch_mask();
        }
        self.index_minor_block(block, timestamp);
        self.transpose_block(block);
        self.decimate_block();

        let must_write = self.advance_block();
        if self.fa_offset % self.archive.geometry.double_decimation() == 0 {
            self.double_decimate();
        }
        if must_write {
            self.complete_major_block()?;
        }
        Ok(())
    }

    /// Handle a gap: discard the partial major block and restart the
    /// second-stage accumulation. The previously completed block is
    /// unaffected.
    pub fn process_gap(&mut self) {
        debug!(
            discarded_samples = self.fa_offset,
            "gap: discarding partial major block"
        );
        self.fa_offset = 0;
        self.d_offset = 0;
        self.timestamp_index = 0;
        for acc in &mut self.dd_accumulators {
            acc.reset();
        }
        let g = &self.archive.geometry;
        let mut cursor = self.archive.lock.lock();
        cursor.dd_offset = cursor.current_major_block * g.dd_sample_count() as u32;
        drop(cursor);
        self.pending_segment = true;
    }

    fn latch_mask(&mut self) {
        let mask = self.archive.mask.read();
        self.active_ids.clear();
        self.active_ids.extend(mask.iter());
        debug_assert_eq!(self.active_ids.len(), self.archive.geometry.archived_id_count);
    }

    fn index_minor_block(&mut self, block: &[u8], timestamp: u64) {
        if self.timestamp_index == 0 {
            self.first_timestamp = timestamp;
            // The hardware's rolling frame counter travels in id 0's x.
            self.id_zero = FaEntry::read_from(&block[..FA_ENTRY_SIZE]).x as u32;
        }
        self.timestamps[self.timestamp_index] =
            timestamp.wrapping_sub(self.first_timestamp) as i64;
        self.timestamp_index += 1;
    }

    /// Copy each archived id's column of the input block into its
    /// contiguous run in the major buffer.
    fn transpose_block(&mut self, block: &[u8]) {
        let g = &self.archive.geometry;
        let frame_size = g.frame_size();
        let frames = g.input_frame_count();
        let buffer = self.current.as_mut_slice();
        for (index, &id) in self.active_ids.iter().enumerate() {
            let base = g.fa_data_offset(index, self.fa_offset);
            let column = &mut buffer[base..base + frames * FA_ENTRY_SIZE];
            for frame in 0..frames {
                let src = frame * frame_size + id * FA_ENTRY_SIZE;
                column[frame * FA_ENTRY_SIZE..(frame + 1) * FA_ENTRY_SIZE]
                    .copy_from_slice(&block[src..src + FA_ENTRY_SIZE]);
            }
        }
    }

    /// First-stage decimation over the freshly transposed columns, also
    /// feeding the per-id double-decimation accumulators.
    fn decimate_block(&mut self) {
        let g = &self.archive.geometry;
        let d1 = g.first_decimation();
        let shift = g.first_decimation_log2;
        let groups = g.input_frame_count() >> shift;
        for index in 0..self.active_ids.len() {
            let column = g.fa_data_offset(index, self.fa_offset);
            for group in 0..groups {
                let mut acc = StatAccumulator::new();
                let start = column + group * d1 * FA_ENTRY_SIZE;
                {
                    let buffer = self.current.as_slice();
                    for sample in 0..d1 {
                        let at = start + sample * FA_ENTRY_SIZE;
                        acc.accumulate(FaEntry::read_from(&buffer[at..at + FA_ENTRY_SIZE]));
                    }
                }
                let slot = acc.finalise(shift);
                let at = g.d_data_offset(index, self.d_offset + group);
                slot.write_to(&mut self.current.as_mut_slice()[at..at + DECIMATED_SLOT_SIZE]);
                self.dd_accumulators[index].merge(&acc);
            }
        }
    }

    fn advance_block(&mut self) -> bool {
        let g = &self.archive.geometry;
        self.fa_offset += g.input_frame_count();
        self.d_offset += g.input_frame_count() >> g.first_decimation_log2;
        self.fa_offset >= g.major_sample_count
    }

    /// Finalise one DD slot per archived id into the ring and advance the
    /// cursor. Runs under the transform lock so readers snapshotting the
    /// ring never observe a torn slot.
    fn double_decimate(&mut self) {
        let g = &self.archive.geometry;
        let shift = g.first_decimation_log2 + g.second_decimation_log2;
        let mut cursor = self.archive.lock.lock();
        let slot = cursor.dd_offset as usize;
        for (index, acc) in self.dd_accumulators.iter_mut().enumerate() {
            self.archive.metadata.set_dd_slot(index, slot, &acc.finalise(shift));
            acc.reset();
        }
        cursor.dd_offset = ((slot + 1) % g.dd_total_count()) as u32;
    }

    /// Hand the full buffer to the disk writer, complete the index entry
    /// and advance the current block pointer.
    fn complete_major_block(&mut self) -> Result<()> {
        let g = &self.archive.geometry;
        let entry = self.fit_index_entry();

        let last = self.archive.last_duration.load(std::sync::atomic::Ordering::Relaxed);
        let smoothed = (f64::from(entry.duration) * TIMESTAMP_IIR
            + f64::from(last) * (1.0 - TIMESTAMP_IIR))
            .round() as u32;
        self.archive
            .last_duration
            .store(smoothed, std::sync::atomic::Ordering::Relaxed);

        // Take the replacement buffer before the lock: the wait for a
        // slow writer must not happen with the transform lock held.
        let fresh = self
            .empty_rx
            .recv()
            .map_err(|_| FaError::Io(writer_gone()))?;
        let filled = std::mem::replace(&mut self.current, fresh);

        let mut cursor = self.archive.lock.lock();
        let block_index = cursor.current_major_block;
        self.archive.metadata.set_index_entry(block_index as usize, &entry);
        self.writer_tx
            .send(WriteRequest {
                block_index,
                new_segment: std::mem::take(&mut self.pending_segment),
                buffer: filled,
            })
            .map_err(|_| FaError::Io(writer_gone()))?;
        cursor.current_major_block = (block_index + 1) % g.major_block_count as u32;
        drop(cursor);

        debug!(
            block_index,
            timestamp = entry.timestamp,
            duration = entry.duration,
            "major block completed"
        );
        self.fa_offset = 0;
        self.d_offset = 0;
        self.timestamp_index = 0;
        Ok(())
    }

    /// Fit `y = a·t + b` through the minor-block timestamps on the
    /// symmetric axis `t_i = 2i − (count−1)`, which makes Σt vanish and
    /// gives closed forms for the block duration and start time. The
    /// encoding of `t` and the closed forms must change together.
    fn fit_index_entry(&self) -> DataIndexEntry {
        let count = self.timestamps.len() as i64;
        debug_assert_eq!(self.timestamp_index as i64, count);
        let mut sum_x: i64 = 0;
        let mut sum_xt: i64 = 0;
        for (i, &x) in self.timestamps.iter().enumerate() {
            let t = 2 * i as i64 - count + 1;
            sum_x += x;
            sum_xt += x * t;
        }
        // sum_t2 = SUM t_i^2 = count(count^2 - 1)/3 by the square-sum
        // formula.
        let sum_t2 = count * (count * count - 1) / 3;
        let duration = 2 * count * sum_xt / sum_t2;
        if !(0..=i64::from(u32::MAX)).contains(&duration) {
            warn!(duration, "implausible fitted block duration");
        }
        let start_delta = sum_x / count - (count + 1) * sum_xt / sum_t2;
        DataIndexEntry {
            timestamp: (self.first_timestamp as i64 + start_delta) as u64,
            duration: duration.clamp(0, i64::from(u32::MAX)) as u32,
            id_zero: self.id_zero,
        }
    }
}

fn writer_gone() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "disk writer stopped")
}
