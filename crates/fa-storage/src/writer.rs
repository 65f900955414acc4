//! Disk writer thread.
//!
//! Owns the archive's write handle (opened with `O_DIRECT` in
//! production), drains completed major buffers from the transform, and
//! maintains the on-disk header: the directory of contiguous archive
//! segments, the expiry of segments overwritten by the circular data
//! region, and the once-per-second locked header flush.
//!
//! Disk write failures are fatal: the thread logs and returns the error,
//! which the pipeline surfaces on join.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use fa_core::timestamp::now_seconds;
use fa_core::{FaError, Result};

use crate::archive::Archive;
use crate::io::AlignedVec;
use crate::layout::{DiskHeader, SegmentRecord, DISK_HEADER_SIZE, MAX_HEADER_BLOCKS};
use crate::transform::WriteRequest;

/// Drain major blocks until the transform drops its sender, then write
/// the clean-shutdown header.
pub fn run(
    archive: Arc<Archive>,
    file: File,
    requests: Receiver<WriteRequest>,
    empties: Sender<AlignedVec>,
    ring_block_count: u32,
) -> Result<()> {
    let mut writer = DiskWriter::new(&archive, file, ring_block_count);
    info!(
        resume_offset = writer.write_offset,
        segments = writer.header.block_count,
        "disk writer started"
    );
    while let Ok(request) = requests.recv() {
        if let Err(err) = writer.handle(request, &empties) {
            error!(error = %err, "archive write failed, stopping writer");
            return Err(err);
        }
    }
    writer.finalise()?;
    info!("disk writer stopped");
    Ok(())
}

struct DiskWriter<'a> {
    archive: &'a Archive,
    file: File,
    /// Private header copy, published to the mmap under the fcntl lock.
    header: DiskHeader,
    /// Byte offset into the data region where the next block lands.
    write_offset: i64,
    /// Offset at the previous expiry pass; the half-open interval
    /// `(old_write_offset, write_offset]` modulo wrap is what has just
    /// been overwritten.
    old_write_offset: i64,
    /// Bytes written into the active segment; once this reaches
    /// `data_size` the segment has lapped itself and its start must
    /// chase the write cursor.
    segment_bytes: u64,
}

impl<'a> DiskWriter<'a> {
    fn new(archive: &'a Archive, file: File, ring_block_count: u32) -> Self {
        let mut header = archive.metadata.read_header();
        let write_offset = if header.block_count > 0 {
            header.segments[0].stop_offset
        } else {
            0
        };
        header.write_buffer = ring_block_count;
        DiskWriter {
            archive,
            file,
            header,
            write_offset,
            old_write_offset: write_offset,
            // Resuming an old segment: treat it as possibly lapped so a
            // stale start never survives past the first wrap.
            segment_bytes: 0,
        }
    }

    fn handle(&mut self, request: WriteRequest, empties: &Sender<AlignedVec>) -> Result<()> {
        if request.new_segment {
            // Seal the previous segment, push the stack, and publish the
            // new segment eagerly.
            if self.header.block_count > 0 {
                self.update_header(true)?;
            }
            self.start_archive_block();
            self.update_header(true)?;
        }

        let offset = i64::from(request.block_index) * self.header.major_block_size as i64;
        debug_assert_eq!(offset, self.write_offset);
        self.file
            .write_all_at(request.buffer.as_slice(), self.header.data_start + offset as u64)?;
        self.write_offset =
            (offset + self.header.major_block_size as i64) % self.header.data_size as i64;
        self.segment_bytes += self.header.major_block_size;
        debug!(
            block_index = request.block_index,
            write_offset = self.write_offset,
            "major block written"
        );

        // Hand the buffer back for the next double-buffer swap; if the
        // transform is already gone we are shutting down anyway.
        let _ = empties.send(request.buffer);

        self.update_header(false)
    }

    fn finalise(&mut self) -> Result<()> {
        self.header.disk_status = 0;
        self.update_header(true)
    }

    /// Does `offset` lie in the half-open interval
    /// `(old_write_offset, write_offset]`, modulo wrap?
    fn expired(&self, offset: i64) -> bool {
        if self.write_offset >= self.old_write_offset {
            self.old_write_offset < offset && offset <= self.write_offset
        } else {
            offset <= self.write_offset || self.old_write_offset < offset
        }
    }

    /// Drop segments wholly overwritten since the last pass and pull the
    /// oldest segment's start forward when its head has been consumed.
    fn expire_archive_blocks(&mut self) {
        while self.header.block_count > 1
            && self.expired(self.header.segments[self.header.block_count as usize - 1].stop_offset)
        {
            self.header.block_count -= 1;
            warn!(
                remaining = self.header.block_count,
                "oldest archive segment expired"
            );
        }
        // When the oldest surviving segment is the one still being
        // written, its start only chases the cursor once it has wrapped
        // onto itself; a fresh segment's start coincides with the cursor
        // without having been overwritten.
        let lapped =
            self.header.block_count > 1 || self.segment_bytes >= self.header.data_size;
        let oldest = self.header.block_count as usize - 1;
        let old_start = self.header.segments[oldest].start_offset;
        if lapped && (self.expired(old_start) || old_start == self.old_write_offset) {
            self.header.segments[oldest].start_offset = self.write_offset;
        }
        self.old_write_offset = self.write_offset;
    }

    /// Push the segment stack down and open a new segment at the write
    /// cursor.
    fn start_archive_block(&mut self) {
        self.header.segments.copy_within(0..MAX_HEADER_BLOCKS - 1, 1);
        self.header.block_count = (self.header.block_count + 1).min(MAX_HEADER_BLOCKS as u32);
        let now = now_seconds();
        self.header.segments[0] = SegmentRecord {
            start_sec: now,
            stop_sec: now,
            start_offset: self.write_offset,
            stop_offset: -1, // overwritten by the first flush
        };
        self.header.disk_status = 1;
        info!(
            segments = self.header.block_count,
            start_offset = self.write_offset,
            "new archive segment"
        );
    }

    /// Refresh the mutable header fields and publish, at most once per
    /// wall-clock second unless forced.
    fn update_header(&mut self, force: bool) -> Result<()> {
        if self.header.block_count > 0 {
            self.expire_archive_blocks();
        }
        let now = now_seconds();
        if !(force || now != self.header.segments[0].stop_sec) {
            return Ok(());
        }
        self.header.write_backlog = self.archive.write_backlog.swap(0, Ordering::Relaxed);
        self.header.last_duration = self.archive.last_duration.load(Ordering::Relaxed);
        self.header.current_major_block = self.archive.lock.lock().current_major_block;
        self.header.archive_mask = *self.archive.mask.read().as_bytes();
        if self.header.block_count > 0 {
            self.header.segments[0].stop_sec = now;
            self.header.segments[0].stop_offset = self.write_offset;
        }
        self.write_header()
    }

    /// Copy the header into the mapping under an fcntl write lock over
    /// the header range and schedule write-back. External readers (the
    /// prepare tool) take the same lock, so they never observe a torn
    /// header.
    fn write_header(&self) -> Result<()> {
        lock_header_range(&self.file, true)?;
        self.archive.metadata.write_header(&self.header);
        let flushed = self.archive.metadata.flush_async();
        lock_header_range(&self.file, false)?;
        flushed
    }
}

fn lock_header_range(file: &File, exclusive: bool) -> Result<()> {
    // SAFETY: plain fcntl record-lock call on an owned, open descriptor;
    // the flock struct is fully initialised.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = if exclusive {
        libc::F_WRLCK as libc::c_short
    } else {
        libc::F_UNLCK as libc::c_short
    };
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = 0;
    lock.l_len = DISK_HEADER_SIZE as libc::off_t;
    let command = if exclusive { libc::F_SETLKW } else { libc::F_SETLK };
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), command, &lock) };
    if rc < 0 {
        return Err(FaError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}
