//! Bounded ring buffer between the sniffer and its consumers.
//!
//! A single producer commits fixed-size blocks; any number of readers
//! consume them in commit order. The disk-writer path registers as a
//! *strict* reader: when it falls a whole ring behind, the producer waits
//! for it rather than overwrite unread data. Live subscribers register as
//! non-strict readers and are skipped ahead when they lag, observing a
//! synthetic gap and a backlog report instead of stalling the producer.
//!
//! A `gap` commit publishes no data; readers see it as [`ReadBlock::Gap`]
//! in order, which is how sniffer outages travel down the pipeline.

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Outcome of one read from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBlock {
    /// A data block was copied out; `timestamp` is the producer's capture
    /// timestamp in µs.
    Data { timestamp: u64 },
    /// A gap: either the producer committed one, or this reader was
    /// skipped ahead after lagging.
    Gap,
    /// The buffer (or this reader) has been stopped.
    Shutdown,
}

struct Slot {
    data: Box<[u8]>,
    gap: bool,
    timestamp: u64,
}

struct ReaderState {
    out_seq: u64,
    strict: bool,
    stopped: bool,
    /// A synthetic gap is owed to this reader after a lagging skip.
    pending_skip_gap: bool,
}

struct State {
    slots: Vec<Option<Slot>>,
    /// Sequence number of the next commit; slot `seq` lives at
    /// `seq % block_count`.
    in_seq: u64,
    readers: Vec<Option<ReaderState>>,
    /// A non-strict reader was skipped since the last commit.
    pending_overflow: bool,
    shutdown: bool,
}

/// Handle identifying one registered reader.
#[derive(Debug)]
pub struct ReaderHandle {
    id: usize,
}

/// A reserved producer slot; fill [`WriteSlot::buffer`] then pass the
/// slot back to [`BlockBuffer::commit_write`].
pub struct WriteSlot {
    data: Box<[u8]>,
}

impl WriteSlot {
    pub fn buffer(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Single-producer / multi-consumer ring of equally sized blocks.
pub struct BlockBuffer {
    block_size: usize,
    block_count: usize,
    state: Mutex<State>,
    data_ready: Condvar,
    space_ready: Condvar,
}

impl BlockBuffer {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        assert!(block_size > 0 && block_count >= 2);
        let slots = (0..block_count)
            .map(|_| {
                Some(Slot {
                    data: vec![0u8; block_size].into_boxed_slice(),
                    gap: false,
                    timestamp: 0,
                })
            })
            .collect();
        BlockBuffer {
            block_size,
            block_count,
            state: Mutex::new(State {
                slots,
                in_seq: 0,
                readers: Vec::new(),
                pending_overflow: false,
                shutdown: false,
            }),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Reserve the producer slot.
    ///
    /// Waits while a strict reader still needs the slot about to be
    /// recycled; lagging non-strict readers are skipped ahead instead
    /// and the skip surfaces as overflow on the next commit.
    pub fn reserve_write(&self) -> WriteSlot {
        let mut state = self.state.lock();
        loop {
            let in_seq = state.in_seq;
            let count = self.block_count as u64;
            if state.shutdown || in_seq < count {
                break;
            }
            let recycled_seq = in_seq - count;
            let mut strict_behind = false;
            let mut skipped = false;
            for reader in state.readers.iter_mut().flatten() {
                if reader.stopped || reader.out_seq > recycled_seq {
                    continue;
                }
                if reader.strict {
                    strict_behind = true;
                } else {
                    reader.out_seq = recycled_seq + 1;
                    reader.pending_skip_gap = true;
                    skipped = true;
                }
            }
            if skipped {
                state.pending_overflow = true;
            }
            if !strict_behind {
                break;
            }
            self.space_ready.wait(&mut state);
        }
        let index = (state.in_seq % self.block_count as u64) as usize;
        let slot = state.slots[index].take().expect("producer slot in use");
        WriteSlot { data: slot.data }
    }

    /// Publish a reserved slot. Returns true when a lagging reader was
    /// skipped since the previous commit (overflow: log it, carry on).
    pub fn commit_write(&self, slot: WriteSlot, gap: bool, timestamp: u64) -> bool {
        let mut state = self.state.lock();
        let index = (state.in_seq % self.block_count as u64) as usize;
        debug_assert!(state.slots[index].is_none());
        state.slots[index] = Some(Slot {
            data: slot.data,
            gap,
            timestamp,
        });
        state.in_seq += 1;
        let overflow = std::mem::take(&mut state.pending_overflow);
        drop(state);
        self.data_ready.notify_all();
        overflow
    }

    /// Register a consumer starting at the current head of the stream.
    pub fn open_reader(&self, strict: bool) -> ReaderHandle {
        let mut state = self.state.lock();
        let reader = ReaderState {
            out_seq: state.in_seq,
            strict,
            stopped: false,
            pending_skip_gap: false,
        };
        let id = match state.readers.iter().position(Option::is_none) {
            Some(free) => {
                state.readers[free] = Some(reader);
                free
            }
            None => {
                state.readers.push(Some(reader));
                state.readers.len() - 1
            }
        };
        debug!(id, strict, "ring reader opened");
        ReaderHandle { id }
    }

    /// Fetch the reader's next block without consuming it; call
    /// [`BlockBuffer::release_read`] to advance. Blocks until data,
    /// a gap, or shutdown. Returns the outcome and the reader's backlog
    /// in blocks.
    pub fn get_read(&self, reader: &ReaderHandle, out: &mut Vec<u8>) -> (ReadBlock, usize) {
        let mut state = self.state.lock();
        loop {
            {
                let s = &mut *state;
                let r = s.readers[reader.id].as_mut().expect("reader is closed");
                let backlog = (s.in_seq - r.out_seq) as usize;
                if s.shutdown || r.stopped {
                    return (ReadBlock::Shutdown, backlog);
                }
                if r.pending_skip_gap {
                    return (ReadBlock::Gap, backlog);
                }
                if r.out_seq < s.in_seq {
                    let index = (r.out_seq % self.block_count as u64) as usize;
                    let slot = s.slots[index].as_ref().expect("published slot taken");
                    if slot.gap {
                        return (ReadBlock::Gap, backlog);
                    }
                    out.clear();
                    out.extend_from_slice(&slot.data);
                    return (
                        ReadBlock::Data {
                            timestamp: slot.timestamp,
                        },
                        backlog,
                    );
                }
            }
            self.data_ready.wait(&mut state);
        }
    }

    /// Consume the block last returned by [`BlockBuffer::get_read`].
    pub fn release_read(&self, reader: &ReaderHandle) {
        let mut state = self.state.lock();
        let in_seq = state.in_seq;
        let r = state.readers[reader.id]
            .as_mut()
            .expect("reader is closed");
        if r.pending_skip_gap {
            r.pending_skip_gap = false;
        } else if r.out_seq < in_seq {
            r.out_seq += 1;
        }
        drop(state);
        self.space_ready.notify_all();
    }

    /// Wake one reader with [`ReadBlock::Shutdown`] on its next read.
    pub fn stop_reader(&self, reader: &ReaderHandle) {
        let mut state = self.state.lock();
        if let Some(r) = state.readers[reader.id].as_mut() {
            r.stopped = true;
        }
        drop(state);
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Deregister a reader.
    pub fn close_reader(&self, reader: ReaderHandle) {
        let mut state = self.state.lock();
        state.readers[reader.id] = None;
        drop(state);
        self.space_ready.notify_all();
    }

    /// Stop the whole ring: every blocked reader and the producer wake,
    /// and all subsequent reads return [`ReadBlock::Shutdown`].
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        drop(state);
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn commit_data(buffer: &BlockBuffer, payload: u8, timestamp: u64) -> bool {
        let mut slot = buffer.reserve_write();
        slot.buffer().fill(payload);
        buffer.commit_write(slot, false, timestamp)
    }

    fn commit_gap(buffer: &BlockBuffer) -> bool {
        let slot = buffer.reserve_write();
        buffer.commit_write(slot, true, 0)
    }

    #[test]
    fn delivers_blocks_in_commit_order() {
        let buffer = BlockBuffer::new(16, 4);
        let reader = buffer.open_reader(true);
        for i in 0..3 {
            commit_data(&buffer, i, 1000 + u64::from(i));
        }
        let mut out = Vec::new();
        for i in 0..3u8 {
            let (block, _) = buffer.get_read(&reader, &mut out);
            assert_eq!(
                block,
                ReadBlock::Data {
                    timestamp: 1000 + u64::from(i)
                }
            );
            assert!(out.iter().all(|&b| b == i));
            buffer.release_read(&reader);
        }
    }

    #[test]
    fn gaps_are_materialised_in_order() {
        let buffer = BlockBuffer::new(16, 4);
        let reader = buffer.open_reader(true);
        commit_data(&buffer, 1, 10);
        commit_gap(&buffer);
        commit_data(&buffer, 2, 20);

        let mut out = Vec::new();
        assert_eq!(
            buffer.get_read(&reader, &mut out).0,
            ReadBlock::Data { timestamp: 10 }
        );
        buffer.release_read(&reader);
        assert_eq!(buffer.get_read(&reader, &mut out).0, ReadBlock::Gap);
        buffer.release_read(&reader);
        assert_eq!(
            buffer.get_read(&reader, &mut out).0,
            ReadBlock::Data { timestamp: 20 }
        );
        buffer.release_read(&reader);
    }

    #[test]
    fn get_read_peeks_until_released() {
        let buffer = BlockBuffer::new(16, 4);
        let reader = buffer.open_reader(true);
        commit_data(&buffer, 7, 70);
        let mut out = Vec::new();
        let (first, backlog) = buffer.get_read(&reader, &mut out);
        assert_eq!(first, ReadBlock::Data { timestamp: 70 });
        assert_eq!(backlog, 1);
        let (again, _) = buffer.get_read(&reader, &mut out);
        assert_eq!(again, ReadBlock::Data { timestamp: 70 });
        buffer.release_read(&reader);
    }

    #[test]
    fn lagging_live_reader_is_skipped_with_overflow() {
        let buffer = BlockBuffer::new(16, 2);
        let reader = buffer.open_reader(false);

        assert!(!commit_data(&buffer, 0, 0));
        assert!(!commit_data(&buffer, 1, 1));
        // Third commit recycles slot 0, which the reader never consumed.
        let overflow = commit_data(&buffer, 2, 2);
        assert!(overflow);

        let mut out = Vec::new();
        assert_eq!(buffer.get_read(&reader, &mut out).0, ReadBlock::Gap);
        buffer.release_read(&reader);
        assert_eq!(
            buffer.get_read(&reader, &mut out).0,
            ReadBlock::Data { timestamp: 1 }
        );
        buffer.release_read(&reader);
        assert_eq!(
            buffer.get_read(&reader, &mut out).0,
            ReadBlock::Data { timestamp: 2 }
        );
    }

    #[test]
    fn strict_reader_back_pressures_producer() {
        let buffer = Arc::new(BlockBuffer::new(16, 2));
        let reader = buffer.open_reader(true);
        commit_data(&buffer, 0, 0);
        commit_data(&buffer, 1, 1);

        // The next reserve must wait until the strict reader releases a
        // block.
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || commit_data(&buffer, 2, 2))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished(), "producer should be blocked");

        let mut out = Vec::new();
        assert_eq!(
            buffer.get_read(&reader, &mut out).0,
            ReadBlock::Data { timestamp: 0 }
        );
        buffer.release_read(&reader);
        assert!(!producer.join().unwrap(), "no overflow for strict reader");
    }

    #[test]
    fn stop_wakes_blocked_reader() {
        let buffer = Arc::new(BlockBuffer::new(16, 4));
        let reader = buffer.open_reader(true);
        let waiter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut out = Vec::new();
                buffer.get_read(&reader, &mut out).0
            })
        };
        thread::sleep(Duration::from_millis(20));
        buffer.stop();
        assert_eq!(waiter.join().unwrap(), ReadBlock::Shutdown);
    }

    #[test]
    fn stop_reader_releases_one_consumer() {
        let buffer = Arc::new(BlockBuffer::new(16, 4));
        let stopped = buffer.open_reader(true);
        let live = buffer.open_reader(false);
        commit_data(&buffer, 1, 1);

        buffer.stop_reader(&stopped);
        let mut out = Vec::new();
        assert_eq!(buffer.get_read(&stopped, &mut out).0, ReadBlock::Shutdown);
        // Other readers are unaffected.
        assert_eq!(
            buffer.get_read(&live, &mut out).0,
            ReadBlock::Data { timestamp: 1 }
        );
        buffer.close_reader(stopped);

        // A stopped strict reader no longer back-pressures the producer.
        for i in 0..8 {
            commit_data(&buffer, i, u64::from(i));
        }
    }

    #[test]
    fn producer_without_readers_never_blocks() {
        let buffer = BlockBuffer::new(16, 2);
        for i in 0..10 {
            commit_data(&buffer, i, u64::from(i));
        }
    }

    #[test]
    fn backlog_is_reported() {
        let buffer = BlockBuffer::new(16, 8);
        let reader = buffer.open_reader(true);
        for i in 0..5 {
            commit_data(&buffer, i, u64::from(i));
        }
        let mut out = Vec::new();
        let (_, backlog) = buffer.get_read(&reader, &mut out);
        assert_eq!(backlog, 5);
    }
}
