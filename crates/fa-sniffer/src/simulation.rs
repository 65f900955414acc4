//! Deterministic synthetic sniffer.
//!
//! Generates frames without hardware: id 0 carries the rolling frame
//! counter exactly as the sniffer card does, and the remaining ids carry
//! a small deterministic waveform. Outages can be scripted at frame
//! positions; each scheduled outage fails one read and swallows the
//! configured number of frames, so gap handling can be exercised end to
//! end. Used by the test suites and by `fa-archiver --simulate`.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use fa_core::{FaEntry, FaError, Result, FA_ENTRY_SIZE};

use crate::{SnifferSource, SnifferStatus};

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub entry_count: usize,
    /// Nominal frame spacing, µs (100 at the nominal 10 kHz).
    pub frame_interval_us: u64,
    /// Timestamp of the first frame, µs since epoch.
    pub start_timestamp: u64,
    /// Sleep one block interval per read to mimic the real data rate;
    /// tests leave this off and run flat out.
    pub paced: bool,
    /// Stop delivering after this many frames (every later read fails
    /// as a permanent outage). Tests use this to drive the pipeline to
    /// a known state.
    pub total_frames: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            entry_count: 256,
            frame_interval_us: 100,
            start_timestamp: 1_600_000_000_000_000,
            paced: false,
            total_frames: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outage {
    /// Fails the first read at or after this frame number.
    at_frame: u64,
    /// Frames lost to the outage.
    missed_frames: u64,
}

struct SimulationState {
    frame_counter: u64,
    outages: Vec<Outage>,
}

/// Scriptable synthetic source.
pub struct SimulationSource {
    config: SimulationConfig,
    state: Mutex<SimulationState>,
    interrupted: AtomicBool,
}

impl SimulationSource {
    pub fn new(config: SimulationConfig) -> Self {
        SimulationSource {
            config,
            state: Mutex::new(SimulationState {
                frame_counter: 0,
                outages: Vec::new(),
            }),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Schedule an outage: the first read at or after `at_frame` fails
    /// and `missed_frames` frames are lost.
    pub fn with_outage(self, at_frame: u64, missed_frames: u64) -> Self {
        self.state.lock().outages.push(Outage {
            at_frame,
            missed_frames,
        });
        self
    }

    /// The waveform for one frame: id 0 carries the frame counter, other
    /// ids a position pattern varying with id and frame.
    pub fn entry_for(id: usize, frame: u64) -> FaEntry {
        if id == 0 {
            FaEntry::new(frame as i32, 0)
        } else {
            let phase = (frame % 16) as i32;
            FaEntry::new(id as i32 * 1000 + phase, -(id as i32) * 1000 - phase)
        }
    }
}

impl SnifferSource for SimulationSource {
    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn read_block(&self, block: &mut [u8]) -> Result<u64> {
        if self.interrupted.load(Ordering::Acquire) {
            return Err(FaError::Device("simulation interrupted".into()));
        }
        let frame_size = self.config.entry_count * FA_ENTRY_SIZE;
        debug_assert_eq!(block.len() % frame_size, 0);
        let frames = block.len() / frame_size;

        let mut state = self.state.lock();
        let counter = state.frame_counter;
        if self.config.total_frames.is_some_and(|total| counter >= total) {
            return Err(FaError::Device("simulated source exhausted".into()));
        }
        if let Some(position) = state.outages.iter().position(|o| o.at_frame <= counter) {
            let outage = state.outages.remove(position);
            // Frames keep streaming past the dead receiver: the counter
            // and the clock advance over the hole.
            state.frame_counter += outage.missed_frames;
            return Err(FaError::Device("simulated sniffer outage".into()));
        }

        for frame in 0..frames {
            let counter = state.frame_counter + frame as u64;
            for id in 0..self.config.entry_count {
                Self::entry_for(id, counter)
                    .write_to(&mut block[frame * frame_size + id * FA_ENTRY_SIZE..]);
            }
        }
        state.frame_counter += frames as u64;
        // Block timestamps are captured when the block completes.
        let timestamp =
            self.config.start_timestamp + state.frame_counter * self.config.frame_interval_us;
        drop(state);

        if self.config.paced {
            std::thread::sleep(std::time::Duration::from_micros(
                frames as u64 * self.config.frame_interval_us,
            ));
        }
        Ok(timestamp)
    }

    fn status(&self) -> Result<SnifferStatus> {
        Ok(SnifferStatus {
            running: 1,
            ..SnifferStatus::default()
        })
    }

    fn interrupt(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimulationConfig {
        SimulationConfig {
            entry_count: 16,
            frame_interval_us: 100,
            start_timestamp: 1_000_000,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn frames_are_deterministic_and_counted() {
        let source = SimulationSource::new(config());
        let mut block = vec![0u8; 4 * 16 * FA_ENTRY_SIZE];

        let ts = source.read_block(&mut block).unwrap();
        assert_eq!(ts, 1_000_000 + 4 * 100);

        // Frame 2, id 3.
        let at = 2 * 16 * FA_ENTRY_SIZE + 3 * FA_ENTRY_SIZE;
        let entry = FaEntry::read_from(&block[at..at + FA_ENTRY_SIZE]);
        assert_eq!(entry, FaEntry::new(3002, -3002));
        // Frame counter travels in id 0.
        let id0 = FaEntry::read_from(&block[16 * FA_ENTRY_SIZE..]);
        assert_eq!(id0.x, 1);

        let ts = source.read_block(&mut block).unwrap();
        assert_eq!(ts, 1_000_000 + 8 * 100);
    }

    #[test]
    fn outage_fails_one_read_and_advances_the_clock() {
        let source = SimulationSource::new(config()).with_outage(4, 1000);
        let mut block = vec![0u8; 4 * 16 * FA_ENTRY_SIZE];

        source.read_block(&mut block).unwrap();
        assert!(source.read_block(&mut block).is_err());

        let ts = source.read_block(&mut block).unwrap();
        // 4 good + 1000 missed + 4 good frames.
        assert_eq!(ts, 1_000_000 + 1008 * 100);
        let id0 = FaEntry::read_from(&block[..FA_ENTRY_SIZE]);
        assert_eq!(id0.x, 1004);
    }

    #[test]
    fn interrupt_stops_reads() {
        let source = SimulationSource::new(config());
        let mut block = vec![0u8; 16 * FA_ENTRY_SIZE];
        source.interrupt().unwrap();
        assert!(source.read_block(&mut block).is_err());
    }
}
