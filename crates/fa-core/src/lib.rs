//! Core types and leaf utilities for the FA archiver.
//!
//! This crate provides the foundational value types shared by every other
//! crate in the workspace: the BPM filter mask with its textual grammar,
//! the 8-byte FA frame entry, the 32-byte decimated statistics slot with
//! its 128-bit variance accumulator, and microsecond epoch timestamps.
//!
//! Nothing in here performs I/O or owns a thread; the heavier machinery
//! lives in `fa-storage` and `fa-sniffer`.

pub mod data;
pub mod error;
pub mod mask;
pub mod timestamp;

pub use data::{FaEntry, DecimatedSlot, StatAccumulator, FA_ENTRY_SIZE, DECIMATED_SLOT_SIZE};
pub use error::{FaError, Result};
pub use mask::FilterMask;
pub use timestamp::{now_micros, MICROS_PER_SEC};
