//! The FA archive engine.
//!
//! This crate owns everything between the sniffer's raw frame stream and
//! the wire protocol: the bounded ring buffer the producer writes into,
//! the transform that transposes and decimates each block, the direct-I/O
//! disk writer with its crash-safe header updates, and the indexed query
//! layer.
//!
//! # Architecture
//!
//! ```text
//!   producer thread        consumer thread          disk I/O thread
//!  ┌───────────────┐      ┌───────────────┐       ┌────────────────┐
//!  │ sniffer read  │─ring─▶ Transform     │─full──▶ DiskWriter     │
//!  │               │buffer│  transpose    │ major │  O_DIRECT write│
//!  └───────────────┘      │  decimate ×2  │ block │  header flush  │
//!                         │  index fit    │◀empty─│  segment expiry│
//!                         └──────┬────────┘buffers└────────────────┘
//!                                │ transform lock
//!                         ┌──────▼────────┐
//!                         │ Reader        │  pread + DD snapshot
//!                         └───────────────┘
//! ```
//!
//! All shared state hangs off [`archive::Archive`]; there are no globals.

pub mod archive;
pub mod buffer;
pub mod engine;
pub mod io;
pub mod layout;
pub mod prepare;
pub mod reader;
pub mod transform;
pub mod writer;

pub use archive::{Archive, OpenMode};
pub use buffer::{BlockBuffer, ReadBlock, ReaderHandle};
pub use engine::{Pipeline, PipelineConfig};
pub use layout::{ArchiveGeometry, DiskHeader, DataIndexEntry, SegmentRecord};
pub use reader::{DataClass, ReadFlags, ReadRequest, Reader};
