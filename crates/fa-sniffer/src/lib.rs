//! Sniffer data sources.
//!
//! The archiver ingests from anything implementing [`SnifferSource`]:
//! the real character-device sniffer ([`device::DeviceSource`]), the
//! always-failing [`EmptySource`] for read-only archivers, or the
//! deterministic [`simulation::SimulationSource`] used by tests and the
//! daemon's simulate mode.
//!
//! Read failures are not errors to the pipeline; the producer thread in
//! [`thread`] turns them into gap commits and retries after a reset.

pub mod device;
pub mod simulation;
pub mod thread;

use fa_core::{FaError, Result};

pub use device::DeviceSource;
pub use simulation::{SimulationConfig, SimulationSource};
pub use thread::{SnifferConfig, SnifferThread};

/// Hardware status word of the sniffer card, as reported by its
/// status ioctl.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SnifferStatus {
    /// Link status code.
    pub status: i32,
    /// Communication controller partner id.
    pub partner: i32,
    /// Bitmask of the last interrupt cause.
    pub last_interrupt: u32,
    pub frame_errors: i32,
    pub soft_errors: i32,
    pub hard_errors: i32,
    /// Non-zero while the DMA engine runs.
    pub running: i32,
    pub overrun: i32,
}

/// Capability set of a sniffer data source.
///
/// Methods take `&self`: a source must support `interrupt` from another
/// thread while a `read_block` is in flight, which is how the producer
/// thread is unblocked at shutdown.
pub trait SnifferSource: Send + Sync {
    /// Put the source back into a state where reads can succeed.
    fn reset(&self) -> Result<()>;

    /// Fill `block` with frames and return the block's capture
    /// timestamp in µs. A failure of any kind means a gap.
    fn read_block(&self, block: &mut [u8]) -> Result<u64>;

    fn status(&self) -> Result<SnifferStatus>;

    /// Abort an in-flight read.
    fn interrupt(&self) -> Result<()>;
}

/// Source that never delivers data, for archivers serving queries only.
pub struct EmptySource;

impl SnifferSource for EmptySource {
    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn read_block(&self, _block: &mut [u8]) -> Result<u64> {
        Err(FaError::Device("empty sniffer delivers no data".into()))
    }

    fn status(&self) -> Result<SnifferStatus> {
        Err(FaError::Device("no status for empty sniffer".into()))
    }

    fn interrupt(&self) -> Result<()> {
        Ok(())
    }
}
