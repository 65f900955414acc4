//! The real-time producer thread.
//!
//! Pulls a write slot from the ring, fills it from the sniffer source
//! and commits it with the capture timestamp; a failed read commits a
//! gap instead, then the thread sleeps briefly, resets the source and
//! retries. Transitions between delivering data and being in a gap are
//! logged exactly once in each direction so a prolonged outage cannot
//! spam the log.
//!
//! The thread optionally runs with SCHED_FIFO priority 1 so the kernel
//! cannot starve it off the device. Shutdown clears the running flag and
//! interrupts the source to abort a blocked device read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use fa_storage::BlockBuffer;

use crate::SnifferSource;

#[derive(Debug, Clone)]
pub struct SnifferConfig {
    /// Request SCHED_FIFO priority 1 for the producer thread.
    pub boost_priority: bool,
    /// Pause before resetting and retrying after a failed read.
    pub retry_delay: Duration,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        SnifferConfig {
            boost_priority: false,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Handle to the running producer thread.
pub struct SnifferThread {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    source: Arc<dyn SnifferSource>,
}

impl SnifferThread {
    pub fn spawn(
        source: Arc<dyn SnifferSource>,
        buffer: Arc<BlockBuffer>,
        config: SnifferConfig,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_source = Arc::clone(&source);
        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("fa-sniffer".into())
            .spawn(move || producer_loop(thread_source, buffer, config, thread_running))?;
        Ok(SnifferThread {
            handle: Some(handle),
            running,
            source,
        })
    }

    /// The source, for status queries and the halt ioctl.
    pub fn source(&self) -> &Arc<dyn SnifferSource> {
        &self.source
    }

    /// Stop and join: clear the running flag, then interrupt the source
    /// so a blocked device read returns.
    pub fn stop(mut self) {
        info!("waiting for sniffer thread");
        self.running.store(false, Ordering::Release);
        if let Err(err) = self.source.interrupt() {
            warn!(error = %err, "sniffer interrupt failed, join may block on the device");
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("sniffer thread stopped");
    }
}

fn producer_loop(
    source: Arc<dyn SnifferSource>,
    buffer: Arc<BlockBuffer>,
    config: SnifferConfig,
    running: Arc<AtomicBool>,
) {
    if config.boost_priority {
        boost_to_fifo();
    }

    let mut in_gap = false;
    while running.load(Ordering::Acquire) {
        let mut slot = buffer.reserve_write();
        match source.read_block(slot.buffer()) {
            Ok(timestamp) => {
                if buffer.commit_write(slot, false, timestamp) {
                    warn!("ring overflow: a lagging subscriber was skipped");
                }
                if in_gap {
                    info!("block read successfully");
                    in_gap = false;
                }
            }
            Err(err) => {
                buffer.commit_write(slot, true, 0);
                if !in_gap {
                    match source.status() {
                        Ok(status) => {
                            warn!(error = %err, status = ?status, "unable to read block")
                        }
                        Err(_) => warn!(error = %err, "unable to read block"),
                    }
                    in_gap = true;
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(config.retry_delay);
                // Best effort: a failed reset just means the next read
                // fails again and we come back around.
                let _ = source.reset();
            }
        }
    }
}

/// Ask for SCHED_FIFO priority 1; refusal (no real-time privileges) is
/// logged and ignored.
fn boost_to_fifo() {
    let param = libc::sched_param { sched_priority: 1 };
    // SAFETY: plain scheduling-parameter call on the current thread with
    // an initialised sched_param.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc == 0 {
        info!("sniffer thread boosted to SCHED_FIFO priority 1");
    } else {
        error!(
            errno = rc,
            "priority boost requires real time thread support, continuing unboosted"
        );
    }
}
