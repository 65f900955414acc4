//! Termination signal handling.
//!
//! The daemon blocks SIGINT/SIGTERM before spawning any thread (spawned
//! threads inherit the mask) and then parks the main thread in
//! `sigwait` until one arrives, which keeps shutdown strictly ordered:
//! no handler ever runs concurrently with the pipeline.

use anyhow::bail;

/// Block SIGINT and SIGTERM for this thread and all threads spawned
/// after the call.
pub fn block_termination_signals() -> anyhow::Result<()> {
    // SAFETY: standard sigset manipulation with an initialised set; the
    // mask change only affects signal routing.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            bail!("unable to block termination signals");
        }
    }
    Ok(())
}

/// Park until SIGINT or SIGTERM arrives; returns the signal number.
pub fn wait_for_termination() -> anyhow::Result<i32> {
    // SAFETY: as above; sigwait blocks until one of the set's signals is
    // delivered.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        let mut signal: libc::c_int = 0;
        if libc::sigwait(&set, &mut signal) != 0 {
            bail!("sigwait failed");
        }
        Ok(signal)
    }
}
