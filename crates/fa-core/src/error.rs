//! Error types shared across the archiver.
//!
//! `FaError` consolidates the recoverable error categories of the system.
//! Following the taxonomy in the error-handling design, recoverable
//! conditions (sniffer read failures, ring overflow) are *not* errors at
//! all — they are gap events carried through the data path — so the
//! variants here cover validation, protocol and I/O failures only.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FaError>;

#[derive(Error, Debug)]
pub enum FaError {
    /// Underlying file or socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Filter mask text did not match the mask grammar.
    #[error("invalid mask: {0}")]
    Mask(String),

    /// Archive header failed validation on open.
    ///
    /// Mismatched magic, unsupported version or impossible geometry.
    /// Always fatal for the daemon: the file is not an archive we can
    /// safely write to.
    #[error("invalid archive header: {0}")]
    Header(String),

    /// Requested archive geometry is not self-consistent.
    #[error("invalid archive geometry: {0}")]
    Geometry(String),

    /// Client request did not parse or cannot be served.
    ///
    /// The message text is sent verbatim as the protocol error line, so
    /// variants of this error use the exact wording clients match on.
    #[error("{0}")]
    Protocol(String),

    /// Sniffer device rejected an operation.
    #[error("sniffer device error: {0}")]
    Device(String),
}

impl FaError {
    /// Shorthand for a protocol error with the given client-visible text.
    pub fn protocol(msg: impl Into<String>) -> Self {
        FaError::Protocol(msg.into())
    }
}
