//! Shared plumbing for the FA archiver binaries: logging setup, the
//! optional TOML settings file and POSIX signal handling.

pub mod logging;
pub mod settings;
pub mod signals;
