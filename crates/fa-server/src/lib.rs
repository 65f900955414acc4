//! TCP wire protocol frontend.
//!
//! Requests are a single ASCII line; responses are binary. A read
//! response opens with a NUL byte followed by the optional sample-count
//! and timestamp prefixes and the sample stream; any failure before the
//! first byte of data is a one-line printable error message instead.
//!
//! ```text
//! S                                server info (text line)
//! R<class><mask><options>S<start>ES<end>      ranged read
//! R<class><mask><options>S<start>N<count>     counted read
//! M<mask>                          privileged mask update
//! ```

pub mod protocol;
pub mod server;

pub use protocol::{parse_request, Request};
pub use server::{Server, ServerConfig};
