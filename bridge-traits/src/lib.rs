//! # Host Bridge Traits
//!
//! Contracts between the playback core and the host that embeds it.
//!
//! ## Overview
//!
//! The core never opens files or sockets itself, and never installs a global
//! logger. Everything it needs from the outside world is expressed here as a
//! trait the host implements (or one of the provided adapters):
//!
//! ### I/O
//! - [`ByteSource`](io::ByteSource) - Raw encoded bytes for a decoder: read,
//!   seek, and an optional total length
//! - [`FileSource`](io::FileSource) - `ByteSource` over a local file
//! - [`MemorySource`](io::MemorySource) - `ByteSource` over an in-memory
//!   [`Bytes`](bytes::Bytes) buffer
//!
//! ### Logging
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Host
//! implementations should convert platform errors into it and keep the
//! message actionable (include the path or the offending offset).
//!
//! ## Thread Safety
//!
//! Byte sources are owned by exactly one decoder and therefore only need
//! `Send`. Logger sinks are shared across threads and require `Send + Sync`.

pub mod error;
pub mod io;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use io::{ByteSource, FileSource, MemorySource, StreamSource};
pub use time::{ConsoleLogger, LogEntry, LogLevel, LoggerSink};
