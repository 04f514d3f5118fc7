//! # Core Runtime Module
//!
//! Ambient runtime infrastructure shared by the playback crates:
//! - Logging and tracing initialisation
//! - Forwarding of log events to a host [`LoggerSink`](bridge_traits::LoggerSink)
//!
//! ## Overview
//!
//! The playback core only emits `tracing` events; it never installs a
//! subscriber itself. Hosts call [`logging::init_logging`] once at start-up
//! to decide the output format, the filter, and whether events are mirrored
//! into their own logging pipeline.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
