//! Workspace facade crate.
//!
//! Re-exports the member crates so a host application can depend on
//! `audio-engine-workspace` and pick decoders and logging through feature
//! flags instead of wiring each crate individually.

pub use bridge_traits;
pub use core_playback;

#[cfg(feature = "logging")]
pub use core_runtime;
