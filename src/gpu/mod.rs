//! Accelerated compute detection.
//!
//! - [`device`]: Host and adapter discovery
//! - [`probe`]: Never-failing capability check

pub mod device;
pub mod probe;
