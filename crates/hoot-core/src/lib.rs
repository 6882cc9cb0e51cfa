//! hoot-core — Pure types, wire protocol and annotation parsing.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod annotate;
pub mod protocol;
pub mod types;
