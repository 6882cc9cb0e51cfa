//! hoot-lib — Owl engine.
//!
//! Serial link, gesture primitives, speech/movement sequencing, event bus and
//! HTTP API. Depends on hoot-core for pure types and parsing.

pub mod annotator;
pub mod error;
pub mod events;
pub mod link;
pub mod motion;
pub mod sequencer;
pub mod serial;
pub mod server;
pub mod speech;

#[cfg(test)]
mod testing;

// Re-export hoot-core for convenience
pub use hoot_core;
