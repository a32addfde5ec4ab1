//! Triad - master, user edge and voice edge in one process
//!
//! The three server roles share one pair of I/O thread pools and one stats
//! registry. [`composition::Composition`] wires them together and owns the
//! start/stop ordering.

/// Configuration sections and loading
pub mod config;
/// Termination signals
pub mod core;
/// Process composition root
pub mod composition;
/// tracing setup
pub mod logging;
/// Framing, ACLs and the shared I/O pools
pub mod network;
/// Server roles (master, user_edge, voice_edge)
pub mod servers;
/// Per-role counters
pub mod stats;
