//! TCP stream reassembly and the per-half-stream parser selection harness.
//!
//! The engine turns filtered packets into two per-connection half-streams of
//! in-order bytes; the harness probes registered byte-stream parsers over
//! each half-stream and falls back to raw passthrough when none accepts.

mod engine;
mod harness;
pub mod tls;

pub use engine::{run, Config, Reassembler};
pub use harness::{
    Harness, HalfContext, ParseStatus, ParserFactory, Probe, Registry, StreamParser,
};

/// Errors a stream parser may report mid-message. The harness responds by
/// emitting the parser's held bytes as raw and reprobing.
pub type ParserError = Box<dyn std::error::Error + Send + Sync>;
