//! Open-loop latency harness for a UDP key-value service.
//!
//! The client side paces GET/PUT requests along a Poisson arrival process,
//! collects round-trip latencies and sweeps the target rate upward one trial
//! at a time. The server side is a stateless router in front of a key-value
//! backend that echoes the client's timing metadata.

pub mod clock;
pub mod collector;
pub mod config;
pub mod distribution;
pub mod generator;
pub mod logging;
pub mod record;
pub mod router;
pub mod sink;
pub mod stats;
pub mod sweep;
pub mod transport;
pub mod trial;

pub const NS_PER_SEC: u64 = 1_000_000_000;

/// Largest datagram either side will read; anything longer than a record is
/// rejected by the decoder.
pub const KBUFSIZE: usize = 2048;
