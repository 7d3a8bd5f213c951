//! Backpressure-aware streams: readable, writable, duplex and transform
//! streams plus a pipe orchestrator that wires them together.
//!
//! Every stream is a cloneable handle paired with a driver future that owns
//! the transport primitives. Spawn the driver on any executor through the
//! builders' `spawn`/`spawn_ref`, or take it from `prepare` and poll it
//! yourself. Observers and completions are always delivered by the driver,
//! never from inside the call that caused them.

pub mod platform;
pub mod streams;

pub use streams::*;
