//! Push/pull streams with queuing strategies, exclusive readers and writers,
//! BYOB byte reads, transform pairs, piping and native byte source adapters.
//!
//! Every stream is split into a handle and a driver future. The driver owns the
//! user supplied source or sink and must be spawned on an executor, either by
//! hand after `prepare()` or through a builder's `spawn(...)`.

pub mod platform;
pub mod streams;

pub use streams::*;
