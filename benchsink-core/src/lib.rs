//! benchsink-core is an output that consumes messages from an upstream queue one at a time, derives
//! a record from each message, forwards the record to a reporter and acknowledges the message back
//! to the producer. It can be stopped from any task without losing track of its resources.
//!
//! The benchmark flavour ([bench::BenchOutput]) measures the latency of timestamped messages and
//! periodically logs throughput and latency percentiles.

pub use crate::error::{Error, Result};

mod error;

/// Configuration of an output, loaded from environment variables.
pub mod config;

pub mod message;

/// Traits at the boundary of the output: record derivation and reporting.
pub mod measure;

/// The lifecycle controller and the consume loop.
pub mod output;

/// Benchmark records and the periodic benchmark reporter.
pub mod bench;

/// Prometheus metrics of the output and the HTTP endpoint exposing them.
pub mod metrics;
