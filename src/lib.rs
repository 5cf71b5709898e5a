//! Cinder turns raw, textual performance-trace dumps into a compact,
//! deduplicated call-stack representation that call-tree and flame-graph
//! tooling can consume cheaply.
//!
//! Two input formats are supported: the output of [`perf script`] on Linux
//! and xperf-style CSV stack dumps on Windows. Both paths produce the same
//! artifact: a time-ordered list of [`StackSourceSample`]s, each pointing
//! into a frozen set of interned frame and call-stack tables
//! ([`StackTable`]). Repeated stack suffixes are stored once, so storage
//! stays sub-linear in the sample count even for long profiling runs.
//!
//! # Example
//!
//! ```no_run
//! use cinder::ingest::{perf, Options};
//!
//! let mut ingester = perf::Ingester::from(Options::default());
//! let profile = ingester.ingest_file("trace.perf.dump")?;
//! for sample in &profile.samples {
//!     let frames = profile.stacks.frames_of(sample.stack);
//!     // walk frames root-to-leaf...
//! }
//! # std::io::Result::Ok(())
//! ```
//!
//! Ingestion is single-threaded by default when thread-time classification
//! is requested, and otherwise fans the parse out across a worker pool that
//! splits the input into sample-aligned sub-streams (see
//! [`Options::nthreads`]).
//!
//!   [`perf script`]: https://linux.die.net/man/1/perf-script
//!   [`StackSourceSample`]: crate::ingest::StackSourceSample
//!   [`StackTable`]: crate::ingest::StackTable
//!   [`Options::nthreads`]: crate::ingest::Options

#![deny(missing_docs)]

/// Trace ingestion for the supported input formats.
///
/// See the [crate-level documentation] for details.
///
///   [crate-level documentation]: ../index.html
pub mod ingest;
