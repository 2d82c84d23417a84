//! basalt-metalog: crash-safe metadata journal for the basalt LSM engine.
//!
//! Data in the engine is organized in ranges and runs: runs are immutable
//! sorted files on disk, ranges group runs over a key interval, indexes
//! own ranges. Structural changes often touch several of them at once
//! (a compaction replaces a set of runs with one), so every change is
//! logged as a record in an append-only metadata journal and replayed on
//! restart to rebuild a consistent picture of the tree.
//!
//! # Architecture
//!
//! ```text
//! mutators → MetaLog (tx buffer) → commit → xlog (framed file, fsync)
//!                                                 ↓ restart
//!                              Recovery (index/range/run tables)
//!                                                 ↓
//!                              rotate → compacted journal at new signature
//! ```
//!
//! # Modules
//!
//! - `record`: structural change records and their wire codec
//! - `xlog`: framed, checksummed append-only journal files
//! - `writer`: the transactional [`MetaLog`] writer and id allocators
//! - `recovery`: journal replay into the in-memory [`Recovery`] model
//! - `rotate`: journal compaction onto a new signature
//! - `gc`: collection of superseded journal files
//! - `config`: embedder-facing configuration
//! - `logging`: optional `tracing` subscriber setup
//!
//! Every operation that touches the file system is async and may yield;
//! staging records in a transaction is pure in-memory work and never
//! suspends.
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod gc;
pub mod logging;
pub mod record;
pub mod recovery;
mod rotate;
pub mod writer;
pub mod xlog;

pub use config::MetaLogConfig;
pub use error::{Error, Result};
pub use record::{Record, RecordType};
pub use recovery::{IndexInfo, RangeInfo, Recovery, RunInfo};
pub use writer::{MetaLog, TX_BUF_CAPACITY};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
