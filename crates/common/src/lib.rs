#![deny(missing_docs)]

//! Shared configuration, error types, ids, and memory accounting for tidal crates.
//!
//! Architecture role:
//! - defines compile/runtime configuration passed across layers
//! - provides the common [`TidalError`] / [`Result`] contracts
//! - hosts the byte-accounting memory pool and external-visible id layouts
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]

/// Compile-time planning and placement knobs.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers and external id layouts.
pub mod ids;
/// Memory pool with RAII reservations.
pub mod memory;

pub use config::{num_cpus, CompileConfig};
pub use error::{Result, TidalError};
pub use ids::{SegmentId, CN_SEGMENT_MARKER};
pub use memory::{MemoryPool, PoolReservation};
