#![deny(missing_docs)]

//! Scope/instruction execution model and pipeline operators.
//!
//! Architecture role:
//! - [`process::Process`] / [`register::WaitRegister`]: per-query context and
//!   the channel rendezvous between instructions
//! - [`operator::Instruction`] / [`ops`]: the closed operator set
//! - [`scope::Scope`]: one pipeline bound to one CN, with its runners
//! - [`remote`]: the seams toward the cluster transport/registry layer
//!
//! The compiler (tidal-compile) builds scopes; this crate runs them.

/// Per-plan-node execution counters.
pub mod analyze;
/// Pool-accounted batches.
pub mod batch;
/// Instruction-chain driver loop.
pub mod driver;
/// Expression evaluation.
pub mod evaluator;
/// Arrow IPC payload serialization.
pub mod ipc;
/// Pipeline operators.
pub mod ops;
/// Instructions and opcodes.
pub mod operator;
/// Per-query execution context.
pub mod process;
/// Wait registers.
pub mod register;
/// Cluster-layer seams.
pub mod remote;
/// Row keys, hashing, and batch assembly helpers.
pub mod row;
/// Scopes and their runners.
pub mod scope;

pub use analyze::{Analyze, AnalyzeInfo, S3CounterSet};
pub use batch::Batch;
pub use operator::{Instruction, OpCode, OperatorArg};
pub use process::Process;
pub use register::{Received, RegReceiver, RegSender, WaitRegister};
pub use remote::{ReceiverRegistry, RemoteSender, SegmentAllocator};
pub use scope::{DataSource, Magic, NodeInfo, RemoteReceivRegInfo, RunContext, Scope, Source};
