#![deny(missing_docs)]

//! Inter-CN pipeline transport and node-wide state.
//!
//! Architecture role:
//! - [`server::Server`]: receiver registry + segment-id state, one per CN
//! - [`message`]: the byte-exact pipeline frame format
//! - [`service`]: TCP accept loop and write-path client
//! - [`id_alloc`]: the cluster id seam behind segment allocation
//! - [`ctl`]: label grammar and sync-commit control commands

/// Cluster control commands.
pub mod ctl;
/// Cluster id allocation.
pub mod id_alloc;
/// Pipeline wire messages.
pub mod message;
/// Receiver registry and segment ids.
pub mod server;
/// TCP transport.
pub mod service;

pub use ctl::{handle_sync_commit, parse_cn_label, CnLabel, CommitTsService};
pub use id_alloc::{IdAllocator, LocalIdAllocator};
pub use message::{Cmd, PipelineCodec, PipelineMessage, Sid};
pub use server::Server;
pub use service::{PipelineClient, PipelineService};
