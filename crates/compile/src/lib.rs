#![deny(missing_docs)]

//! Plan-to-scope translator, placement planner, and statement runner.
//!
//! Architecture role:
//! - [`Compile`]: per-statement lifecycle (`compile` → `run` → results)
//! - placement helpers assigning block ranges to CNs
//! - join/sort/DML planning policies
//!
//! Scopes compiled here execute on the tidal-pipeline runtime; inter-CN
//! edges go through the tidal-cluster transport.

mod compile;
mod dml;
mod join;
mod placement;
mod scope_list;
mod sort;

pub use compile::Compile;
pub use placement::{temp_table_name, TEMP_DB};
