//! Backends behind the collaborator traits. Only the in-process one ships;
//! hosted backends implement the same traits outside this crate.

mod memory;
mod seed;

pub use memory::{CallCounts, MemoryBackend};
pub use seed::{MemorySeed, SeedUser};
