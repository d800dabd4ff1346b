//! The two storage tiers behind the engine.
//!
//! - `MemoryStore`: the live entries of this context, the only in-process owner
//! - `PersistentStore`: their serialized mirror in shared storage, written
//!   through on every memory write and read back after a restart

pub mod memory;
pub mod persistent;

pub use memory::{MemoryStore, Written};
pub use persistent::PersistentStore;
