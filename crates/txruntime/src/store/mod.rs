//! Repository implementations: an in-process store for tests and the CLI,
//! and a SQL store for deployments that need state to survive restarts.

mod memory;
mod sql;

pub use memory::MemoryStore;
pub use sql::{Dialect, SqlStore};
