//! Storage module
//!
//! The key-value storage port and the typed records kept in it.

pub mod backend;
pub mod records;

pub use backend::{JsonFileStore, KeyValueStore, MemoryStore};
pub use records::Records;
