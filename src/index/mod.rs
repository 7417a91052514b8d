//! Location index persistence.
//!
//! The [`store::IndexStore`] trait is the durable home of the cluster
//! index between requests; [`sqlite::SqliteIndexStore`] is the default
//! implementation and [`memory::MemoryIndexStore`] serves tests and
//! single-process demos.

pub mod memory;
pub mod sqlite;
pub mod store;

pub use store::{ClusterIndex, IndexStore, ObjectLocation};
