//! Cluster index management.
//!
//! The cluster index maps every virtual key to the backend that holds it.
//! [`manager::ClusterManager`] owns the backend registry and the index
//! store; each request works through a [`manager::ClusterSession`] that
//! memoizes the loaded index for the life of that request.

pub mod listing;
pub mod manager;
pub mod placement;
pub mod rebuild;

use crate::storage::backend::BackendError;

/// Errors raised by cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// No backend has room for an upload of `size` bytes.
    #[error("no backend can hold {size} more bytes")]
    CapacityExhausted { size: u64 },

    /// The index names a backend that is not registered.
    #[error("backend {0} is not registered")]
    UnknownBackend(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The index store failed.
    #[error("index store: {0}")]
    Store(#[from] anyhow::Error),
}

pub use manager::{ClusterManager, ClusterSession};
