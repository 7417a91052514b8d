//! Upload placement: pick the backend that receives a new object.
//!
//! Placement is stateless.  Usage is recomputed from the index on every
//! call by summing entry sizes per backend.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::index::ClusterIndex;
use crate::storage::registry::BackendRegistry;

/// How a backend is chosen among those with room for the upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategy {
    /// First backend with room, in registration order.
    #[default]
    FillFirst,
    /// Backend with the least usage; ties go to registration order.
    Balanced,
}

/// Placement strategy plus the default per-backend ceiling.
#[derive(Debug, Clone, Copy)]
pub struct PlacementPolicy {
    pub strategy: PlacementStrategy,
    pub capacity_bytes: u64,
}

/// Usage of one backend as seen by the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct BackendUsage {
    pub name: String,
    pub used_bytes: u64,
    pub objects: u64,
    pub capacity_bytes: u64,
}

/// Usage of every registered backend, in registration order.  Backends
/// holding no objects report zero.  Index entries naming an unregistered
/// backend are ignored.
pub fn backend_usage(
    registry: &BackendRegistry,
    index: &ClusterIndex,
    policy: &PlacementPolicy,
) -> Vec<BackendUsage> {
    let mut usage: Vec<BackendUsage> = registry
        .iter()
        .map(|b| BackendUsage {
            name: b.descriptor.name.clone(),
            used_bytes: 0,
            objects: 0,
            capacity_bytes: b.descriptor.capacity_bytes.unwrap_or(policy.capacity_bytes),
        })
        .collect();

    for location in index.values() {
        if let Some(slot) = usage.iter_mut().find(|u| u.name == location.backend) {
            slot.used_bytes = slot.used_bytes.saturating_add(location.size);
            slot.objects += 1;
        }
    }
    usage
}

/// Choose a backend for an upload of `size` bytes, or `None` when no
/// backend satisfies `used + size < capacity`.
pub fn select_backend(usage: &[BackendUsage], size: u64, strategy: PlacementStrategy) -> Option<&str> {
    let mut candidates = usage.iter().filter(|u| {
        u.used_bytes
            .checked_add(size)
            .is_some_and(|total| total < u.capacity_bytes)
    });

    let chosen = match strategy {
        PlacementStrategy::FillFirst => candidates.next(),
        // min_by_key keeps the first of equal minima, preserving registration order.
        PlacementStrategy::Balanced => candidates.min_by_key(|u| u.used_bytes),
    };
    chosen.map(|u| u.name.as_str())
}
