//! The closed set of physical backends, in registration order.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{BackendDescriptor, BackendKind};
use crate::storage::backend::ObjectBackend;
use crate::storage::memory::MemoryBackend;
use crate::storage::s3::S3Backend;

/// A backend together with the descriptor it was built from.
#[derive(Clone)]
pub struct RegisteredBackend {
    pub descriptor: BackendDescriptor,
    pub client: Arc<dyn ObjectBackend>,
}

/// Validated, ordered collection of backends.
///
/// Registration order is significant: it breaks placement ties and decides
/// which backend fill-first placement tries first.
pub struct BackendRegistry {
    backends: Vec<RegisteredBackend>,
}

impl BackendRegistry {
    /// Build a registry from already constructed backends.
    pub fn new(backends: Vec<RegisteredBackend>) -> anyhow::Result<Self> {
        if backends.is_empty() {
            anyhow::bail!("at least one backend must be configured");
        }
        for (idx, entry) in backends.iter().enumerate() {
            if entry.descriptor.name != entry.client.name() {
                anyhow::bail!(
                    "backend client {} registered under name {}",
                    entry.client.name(),
                    entry.descriptor.name
                );
            }
            if backends[..idx]
                .iter()
                .any(|other| other.descriptor.name == entry.descriptor.name)
            {
                anyhow::bail!("duplicate backend name: {}", entry.descriptor.name);
            }
        }
        Ok(Self { backends })
    }

    /// Build one client per descriptor.  All HTTP backends share a single
    /// connection pool.
    pub fn from_descriptors(
        descriptors: &[BackendDescriptor],
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        let backends = descriptors
            .iter()
            .map(|descriptor| {
                let client: Arc<dyn ObjectBackend> = match descriptor.kind {
                    BackendKind::S3 => Arc::new(S3Backend::new(descriptor.clone(), http.clone())),
                    BackendKind::Memory => {
                        Arc::new(MemoryBackend::new(&descriptor.name, descriptor.versioned))
                    }
                };
                info!(
                    backend = %descriptor.name,
                    kind = ?descriptor.kind,
                    endpoint = %descriptor.endpoint,
                    listing = ?descriptor.listing,
                    "registered backend"
                );
                RegisteredBackend {
                    descriptor: descriptor.clone(),
                    client,
                }
            })
            .collect();

        Self::new(backends)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredBackend> {
        self.backends.iter().find(|b| b.descriptor.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
