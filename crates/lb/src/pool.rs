//! Per-cluster backend pool
//!
//! Built once at startup and read-only afterwards; request handling and
//! the health probe only ever read it. Registration order is preserved
//! because the router breaks ties by it.

use crate::backend::Backend;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ServerPool {
    clusters: DashMap<String, Vec<Arc<Backend>>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, cluster_id: impl Into<String>, backend: Arc<Backend>) {
        self.clusters
            .entry(cluster_id.into())
            .or_default()
            .push(backend);
    }

    /// Backends registered for a cluster, in registration order. `None`
    /// for clusters the pool has never heard of.
    pub fn backends(&self, cluster_id: &str) -> Option<Vec<Arc<Backend>>> {
        self.clusters.get(cluster_id).map(|entry| entry.value().clone())
    }

    pub fn size(&self, cluster_id: &str) -> usize {
        self.clusters
            .get(cluster_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        self.clusters.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Every backend in the pool, for the health probe sweep.
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.clusters
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }
}
