//! Retention-aware backend selection
//!
//! A backend is eligible for a query when it is alive and its retention
//! horizon strictly covers the query window. Among eligible backends the
//! shortest sufficient retention wins; the hot tier is the fastest and
//! cheapest place a query can be answered. Within a tier the router
//! spreads load by least connections, ties broken by registration order.

use crate::backend::Backend;
use crate::pool::ServerPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Clone)]
pub struct RetentionRouter {
    pool: Arc<ServerPool>,
}

impl RetentionRouter {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self { pool }
    }

    /// Pick the backend for a query reaching `query_window` into the past.
    pub fn target(&self, cluster_id: &str, query_window: Duration) -> Option<Arc<Backend>> {
        self.target_excluding(cluster_id, query_window, &[])
    }

    /// As [`target`](Self::target), skipping backends a previous attempt
    /// already failed on.
    pub fn target_excluding(
        &self,
        cluster_id: &str,
        query_window: Duration,
        exclude: &[Arc<Backend>],
    ) -> Option<Arc<Backend>> {
        let Some(backends) = self.pool.backends(cluster_id) else {
            // Requests for unconfigured clusters point at a deployment
            // problem, not a transient state.
            error!(cluster_id, "no backends configured for cluster");
            return None;
        };

        let eligible: Vec<Arc<Backend>> = backends
            .into_iter()
            .filter(|b| {
                b.is_alive()
                    && query_window < b.retention_period()
                    && !exclude.iter().any(|tried| Arc::ptr_eq(tried, b))
            })
            .collect();

        if eligible.is_empty() {
            debug!(
                cluster_id,
                query_window_secs = query_window.as_secs(),
                "no eligible backend for query window"
            );
            return None;
        }
        if eligible.len() == 1 {
            return eligible.into_iter().next();
        }

        let min_retention = eligible.iter().map(|b| b.retention_period()).min()?;

        // min_by_key keeps the first of equal elements, which is the
        // earliest-registered backend.
        eligible
            .into_iter()
            .filter(|b| b.retention_period() == min_retention)
            .min_by_key(|b| b.active_connections())
    }
}
