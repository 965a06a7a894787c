//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use parley_core::config::Config;

use crate::turn::Pipeline;

/// Which endpoint a session was opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Agent,
    Echo,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Echo => "echo",
        }
    }
}

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Per-connection bookkeeping for `/health`.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub conn_id: String,
    pub mode: SessionMode,
    pub connected_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            config,
            pipeline,
            connections: RwLock::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub async fn register(&self, conn_id: &str, mode: SessionMode) {
        let mut connections = self.connections.write().await;
        connections.insert(
            conn_id.to_string(),
            ConnectionState {
                conn_id: conn_id.to_string(),
                mode,
                connected_at: Utc::now(),
            },
        );
    }

    pub async fn unregister(&self, conn_id: &str) -> Option<ConnectionState> {
        self.connections.write().await.remove(conn_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Open sessions per mode, for `/health`.
    pub async fn mode_counts(&self) -> HashMap<SessionMode, usize> {
        let mut counts = HashMap::new();
        for conn in self.connections.read().await.values() {
            *counts.entry(conn.mode).or_insert(0) += 1;
        }
        counts
    }
}
