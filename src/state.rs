// src/state.rs

use crate::clock::{SharedClock, SystemClock};
use crate::config::AppConfig;
use crate::error::Result;
use crate::key_manager::KeyManager;
use crate::storage::{self, KeyPersistence};
use crate::upstream::{HttpUpstream, UpstreamClient};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared state handed to every axum handler.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub key_manager: Arc<KeyManager>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wires the production collaborators: reqwest upstream, configured
    /// persistence backend and the system clock. The manager is not started.
    pub fn new(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpUpstream::new(
            &config.upstream,
            Duration::from_secs(config.server.connect_timeout_secs),
            Duration::from_secs(config.server.request_timeout_secs),
        )?);
        let persistence = storage::from_config(&config.storage)?;
        info!(
            upstream = %config.upstream.base_url,
            backend = persistence.backend_name(),
            "Creating shared AppState"
        );
        Ok(Self::with_collaborators(
            config,
            upstream,
            persistence,
            Arc::new(SystemClock),
        ))
    }

    pub fn with_collaborators(
        config: Arc<AppConfig>,
        upstream: Arc<dyn UpstreamClient>,
        persistence: Arc<dyn KeyPersistence>,
        clock: SharedClock,
    ) -> Self {
        let key_manager = Arc::new(KeyManager::new(Arc::clone(&config), upstream, persistence, clock));
        Self {
            config,
            key_manager,
            metrics: crate::metrics::init(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("key_manager", &self.key_manager)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}
