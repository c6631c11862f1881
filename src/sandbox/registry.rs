// Engine client registry
//
// One engine client per retry policy, created on first use and kept for the
// life of the process. Injected into the manager instead of living in a
// global so tests can hand in their own engine.

use super::docker::DockerEngine;
use super::engine::ContainerEngine;
use super::error::Result;
use crate::config::DockerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Retry behaviour of an engine client for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryPolicy {
    /// Upper bound on retries of any kind.
    pub total: u32,
    /// Retries for failures to reach the engine.
    pub connect: u32,
    /// Retries for failed responses (see `status_forcelist`).
    pub read: u32,
    /// HTTP statuses that count as transient.
    pub status_forcelist: Vec<u16>,
    /// Base of the exponential backoff.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &DockerConfig) -> Self {
        Self {
            total: config.max_total_retries,
            connect: config.max_connect_retries,
            read: config.max_read_retries,
            status_forcelist: vec![500],
            backoff_ms: config.backoff_ms,
        }
    }

    /// Also retry "No such container", which the engine may answer right
    /// after a container has been created.
    pub fn retry_not_found(mut self) -> Self {
        if !self.status_forcelist.contains(&404) {
            self.status_forcelist.insert(0, 404);
        }
        self
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            total: 0,
            connect: 0,
            read: 0,
            status_forcelist: Vec::new(),
            backoff_ms: 0,
        }
    }

    pub fn retries_status(&self, status: u16) -> bool {
        self.status_forcelist.contains(&status)
    }

    /// Sleep before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}

/// Builds an engine client for a retry policy.
pub type EngineFactory = Arc<dyn Fn(&RetryPolicy) -> Result<Arc<dyn ContainerEngine>> + Send + Sync>;

/// Thread-safe lookup-or-create cache of engine clients keyed by retry policy.
pub struct EngineRegistry {
    engines: RwLock<HashMap<RetryPolicy, Arc<dyn ContainerEngine>>>,
    factory: EngineFactory,
}

impl EngineRegistry {
    pub fn new(factory: EngineFactory) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Registry creating [`DockerEngine`] clients from `config`.
    pub fn docker(config: DockerConfig) -> Self {
        let config = Arc::new(config);
        Self::new(Arc::new(move |policy: &RetryPolicy| {
            let engine = DockerEngine::connect(&config, policy.clone())?;
            Ok(Arc::new(engine) as Arc<dyn ContainerEngine>)
        }))
    }

    /// Registry that answers every policy with the same engine.
    pub fn with_engine(engine: Arc<dyn ContainerEngine>) -> Self {
        Self::new(Arc::new(move |_: &RetryPolicy| Ok(engine.clone())))
    }

    /// Get the client for `policy`, creating it on first use.
    pub async fn get(&self, policy: &RetryPolicy) -> Result<Arc<dyn ContainerEngine>> {
        // Fast path: client already created
        {
            let engines = self.engines.read().await;
            if let Some(engine) = engines.get(policy) {
                return Ok(engine.clone());
            }
        }

        // Slow path: create under the write lock so concurrent callers share one client
        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(policy) {
            return Ok(engine.clone());
        }
        debug!(?policy, "Creating engine client");
        let engine = (self.factory)(policy)?;
        engines.insert(policy.clone(), engine.clone());
        Ok(engine)
    }

    /// Number of clients created so far.
    pub async fn len(&self) -> usize {
        self.engines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.engines.read().await.is_empty()
    }
}
