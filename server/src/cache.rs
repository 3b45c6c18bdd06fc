//! Shared cache and pub/sub handle.
//!
//! The cache is the only state shared between HTTP replicas and load
//! workers. The connection is a process-wide singleton that initializes
//! lazily; a failed init is never cached, the next request simply retries.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{error, info};

use data_portal_core::{LoadStatus, PortalMessage, PORTAL_CHANNEL};

use crate::config::ServerConfig;
use crate::error::ApiError;

/// Services that need the cache; when none of them is enabled, the cache
/// refuses to connect so misconfigured requests fail loudly.
const CACHING_SERVICES: [&str; 1] = ["zarr-stream"];

#[derive(Clone)]
pub struct Cache {
    config: Arc<ServerConfig>,
    inner: Arc<Mutex<Option<ConnectionManager>>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Cache {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config, inner: Arc::new(Mutex::new(None)) }
    }

    /// Get or create the shared connection.
    pub async fn connection(&self) -> Result<ConnectionManager, ApiError> {
        let services = self.config.services();
        if !CACHING_SERVICES.iter().any(|s| services.contains(*s)) {
            return Err(ApiError::Unavailable("Service not enabled.".to_string()));
        }
        let mut guard = self.inner.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let url = self.config.redis_url();
        info!(url = url.as_str(), "creating cache connection");
        let client = redis::Client::open(url.as_str())
            .map_err(|error| connection_error("open", error))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|error| connection_error("connect", error))?;
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|error| connection_error("ping", error))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the shared connection so the next use reconnects.
    async fn power_cycle(&self) {
        *self.inner.lock().await = None;
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(error) => {
                error!(error = %error, "cache operation failed");
                self.power_cycle().await;
                Err(ApiError::Unavailable("Cache gone.".to_string()))
            }
        }
    }

    /// Raw bytes stored under a key, `None` when absent or expired.
    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, ApiError> {
        let key = key.to_string();
        self.run(|mut conn| async move { conn.get(&key).await }).await
    }

    /// The load-status record of a dataset uuid.
    pub async fn get_status(&self, uuid: &str) -> Result<Option<LoadStatus>, ApiError> {
        let raw = self.get_bytes(uuid).await?;
        Ok(raw.and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    /// Publish a message on the portal channel.
    pub async fn publish(&self, message: &PortalMessage) -> Result<(), ApiError> {
        let payload = serde_json::to_vec(message)
            .map_err(|error| ApiError::Internal(error.to_string()))?;
        self.run(|mut conn| async move {
            conn.publish::<_, _, ()>(PORTAL_CHANNEL, payload).await
        })
        .await
    }
}

fn connection_error(step: &str, error: redis::RedisError) -> ApiError {
    error!(step = step, error = %error, "could not connect to cache");
    ApiError::Unavailable("Cache gone.".to_string())
}
