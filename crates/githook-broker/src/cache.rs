//! Publisher cache: `(tenant, driver_id)` → live publisher.

use dashmap::DashMap;
use githook_core::{Error, Result, TenantCtx};
use githook_store::DriverStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::transport::channel::ChannelHub;
use crate::{transport, Publisher};

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant: TenantCtx,
    driver_id: String,
}

/// Owns every live publisher in the process.
///
/// Resolution loads the driver record, parses its config, and
/// constructs the publisher exactly once per key; concurrent misses for
/// one key coalesce on a per-key gate while other keys construct in
/// parallel. Construction happens outside the map lock.
pub struct PublisherCache {
    drivers: Arc<dyn DriverStore>,
    hub: Arc<ChannelHub>,
    entries: DashMap<CacheKey, Arc<dyn Publisher>>,
    gates: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl PublisherCache {
    /// Cache over `drivers`, sharing `hub` with channel subscribers.
    #[must_use]
    pub fn new(drivers: Arc<dyn DriverStore>, hub: Arc<ChannelHub>) -> Self {
        Self {
            drivers,
            hub,
            entries: DashMap::new(),
            gates: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Resolve `(tenant, driver_id)` to a live publisher.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after [`PublisherCache::close`];
    /// [`Error::PublisherUnavailable`] for a disabled driver;
    /// [`Error::NotFound`] / [`Error::InvalidConfig`] /
    /// [`Error::Transport`] from record load and construction.
    pub async fn resolve(
        &self,
        tenant: &TenantCtx,
        driver_id: &str,
    ) -> Result<Arc<dyn Publisher>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("publisher cache"));
        }
        let key = CacheKey {
            tenant: tenant.clone(),
            driver_id: driver_id.to_string(),
        };
        if let Some(existing) = self.entries.get(&key) {
            return Ok(Arc::clone(&existing));
        }

        // Per-key single-flight: losers of the race wait here, then find
        // the winner's publisher in the map.
        let gate = {
            let mut gates = self.gates.lock().await;
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        let _guard = gate.lock().await;

        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("publisher cache"));
        }
        if let Some(existing) = self.entries.get(&key) {
            return Ok(Arc::clone(&existing));
        }

        let record = self.drivers.get(tenant, driver_id).await?;
        if !record.enabled {
            return Err(Error::PublisherUnavailable {
                driver_id: driver_id.to_string(),
                reason: "driver is disabled".to_string(),
            });
        }
        let config = DriverConfig::from_record(&record)?;
        debug!(tenant = %tenant, driver_id = %driver_id, driver = config.name(), "constructing publisher");
        let publisher = transport::build_publisher(&config, &self.hub).await?;

        self.entries.insert(key, Arc::clone(&publisher));
        Ok(publisher)
    }

    /// Publish through the resolved driver.
    ///
    /// Blocks until the transport reports acceptance.
    ///
    /// # Errors
    ///
    /// As [`PublisherCache::resolve`], plus [`Error::Transport`] from
    /// the publish itself.
    pub async fn publish(
        &self,
        tenant: &TenantCtx,
        driver_id: &str,
        topic: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let publisher = self.resolve(tenant, driver_id).await?;
        publisher.publish(topic, payload, metadata).await
    }

    /// Driver name for metadata stamping, resolving the record only.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the driver does not exist.
    pub async fn driver_name(&self, tenant: &TenantCtx, driver_id: &str) -> Result<String> {
        Ok(self.drivers.get(tenant, driver_id).await?.name)
    }

    /// Drop a cache entry and close its publisher.
    ///
    /// Called on driver update or delete. In-flight publishes hold their
    /// own `Arc` and drain against the old connection.
    pub async fn invalidate(&self, tenant: &TenantCtx, driver_id: &str) -> Result<()> {
        let key = CacheKey {
            tenant: tenant.clone(),
            driver_id: driver_id.to_string(),
        };
        if let Some((_, publisher)) = self.entries.remove(&key) {
            info!(tenant = %tenant, driver_id = %driver_id, "evicting publisher");
            publisher.close().await?;
        }
        Ok(())
    }

    /// Close every publisher and refuse further resolution.
    ///
    /// Idempotent; the first error is returned after all entries closed.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut first_error = None;
        for key in keys {
            if let Some((_, publisher)) = self.entries.remove(&key) {
                if let Err(e) = publisher.close().await {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of live cache entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no publisher is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use githook_store::{DriverRecord, MemoryDriverStore};
    use serde_json::json;

    fn channel_driver(id: &str, enabled: bool) -> DriverRecord {
        DriverRecord {
            tenant: TenantCtx::global(),
            id: id.into(),
            name: "channel".into(),
            config: json!({"buffer": 8}),
            enabled,
        }
    }

    fn cache_with(drivers: Vec<DriverRecord>) -> PublisherCache {
        PublisherCache::new(
            Arc::new(MemoryDriverStore::with_drivers(drivers)),
            Arc::new(ChannelHub::new()),
        )
    }

    #[tokio::test]
    async fn resolves_and_caches() {
        let cache = cache_with(vec![channel_driver("d1", true)]);
        let t = TenantCtx::global();

        let a = cache.resolve(&t, "d1").await.unwrap();
        let b = cache.resolve(&t, "d1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_construct_once() {
        let cache = Arc::new(cache_with(vec![channel_driver("d1", true)]));
        let t = TenantCtx::global();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let t = t.clone();
                tokio::spawn(async move { cache.resolve(&t, "d1").await.unwrap() })
            })
            .collect();

        let mut publishers = Vec::new();
        for task in tasks {
            publishers.push(task.await.unwrap());
        }
        // Every resolver got the same instance: exactly one construction.
        for p in &publishers[1..] {
            assert!(Arc::ptr_eq(&publishers[0], p));
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn disabled_driver_is_unavailable() {
        let cache = cache_with(vec![channel_driver("d1", false)]);
        let err = cache.resolve(&TenantCtx::global(), "d1").await.unwrap_err();
        assert!(matches!(err, Error::PublisherUnavailable { .. }));
    }

    #[tokio::test]
    async fn missing_driver_is_not_found() {
        let cache = cache_with(vec![]);
        let err = cache.resolve(&TenantCtx::global(), "nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn invalidate_evicts_and_closes() {
        let cache = cache_with(vec![channel_driver("d1", true)]);
        let t = TenantCtx::global();
        let publisher = cache.resolve(&t, "d1").await.unwrap();

        cache.invalidate(&t, "d1").await.unwrap();
        assert!(cache.is_empty());
        // The evicted publisher is closed.
        let err = publisher
            .publish("t", b"x", &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.is_closed());
        // Re-resolution constructs a fresh one.
        assert!(cache.resolve(&t, "d1").await.is_ok());
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let cache = cache_with(vec![channel_driver("d1", true)]);
        let t = TenantCtx::global();
        cache.resolve(&t, "d1").await.unwrap();

        cache.close().await.unwrap();
        cache.close().await.unwrap();
        let err = cache.resolve(&t, "d1").await.unwrap_err();
        assert!(err.is_closed());
    }
}
