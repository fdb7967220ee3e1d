//! Shared application state.

use githook_auth::Authenticator;
use githook_broker::{ChannelHub, PublisherCache};
use githook_rules::RuleEngine;
use githook_store::{
    DriverStore, EventLogStore, InstallationStore, MemoryDriverStore, MemoryEventLogStore,
    MemoryInstallationStore, MemoryNamespaceStore, MemoryProviderInstanceStore, MemoryRuleStore,
    NamespaceStore, ProviderInstanceStore, RuleStore,
};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::dedup::DeliveryDedup;

/// Everything the handlers need, cloned per request.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Provider-instance store.
    pub instances: Arc<dyn ProviderInstanceStore>,
    /// Installation store.
    pub installations: Arc<dyn InstallationStore>,
    /// Namespace store.
    pub namespaces: Arc<dyn NamespaceStore>,
    /// Rule store.
    pub rules: Arc<dyn RuleStore>,
    /// Driver store.
    pub drivers: Arc<dyn DriverStore>,
    /// Event-log store.
    pub event_logs: Arc<dyn EventLogStore>,
    /// Compiled rule engine.
    pub engine: Arc<RuleEngine>,
    /// Publisher cache.
    pub publishers: Arc<PublisherCache>,
    /// Provider authenticator (control-plane `GetSCMClient`).
    pub authenticator: Arc<Authenticator>,
    /// Delivery-id replay suppression.
    pub dedup: Arc<DeliveryDedup>,
}

impl AppState {
    /// State over explicit stores; the engine must already be compiled.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: ServerConfig,
        instances: Arc<dyn ProviderInstanceStore>,
        installations: Arc<dyn InstallationStore>,
        namespaces: Arc<dyn NamespaceStore>,
        rules: Arc<dyn RuleStore>,
        drivers: Arc<dyn DriverStore>,
        event_logs: Arc<dyn EventLogStore>,
        engine: RuleEngine,
        publishers: PublisherCache,
    ) -> Self {
        let dedup = Arc::new(DeliveryDedup::new(Duration::from_secs(
            config.dedup_ttl_secs,
        )));
        Self {
            config: Arc::new(config),
            instances,
            installations,
            namespaces,
            rules,
            drivers,
            event_logs,
            engine: Arc::new(engine),
            publishers: Arc::new(publishers),
            authenticator: Arc::new(Authenticator::new()),
            dedup,
        }
    }

    /// Fully in-memory state for embedded deployments and tests.
    ///
    /// # Errors
    ///
    /// Rule compilation errors in strict mode.
    pub fn in_memory(
        config: ServerConfig,
        rules: Vec<githook_store::RuleRecord>,
        drivers: Vec<githook_store::DriverRecord>,
    ) -> githook_core::Result<(Self, Arc<ChannelHub>)> {
        let hub = Arc::new(ChannelHub::new());
        let driver_store = Arc::new(MemoryDriverStore::with_drivers(drivers));
        let rule_defs = rules
            .iter()
            .map(|r| githook_rules::RuleDef {
                id: r.id.clone(),
                when: r.when.clone(),
                emit: r.emit_topics(),
                driver_id: r.driver_id.clone(),
            })
            .collect();
        let engine = RuleEngine::compile(rule_defs, config.strict_rules)?;
        let publishers = PublisherCache::new(driver_store.clone(), hub.clone());

        let state = Self::new(
            config,
            Arc::new(MemoryProviderInstanceStore::new()),
            Arc::new(MemoryInstallationStore::new()),
            Arc::new(MemoryNamespaceStore::new()),
            Arc::new(MemoryRuleStore::with_rules(rules)),
            driver_store,
            Arc::new(MemoryEventLogStore::new()),
            engine,
            publishers,
        );
        Ok((state, hub))
    }
}
