//! Async store traits the service is programmed against.
//!
//! Implementations are expected to be tenant-scoped on every call and to
//! serialize event-log state transitions per row.

use async_trait::async_trait;
use githook_core::{EventStatus, Result, TenantCtx};

use crate::records::{
    DriverRecord, EventLogRecord, InstallationRecord, NamespaceRecord, ProviderInstanceRecord,
    RuleRecord,
};

/// Provider-instance configuration store.
#[async_trait]
pub trait ProviderInstanceStore: Send + Sync {
    /// Fetch one instance by key.
    async fn get(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        key: &str,
    ) -> Result<ProviderInstanceRecord>;

    /// All enabled instances for a provider, used for secret-trial
    /// resolution when a webhook does not name its instance.
    async fn list_enabled(
        &self,
        tenant: &TenantCtx,
        provider: &str,
    ) -> Result<Vec<ProviderInstanceRecord>>;

    /// Insert or replace an instance keyed by `(tenant, provider, key)`.
    async fn upsert(&self, record: ProviderInstanceRecord) -> Result<()>;
}

/// Installation credential store.
#[async_trait]
pub trait InstallationStore: Send + Sync {
    /// Fetch by provider-side installation id.
    async fn get_by_installation_id(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        installation_id: &str,
    ) -> Result<InstallationRecord>;

    /// All installations under a provider instance.
    async fn list(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        instance_key: &str,
    ) -> Result<Vec<InstallationRecord>>;

    /// Insert or replace, keyed by
    /// `(tenant, provider, account_id, installation_id)`.
    async fn upsert(&self, record: InstallationRecord) -> Result<()>;

    /// Remove an installation on uninstall.
    async fn delete(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        installation_id: &str,
    ) -> Result<()>;
}

/// Repository (namespace) store.
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Fetch by full name (`owner/name`).
    async fn get_by_full_name(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        full_name: &str,
    ) -> Result<NamespaceRecord>;

    /// All namespaces under a provider instance.
    async fn list(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        instance_key: &str,
    ) -> Result<Vec<NamespaceRecord>>;

    /// Insert or replace, keyed by `(tenant, provider, repo_id)`.
    async fn upsert(&self, record: NamespaceRecord) -> Result<()>;

    /// Remove a namespace on uninstall or repo removal.
    async fn delete(&self, tenant: &TenantCtx, provider: &str, repo_id: &str) -> Result<()>;
}

/// Rule store.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Fetch one rule.
    async fn get(&self, tenant: &TenantCtx, id: &str) -> Result<RuleRecord>;

    /// All rules for a tenant, in configured order.
    async fn list(&self, tenant: &TenantCtx) -> Result<Vec<RuleRecord>>;

    /// Insert or replace a rule.
    async fn upsert(&self, record: RuleRecord) -> Result<()>;

    /// Remove a rule.
    async fn delete(&self, tenant: &TenantCtx, id: &str) -> Result<()>;
}

/// Driver store.
#[async_trait]
pub trait DriverStore: Send + Sync {
    /// Fetch one driver.
    async fn get(&self, tenant: &TenantCtx, id: &str) -> Result<DriverRecord>;

    /// All drivers for a tenant.
    async fn list(&self, tenant: &TenantCtx) -> Result<Vec<DriverRecord>>;

    /// Insert or replace a driver.
    async fn upsert(&self, record: DriverRecord) -> Result<()>;

    /// Remove a driver.
    async fn delete(&self, tenant: &TenantCtx, id: &str) -> Result<()>;
}

/// Event-log store with the delivery state machine.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Persist a fresh `queued` row.
    async fn create(&self, record: EventLogRecord) -> Result<()>;

    /// Fetch one row.
    async fn get(&self, tenant: &TenantCtx, id: &str) -> Result<EventLogRecord>;

    /// Transition a row, enforcing the state machine.
    ///
    /// Entering a terminal state stamps `latency_ms` from the row's
    /// `created_at`. Asking a terminal row to go back to `queued` is a
    /// no-op. A disallowed transition is also a no-op (the row keeps its
    /// terminal state); only a missing row is an error.
    ///
    /// # Errors
    ///
    /// [`githook_core::Error::NotFound`] when the row does not exist.
    async fn transition(
        &self,
        tenant: &TenantCtx,
        id: &str,
        to: EventStatus,
        error_message: Option<String>,
    ) -> Result<()>;
}
