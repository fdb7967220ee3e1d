//! In-memory store implementations.
//!
//! Back the embedded deployment mode and every test in the workspace.
//! All maps are tenant-scoped by key prefix; locks are held only for the
//! duration of the map operation.

use async_trait::async_trait;
use chrono::Utc;
use githook_core::{Error, EventStatus, Result, TenantCtx};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::records::{
    DriverRecord, EventLogRecord, InstallationRecord, NamespaceRecord, ProviderInstanceRecord,
    RuleRecord,
};
use crate::stores::{
    DriverStore, EventLogStore, InstallationStore, NamespaceStore, ProviderInstanceStore,
    RuleStore,
};

fn key2(tenant: &TenantCtx, a: &str) -> String {
    format!("{}\x1f{a}", tenant.id())
}

fn key3(tenant: &TenantCtx, a: &str, b: &str) -> String {
    format!("{}\x1f{a}\x1f{b}", tenant.id())
}

/// In-memory [`ProviderInstanceStore`].
#[derive(Debug, Default)]
pub struct MemoryProviderInstanceStore {
    inner: RwLock<HashMap<String, ProviderInstanceRecord>>,
}

impl MemoryProviderInstanceStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderInstanceStore for MemoryProviderInstanceStore {
    async fn get(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        key: &str,
    ) -> Result<ProviderInstanceRecord> {
        self.inner
            .read()
            .get(&key3(tenant, provider, key))
            .cloned()
            .ok_or_else(|| Error::not_found("provider_instance", format!("{provider}/{key}")))
    }

    async fn list_enabled(
        &self,
        tenant: &TenantCtx,
        provider: &str,
    ) -> Result<Vec<ProviderInstanceRecord>> {
        let prefix = key3(tenant, provider, "");
        let mut out: Vec<_> = self
            .inner
            .read()
            .iter()
            .filter(|(k, v)| k.starts_with(&prefix) && v.enabled)
            .map(|(_, v)| v.clone())
            .collect();
        // Stable resolution order: "default" first, then by key.
        out.sort_by(|a, b| {
            let a_default = a.key == crate::records::DEFAULT_INSTANCE_KEY;
            let b_default = b.key == crate::records::DEFAULT_INSTANCE_KEY;
            b_default.cmp(&a_default).then_with(|| a.key.cmp(&b.key))
        });
        Ok(out)
    }

    async fn upsert(&self, record: ProviderInstanceRecord) -> Result<()> {
        let key = key3(&record.tenant, &record.provider, &record.key);
        self.inner.write().insert(key, record);
        Ok(())
    }
}

/// In-memory [`InstallationStore`].
#[derive(Debug, Default)]
pub struct MemoryInstallationStore {
    inner: RwLock<HashMap<String, InstallationRecord>>,
}

impl MemoryInstallationStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstallationStore for MemoryInstallationStore {
    async fn get_by_installation_id(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        installation_id: &str,
    ) -> Result<InstallationRecord> {
        self.inner
            .read()
            .get(&key3(tenant, provider, installation_id))
            .cloned()
            .ok_or_else(|| Error::not_found("installation", installation_id))
    }

    async fn list(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        instance_key: &str,
    ) -> Result<Vec<InstallationRecord>> {
        let prefix = key3(tenant, provider, "");
        Ok(self
            .inner
            .read()
            .iter()
            .filter(|(k, v)| k.starts_with(&prefix) && v.instance_key == instance_key)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn upsert(&self, record: InstallationRecord) -> Result<()> {
        // installation_id is unique per provider, so it is the map key.
        let key = key3(&record.tenant, &record.provider, &record.installation_id);
        self.inner.write().insert(key, record);
        Ok(())
    }

    async fn delete(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        installation_id: &str,
    ) -> Result<()> {
        self.inner
            .write()
            .remove(&key3(tenant, provider, installation_id));
        Ok(())
    }
}

/// In-memory [`NamespaceStore`].
#[derive(Debug, Default)]
pub struct MemoryNamespaceStore {
    inner: RwLock<HashMap<String, NamespaceRecord>>,
}

impl MemoryNamespaceStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NamespaceStore for MemoryNamespaceStore {
    async fn get_by_full_name(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        full_name: &str,
    ) -> Result<NamespaceRecord> {
        let prefix = key3(tenant, provider, "");
        self.inner
            .read()
            .iter()
            .find(|(k, v)| k.starts_with(&prefix) && v.full_name == full_name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::not_found("namespace", full_name))
    }

    async fn list(
        &self,
        tenant: &TenantCtx,
        provider: &str,
        instance_key: &str,
    ) -> Result<Vec<NamespaceRecord>> {
        let prefix = key3(tenant, provider, "");
        Ok(self
            .inner
            .read()
            .iter()
            .filter(|(k, v)| k.starts_with(&prefix) && v.instance_key == instance_key)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn upsert(&self, record: NamespaceRecord) -> Result<()> {
        let key = key3(&record.tenant, &record.provider, &record.repo_id);
        self.inner.write().insert(key, record);
        Ok(())
    }

    async fn delete(&self, tenant: &TenantCtx, provider: &str, repo_id: &str) -> Result<()> {
        self.inner.write().remove(&key3(tenant, provider, repo_id));
        Ok(())
    }
}

/// In-memory [`RuleStore`]. Preserves insertion order on list.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    inner: RwLock<Vec<RuleRecord>>,
}

impl MemoryRuleStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `rules`.
    #[must_use]
    pub fn with_rules(rules: Vec<RuleRecord>) -> Self {
        Self {
            inner: RwLock::new(rules),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get(&self, tenant: &TenantCtx, id: &str) -> Result<RuleRecord> {
        self.inner
            .read()
            .iter()
            .find(|r| &r.tenant == tenant && r.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("rule", id))
    }

    async fn list(&self, tenant: &TenantCtx) -> Result<Vec<RuleRecord>> {
        Ok(self
            .inner
            .read()
            .iter()
            .filter(|r| &r.tenant == tenant)
            .cloned()
            .collect())
    }

    async fn upsert(&self, record: RuleRecord) -> Result<()> {
        let mut rules = self.inner.write();
        if let Some(existing) = rules
            .iter_mut()
            .find(|r| r.tenant == record.tenant && r.id == record.id)
        {
            *existing = record;
        } else {
            rules.push(record);
        }
        Ok(())
    }

    async fn delete(&self, tenant: &TenantCtx, id: &str) -> Result<()> {
        self.inner
            .write()
            .retain(|r| !(&r.tenant == tenant && r.id == id));
        Ok(())
    }
}

/// In-memory [`DriverStore`].
#[derive(Debug, Default)]
pub struct MemoryDriverStore {
    inner: RwLock<HashMap<String, DriverRecord>>,
}

impl MemoryDriverStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `drivers`.
    #[must_use]
    pub fn with_drivers(drivers: Vec<DriverRecord>) -> Self {
        let store = Self::default();
        {
            let mut inner = store.inner.write();
            for d in drivers {
                inner.insert(key2(&d.tenant, &d.id), d);
            }
        }
        store
    }
}

#[async_trait]
impl DriverStore for MemoryDriverStore {
    async fn get(&self, tenant: &TenantCtx, id: &str) -> Result<DriverRecord> {
        self.inner
            .read()
            .get(&key2(tenant, id))
            .cloned()
            .ok_or_else(|| Error::not_found("driver", id))
    }

    async fn list(&self, tenant: &TenantCtx) -> Result<Vec<DriverRecord>> {
        let prefix = key2(tenant, "");
        let mut out: Vec<_> = self
            .inner
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn upsert(&self, record: DriverRecord) -> Result<()> {
        let key = key2(&record.tenant, &record.id);
        self.inner.write().insert(key, record);
        Ok(())
    }

    async fn delete(&self, tenant: &TenantCtx, id: &str) -> Result<()> {
        self.inner.write().remove(&key2(tenant, id));
        Ok(())
    }
}

/// In-memory [`EventLogStore`] enforcing the state machine.
#[derive(Debug, Default)]
pub struct MemoryEventLogStore {
    inner: RwLock<HashMap<String, EventLogRecord>>,
}

impl MemoryEventLogStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows for a tenant, newest first. Test/introspection helper.
    #[must_use]
    pub fn list(&self, tenant: &TenantCtx) -> Vec<EventLogRecord> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .values()
            .filter(|r| &r.tenant == tenant)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }
}

#[async_trait]
impl EventLogStore for MemoryEventLogStore {
    async fn create(&self, record: EventLogRecord) -> Result<()> {
        let key = key2(&record.tenant, &record.id);
        self.inner.write().insert(key, record);
        Ok(())
    }

    async fn get(&self, tenant: &TenantCtx, id: &str) -> Result<EventLogRecord> {
        self.inner
            .read()
            .get(&key2(tenant, id))
            .cloned()
            .ok_or_else(|| Error::not_found("event_log", id))
    }

    async fn transition(
        &self,
        tenant: &TenantCtx,
        id: &str,
        to: EventStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let row = inner
            .get_mut(&key2(tenant, id))
            .ok_or_else(|| Error::not_found("event_log", id))?;

        if row.status == to && !to.is_terminal() {
            return Ok(());
        }
        if !row.status.can_transition(to) {
            // Terminal rows absorb late transitions; re-queue attempts
            // and stale publishes are idempotent no-ops.
            debug!(
                log_id = %id,
                from = %row.status,
                to = %to,
                "ignoring disallowed event-log transition"
            );
            return Ok(());
        }

        row.status = to;
        row.updated_at = Utc::now();
        if let Some(msg) = error_message {
            row.error_message = msg;
        } else if to == EventStatus::Success {
            row.error_message.clear();
        }
        if to.is_terminal() {
            row.latency_ms = (row.updated_at - row.created_at).num_milliseconds();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued_row() -> EventLogRecord {
        EventLogRecord::queued(TenantCtx::global(), "github", "push", "req-1")
    }

    #[tokio::test]
    async fn event_log_happy_path() {
        let store = MemoryEventLogStore::new();
        let row = queued_row();
        let id = row.id.clone();
        store.create(row).await.unwrap();

        let t = TenantCtx::global();
        store
            .transition(&t, &id, EventStatus::Delivered, None)
            .await
            .unwrap();
        store
            .transition(&t, &id, EventStatus::Success, None)
            .await
            .unwrap();

        let row = store.get(&t, &id).await.unwrap();
        assert_eq!(row.status, EventStatus::Success);
        assert!(row.latency_ms >= 0);
    }

    #[tokio::test]
    async fn terminal_rows_ignore_requeue() {
        let store = MemoryEventLogStore::new();
        let row = queued_row();
        let id = row.id.clone();
        store.create(row).await.unwrap();

        let t = TenantCtx::global();
        store
            .transition(&t, &id, EventStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        // Re-queue of a terminal row is a silent no-op.
        store
            .transition(&t, &id, EventStatus::Queued, None)
            .await
            .unwrap();

        let row = store.get(&t, &id).await.unwrap();
        assert_eq!(row.status, EventStatus::Failed);
        assert_eq!(row.error_message, "boom");
    }

    #[tokio::test]
    async fn failed_rows_accept_successful_redelivery() {
        let store = MemoryEventLogStore::new();
        let row = queued_row();
        let id = row.id.clone();
        store.create(row).await.unwrap();

        let t = TenantCtx::global();
        store
            .transition(&t, &id, EventStatus::Failed, Some("transient".into()))
            .await
            .unwrap();
        store
            .transition(&t, &id, EventStatus::Success, None)
            .await
            .unwrap();

        let row = store.get(&t, &id).await.unwrap();
        assert_eq!(row.status, EventStatus::Success);
        assert!(row.error_message.is_empty());
    }

    #[tokio::test]
    async fn success_is_absorbing() {
        let store = MemoryEventLogStore::new();
        let row = queued_row();
        let id = row.id.clone();
        store.create(row).await.unwrap();

        let t = TenantCtx::global();
        store
            .transition(&t, &id, EventStatus::Delivered, None)
            .await
            .unwrap();
        store
            .transition(&t, &id, EventStatus::Success, None)
            .await
            .unwrap();
        store
            .transition(&t, &id, EventStatus::Failed, Some("late".into()))
            .await
            .unwrap();

        let row = store.get(&t, &id).await.unwrap();
        assert_eq!(row.status, EventStatus::Success);
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let store = MemoryEventLogStore::new();
        let err = store
            .transition(&TenantCtx::global(), "nope", EventStatus::Success, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn driver_store_round_trip() {
        let store = MemoryDriverStore::new();
        let t = TenantCtx::new("acme");
        store
            .upsert(DriverRecord {
                tenant: t.clone(),
                id: "amqp-1".into(),
                name: "amqp".into(),
                config: json!({"url": "amqp://localhost"}),
                enabled: true,
            })
            .await
            .unwrap();

        let rec = store.get(&t, "amqp-1").await.unwrap();
        assert_eq!(rec.name, "amqp");

        // Other tenants do not see it.
        let err = store.get(&TenantCtx::global(), "amqp-1").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        store.delete(&t, "amqp-1").await.unwrap();
        assert!(store.get(&t, "amqp-1").await.is_err());
    }

    #[tokio::test]
    async fn instance_resolution_order_prefers_default() {
        let store = MemoryProviderInstanceStore::new();
        let t = TenantCtx::global();
        for key in ["bbbb", "default", "aaaa"] {
            store
                .upsert(ProviderInstanceRecord {
                    tenant: t.clone(),
                    provider: "github".into(),
                    key: key.into(),
                    config: json!({"webhook_secret": key}),
                    redirect_base_url: String::new(),
                    enabled: true,
                })
                .await
                .unwrap();
        }

        let keys: Vec<_> = store
            .list_enabled(&t, "github")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["default", "aaaa", "bbbb"]);
    }
}
