//! Persistence seams for githook.
//!
//! The service only ever talks to the async store traits in [`stores`];
//! deployments back them with a database. The [`memory`] implementations
//! cover embedded deployments and every test in the workspace.

pub mod memory;
pub mod records;
pub mod stores;

pub use memory::{
    MemoryDriverStore, MemoryEventLogStore, MemoryInstallationStore, MemoryNamespaceStore,
    MemoryProviderInstanceStore, MemoryRuleStore,
};
pub use records::{
    body_sha256, config_fingerprint, DriverRecord, EventLogRecord, InstallationRecord,
    NamespaceRecord, ProviderInstanceRecord, RuleRecord, DEFAULT_INSTANCE_KEY,
};
pub use stores::{
    DriverStore, EventLogStore, InstallationStore, NamespaceStore, ProviderInstanceStore,
    RuleStore,
};
