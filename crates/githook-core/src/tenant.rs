//! Tenant scoping for request and call contexts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque tenant identifier carried on every store and broker call.
///
/// An empty tenant means the global scope; all lookups fall back to it
/// when a deployment runs single-tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantCtx(String);

impl TenantCtx {
    /// The global (unscoped) tenant.
    #[must_use]
    pub fn global() -> Self {
        Self(String::new())
    }

    /// Create a tenant context from an id; empty ids collapse to global.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw tenant id, empty for the global scope.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }

    /// True when this is the global scope.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TenantCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("(global)")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for TenantCtx {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantCtx {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_global() {
        assert!(TenantCtx::global().is_global());
        assert!(TenantCtx::new("").is_global());
        assert!(!TenantCtx::new("acme").is_global());
    }

    #[test]
    fn display_marks_global() {
        assert_eq!(TenantCtx::global().to_string(), "(global)");
        assert_eq!(TenantCtx::new("acme").to_string(), "acme");
    }
}
