//! Error taxonomy shared across the pipeline.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced anywhere along the webhook → broker → worker path.
///
/// The webhook boundary recovers these into HTTP status codes and the
/// event log; the worker surfaces them to the retry policy.
#[derive(Debug, Error)]
pub enum Error {
    /// Webhook secret/signature mismatch. Surfaces as 401.
    #[error("signature verification failed for {provider}")]
    AuthSignature {
        /// Provider whose verification failed.
        provider: String,
    },

    /// Required credential fields absent from a provider-instance config.
    #[error("auth config missing required field: {field}")]
    AuthConfigMissing {
        /// Name of the missing field.
        field: String,
    },

    /// Upstream provider token endpoint returned a non-2xx response.
    #[error("token exchange failed ({status}): {body}")]
    TokenExchange {
        /// HTTP status from the provider.
        status: u16,
        /// Response body, truncated to 4 KiB.
        body: String,
    },

    /// A `when` expression failed to compile.
    #[error("rule {rule_id} failed to compile: {message}")]
    RuleCompile {
        /// Offending rule id.
        rule_id: String,
        /// Parser diagnostic.
        message: String,
    },

    /// A `when` expression failed during evaluation (strict mode only).
    #[error("rule {rule_id} failed to evaluate: {message}")]
    RuleEval {
        /// Offending rule id.
        rule_id: String,
        /// Evaluator diagnostic.
        message: String,
    },

    /// The requested driver exists but is disabled.
    #[error("publisher unavailable for driver {driver_id}: {reason}")]
    PublisherUnavailable {
        /// Driver id that could not be resolved.
        driver_id: String,
        /// Why resolution failed.
        reason: String,
    },

    /// The broker rejected a publish or a connection fell over.
    #[error("transport error: {0}")]
    Transport(String),

    /// A broker payload could not be decoded into an [`crate::Event`].
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// A referenced installation/rule/driver/row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `rule` or `event_log`.
        entity: &'static str,
        /// Identifier that missed.
        id: String,
    },

    /// A resource was used after shutdown.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Malformed driver or provider-instance configuration.
    #[error("invalid config for {scope}: {message}")]
    InvalidConfig {
        /// Which config was malformed (driver name, provider, ...).
        scope: String,
        /// What was wrong with it.
        message: String,
    },

    /// JSON (de)serialization failure at a boundary we own.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything the above kinds do not cover.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a [`Error::NotFound`] for `entity`/`id`.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Build a [`Error::Transport`] from any displayable source.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// True when the error is terminal for the resource (no retry helps).
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::TokenExchange {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "token exchange failed (502): bad gateway");

        let err = Error::not_found("rule", "r-42");
        assert_eq!(err.to_string(), "rule not found: r-42");
    }

    #[test]
    fn closed_is_terminal() {
        assert!(Error::Closed("publisher cache").is_closed());
        assert!(!Error::Transport("boom".into()).is_closed());
    }
}
