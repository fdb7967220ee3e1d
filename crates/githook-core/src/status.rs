//! Event-log delivery states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery state of one event-log row.
///
/// ```text
/// queued --> delivered --> success
/// queued --> failed
/// delivered --> failed
/// ```
///
/// `success` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Row created at ingress, publish not yet attempted.
    Queued,
    /// All publish targets accepted the message.
    Delivered,
    /// A worker handler completed the event.
    Success,
    /// Publish or handling failed.
    Failed,
}

impl EventStatus {
    /// Whether this state accepts no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether a transition from `self` to `to` is allowed.
    ///
    /// Re-entering the same state is allowed so that redeliveries can
    /// overwrite `failed` with `failed` (fresh error message) without
    /// tripping the machine.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        match self {
            Self::Queued => matches!(to, Self::Delivered | Self::Failed),
            Self::Delivered => matches!(to, Self::Success | Self::Failed),
            // Redelivery of a failed message may still succeed.
            Self::Failed => matches!(to, Self::Success | Self::Failed),
            Self::Success => false,
        }
    }

    /// Wire/database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "delivered" => Ok(Self::Delivered),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions() {
        use EventStatus::{Delivered, Failed, Queued, Success};

        assert!(Queued.can_transition(Delivered));
        assert!(Queued.can_transition(Failed));
        assert!(!Queued.can_transition(Success));

        assert!(Delivered.can_transition(Success));
        assert!(Delivered.can_transition(Failed));
        assert!(!Delivered.can_transition(Queued));

        // A failed row may be overwritten by a successful redelivery.
        assert!(Failed.can_transition(Success));
        assert!(!Failed.can_transition(Queued));

        assert!(!Success.can_transition(Failed));
        assert!(!Success.can_transition(Queued));
    }

    #[test]
    fn serde_round_trip() {
        let s: EventStatus = serde_json::from_str("\"delivered\"").unwrap();
        assert_eq!(s, EventStatus::Delivered);
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"delivered\"");
        assert_eq!("failed".parse::<EventStatus>().unwrap(), EventStatus::Failed);
    }
}
