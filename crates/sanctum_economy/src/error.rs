//! # Economy Error Types
//!
//! All errors that can occur in the economy core.
//!
//! The taxonomy is split by who can act on the failure:
//!
//! | Variant | Audience | Retry? |
//! |---|---|---|
//! | `InsufficientResources`, `InvalidOperation`, `UnknownPlayer` | player | no |
//! | `LockTimeout`, `ConcurrentModification`, `DeadlineExceeded` | player ("try again") | yes |
//! | `ConfigurationMissing`, `InvalidConfig`, `Storage`, `ArithmeticOverflow` | administrator | no |

use thiserror::Error;

use crate::account::PlayerId;

/// Errors that can occur in the economy core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EconomyError {
    /// A consume or cost exceeded the available balance or quantity.
    #[error("insufficient {resource}: need {required}, have {available}")]
    InsufficientResources {
        /// What ran short (currency name, stack, shards).
        resource: String,
        /// The amount required.
        required: u64,
        /// The amount available.
        available: u64,
    },

    /// A lock could not be acquired within its wait budget.
    #[error("lock {key} busy after {waited_ms} ms")]
    LockTimeout {
        /// Human-readable lock key.
        key: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The request itself is malformed or not allowed in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An optimistic version check failed.
    #[error("{entity} was modified concurrently: expected version {expected}, found {found}")]
    ConcurrentModification {
        /// The row that changed.
        entity: String,
        /// Version the caller expected.
        expected: u64,
        /// Version actually stored.
        found: u64,
    },

    /// A required tunable is absent and has no default.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// A tunable is present but unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No account exists for this player.
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    /// The caller-supplied deadline passed before the operation committed.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// Arithmetic overflow in an economic calculation.
    #[error("arithmetic overflow in economic calculation")]
    ArithmeticOverflow,

    /// Journal storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EconomyError {
    /// Shorthand for an `InsufficientResources` error.
    #[must_use]
    pub fn insufficient(resource: impl Into<String>, required: u64, available: u64) -> Self {
        Self::InsufficientResources {
            resource: resource.into(),
            required,
            available,
        }
    }

    /// Shorthand for an `InvalidOperation` error.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation(reason.into())
    }

    /// Whether the caller may retry the same request after a backoff.
    ///
    /// The engine never retries on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::ConcurrentModification { .. } | Self::DeadlineExceeded
        )
    }

    /// Whether the error comes from configuration rather than player input.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigurationMissing(_) | Self::InvalidConfig(_))
    }

    /// Message suitable for showing to the player.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientResources {
                resource,
                required,
                available,
            } => format!("Not enough {resource}: you need {required} but have {available}."),
            Self::InvalidOperation(reason) => format!("That can't be done: {reason}."),
            Self::UnknownPlayer(_) => "No account found. Register first.".to_string(),
            Self::LockTimeout { .. } | Self::DeadlineExceeded => {
                "The server is busy with another action of yours. Please try again.".to_string()
            }
            Self::ConcurrentModification { .. } => {
                "Your data changed while this was processing. Please try again.".to_string()
            }
            Self::ConfigurationMissing(_)
            | Self::InvalidConfig(_)
            | Self::ArithmeticOverflow
            | Self::Storage(_) => {
                "The economy is misconfigured. An administrator has been notified.".to_string()
            }
        }
    }
}

/// Result type for economy operations.
pub type EconomyResult<T> = Result<T, EconomyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(EconomyError::LockTimeout {
            key: "player:1".into(),
            waited_ms: 2000
        }
        .is_retryable());
        assert!(EconomyError::DeadlineExceeded.is_retryable());
        assert!(!EconomyError::insufficient("lumees", 10, 5).is_retryable());
        assert!(!EconomyError::ConfigurationMissing("fusion.cost.base".into()).is_retryable());
    }

    #[test]
    fn test_user_messages_are_distinct() {
        let errors = [
            EconomyError::insufficient("lumees", 1000, 500),
            EconomyError::invalid("tier 12 cannot be fused"),
            EconomyError::LockTimeout {
                key: "player:1".into(),
                waited_ms: 2000,
            },
            EconomyError::ConcurrentModification {
                entity: "player:1".into(),
                expected: 3,
                found: 4,
            },
            EconomyError::ConfigurationMissing("summon.decay".into()),
        ];

        let messages: std::collections::HashSet<_> =
            errors.iter().map(EconomyError::user_message).collect();
        assert_eq!(messages.len(), errors.len());
    }

    #[test]
    fn test_lock_timeout_reads_as_try_again() {
        let msg = EconomyError::LockTimeout {
            key: "player:7".into(),
            waited_ms: 2000,
        }
        .user_message();
        assert!(msg.contains("try again"));
    }
}
