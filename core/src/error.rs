use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::EpisodeKind;

/// Terminal-per-invocation domain errors. Each maps to a reply the user
/// sees; none are retried internally except transient upstream failures,
/// which the caller retries a bounded number of times before they
/// surface as `Upstream`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed command arguments. Reported, no write attempted.
    #[error("{message}")]
    Validation { message: String },

    /// Nutrition lookup miss. Reported, no write attempted.
    #[error("no nutrition match for '{query}'")]
    NotFound { query: String },

    /// Start requested while an episode of this kind is already open.
    #[error("{} already open", .kind.label())]
    AlreadyOpen { kind: EpisodeKind },

    /// End requested with no open episode of this kind.
    #[error("no open {} to end", .kind.as_str())]
    NoOpenEpisode { kind: EpisodeKind },

    /// Idempotency short-circuit: this event id was already processed.
    /// Not a failure — the caller replays the original result.
    #[error("event '{event_id}' already processed")]
    DuplicateEvent { event_id: String },

    /// External dependency failure (catalog, sender, store) after
    /// bounded retries. Committed state is unaffected.
    #[error("upstream failure in {source_name}: {message}")]
    Upstream {
        source_name: String,
        message: String,
    },

    /// Internal inconsistency, e.g. a decrement that would drive a
    /// daily total negative. Reported, never clamped silently.
    #[error("internal inconsistency: {message}")]
    Internal { message: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> DomainError {
        DomainError::Validation {
            message: message.into(),
        }
    }

    pub fn upstream(source: &str, message: impl Into<String>) -> DomainError {
        DomainError::Upstream {
            source_name: source.to_string(),
            message: message.into(),
        }
    }
}

/// Non-blocking warning attached to an otherwise-successful dose write.
/// Doses are never rejected — a real-world dose that was taken must be
/// recorded; warnings inform, they do not prevent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DoseWarning {
    pub kind: DoseWarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseWarningKind {
    /// Previous dose of the same drug is inside the minimum interval.
    Safety,
    /// Monthly dose count (any drug) is at or above the quota.
    Quota,
}
