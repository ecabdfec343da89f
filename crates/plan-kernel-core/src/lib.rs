//! Domain model for the plan kernel: plans and their step state machine,
//! program dependency graphs, agent role boundaries, handoff records and
//! workflow routing.
//!
//! Everything here operates on in-memory snapshots and performs no I/O of
//! its own. Persistence, locking and the approval client live in
//! `plan-kernel-store-sqlite`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod approval;
pub mod config;
pub mod graph;
pub mod handoff;
pub mod plan;
pub mod risk;
pub mod roles;
pub mod workflow;

pub use config::KernelConfig;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("boundary violation: {0}")]
    BoundaryViolation(String),
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("confirmation required: {0}")]
    ConfirmationRequired(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("lock on {key} not acquired after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl KernelError {
    /// Stable machine-readable code used in tool envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::BoundaryViolation(_) => "boundary_violation",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::ConfirmationRequired(_) => "confirmation_required",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Configuration(_) => "configuration",
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, Ulid::new().to_string().to_lowercase()))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

prefixed_id!(
    /// Plan identifier. Legacy plans keep whatever id they were created with.
    PlanId,
    "plan"
);
prefixed_id!(ProgramId, "prog");
prefixed_id!(SessionId, "sess");
prefixed_id!(
    /// Stable step identity that survives reordering.
    StepId,
    "step"
);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    /// Derives the stable workspace id for a project directory.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let normalized = normalize_workspace_path(path);
        let digest = Sha256::digest(normalized.as_bytes());
        let encoded = hex::encode(digest);
        Self(format!("ws_{}", &encoded[..16]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkspaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub path: String,
    pub registered_at: OffsetDateTime,
}

#[must_use]
pub fn normalize_workspace_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let trimmed = unified.trim_end_matches('/');
    if trimmed.is_empty() && unified.starts_with('/') {
        return "/".to_string();
    }
    trimmed.to_lowercase()
}

/// Last non-empty path component, used as the default workspace name.
#[must_use]
pub fn workspace_name_from_path(path: &str) -> String {
    normalize_separators(path)
        .rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or("workspace")
        .to_string()
}

fn normalize_separators(path: &str) -> String {
    path.trim().replace('\\', "/")
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`KernelError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, KernelError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| KernelError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(KernelError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`KernelError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, KernelError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| KernelError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
