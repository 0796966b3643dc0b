//! Error types for the core subsystems (spec §7).
//!
//! Mirrors the shape of the teacher's `facilitator::ErrorReason` /
//! `facilitator_local::PaymentError`: a small `#[serde(rename_all = "snake_case")]`
//! reason enum for anything that crosses the admin HTTP surface, plus per-subsystem
//! `thiserror` enums that carry the detail needed for logging and `#[from]` into a
//! top-level aggregate.

use thiserror::Error;

/// Errors from the `Store` abstraction (spec §6 Store interface).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store entry not found for key {0:?}")]
    NotFound(String),

    #[error("compare-and-swap failed for key {0:?}: data changed underneath us")]
    CasConflict(String),

    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the `HssClient` abstraction (spec §6 HSS client interface).
#[derive(Debug, Error)]
pub enum HssError {
    #[error("HSS returned user unknown for {0:?}")]
    UserUnknown(String),

    #[error("HSS rejected the request: {0}")]
    Rejected(String),

    #[error("HSS transport error: {0}")]
    Transport(String),

    #[error("HSS returned an authentication vector we could not parse: {0}")]
    MalformedVector(String),
}

/// Errors raised while evaluating a subscriber's Initial Filter Criteria (spec §4.4).
#[derive(Debug, Error)]
pub enum IfcError {
    #[error("malformed trigger point in filter criterion at priority {0}")]
    MalformedTrigger(i32),

    #[error("duplicate priority {0} across filter criteria; order is now unspecified")]
    DuplicatePriority(i32),
}

/// Aggregate error returned by the public entry points of the authentication engine,
/// registrar, subscription manager, and proxy transaction state machine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("stale credentials, client should retry with a fresh challenge")]
    StaleCredentials,

    #[error("request is malformed: {0}")]
    MalformedRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hss(#[from] HssError),

    #[error(transparent)]
    Ifc(#[from] IfcError),

    #[error("no application server responded and DefaultHandling=SESSION_TERMINATED")]
    AsChainTerminated,

    #[error("maximum forking width exceeded")]
    ForkingLimitExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable, machine-readable reason codes for the admin HTTP surface, grounded on the
/// teacher's `ErrorReason` (`Display` via the `snake_case` serde rendering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Unauthorized,
    StaleCredentials,
    MalformedRequest,
    NotFound,
    CasConflict,
    Unavailable,
    Internal,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

impl From<&CoreError> for ErrorReason {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::Unauthorized(_) => ErrorReason::Unauthorized,
            CoreError::StaleCredentials => ErrorReason::StaleCredentials,
            CoreError::MalformedRequest(_) => ErrorReason::MalformedRequest,
            CoreError::Store(StoreError::NotFound(_)) => ErrorReason::NotFound,
            CoreError::Store(StoreError::CasConflict(_)) => ErrorReason::CasConflict,
            CoreError::Store(StoreError::Unavailable(_)) => ErrorReason::Unavailable,
            CoreError::Hss(_) | CoreError::Ifc(_) => ErrorReason::Internal,
            CoreError::AsChainTerminated | CoreError::ForkingLimitExceeded => {
                ErrorReason::Internal
            }
            CoreError::Store(StoreError::Serialization(_)) | CoreError::Internal(_) => {
                ErrorReason::Internal
            }
        }
    }
}
