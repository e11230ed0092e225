//! Error kinds surfaced by the sync core.

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias using `SyncError`.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while syncing, querying or notifying.
///
/// The enum is `Clone` so a single refresh outcome can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Missing or invalid configuration. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The provider rejected our credentials (HTTP 401).
    #[error("Upstream authorization failed: {0}")]
    UpstreamAuth(String),

    /// Network failure, 5xx, or a second authorization failure after refresh.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The provider answered with a body we could not decode.
    #[error("Invalid upstream payload: {0}")]
    InvalidPayload(String),

    /// An extract row without a usable process id.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// The principal may not see this process.
    #[error("Access denied to process {process_id}")]
    AccessDenied { process_id: i64 },

    /// No stored process with this id.
    #[error("Process {process_id} not found")]
    NotFound { process_id: i64 },

    /// Another reconciliation run holds the lease.
    #[error("Reconciliation already running (lease held until {until})")]
    RunInProgress { until: chrono::DateTime<chrono::Utc> },

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Store(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err.to_string())
    }
}

impl SyncError {
    /// True for errors that come from the provider side of the wire.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            SyncError::UpstreamAuth(_)
                | SyncError::UpstreamUnavailable(_)
                | SyncError::InvalidPayload(_)
        )
    }
}
