pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    identifier_keys_match, normalize_identifier, Company, ExternalToken, ProcessRecord, SalesTeam,
    StageChangeEvent,
};

/// Result type alias using `StoreError`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by storage backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The backend refused a single write (constraint violation, bad data)
    #[error("write rejected: {0}")]
    Rejected(String),

    /// A stored value does not map onto the domain model
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

/// Outcome of a bulk upsert where each record is written independently
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub inserted: Vec<i64>,
    pub updated: Vec<i64>,
    pub failed: Vec<(i64, String)>,
}

impl BatchWrite {
    pub fn written(&self) -> impl Iterator<Item = i64> + '_ {
        self.inserted.iter().chain(self.updated.iter()).copied()
    }
}

/// Filter for scoped process listing
#[derive(Debug, Clone, Default)]
pub struct ProcessQuery {
    /// Case-insensitive substring over identifiers, case number and alternate code
    pub text: Option<String>,
    /// `None` means unrestricted
    pub scope: Option<SubjectScope>,
    pub offset: usize,
    pub limit: usize,
}

/// Which subject identifiers make a record visible to a non-global caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectScope {
    /// Granted identifiers, matched verbatim or after normalization
    pub identifiers: Vec<String>,
    /// The caller's own normalized identifier, matched by containment
    pub requester_key: Option<String>,
    pub min_fuzzy_digits: usize,
}

impl SubjectScope {
    pub fn new(
        identifiers: impl IntoIterator<Item = String>,
        requester: Option<&str>,
        min_fuzzy_digits: usize,
    ) -> Self {
        Self {
            identifiers: identifiers
                .into_iter()
                .filter(|id| !id.trim().is_empty())
                .collect(),
            requester_key: requester
                .map(normalize_identifier)
                .filter(|key| !key.is_empty()),
            min_fuzzy_digits,
        }
    }

    /// Normalized granted identifiers, blanks dropped
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .identifiers
            .iter()
            .map(|id| normalize_identifier(id))
            .filter(|key| !key.is_empty())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn admits(&self, record: &ProcessRecord) -> bool {
        let keys = self.keys();
        record.subject_identifiers().any(|subject| {
            if self.identifiers.iter().any(|id| id == subject) {
                return true;
            }
            let subject = normalize_identifier(subject);
            if subject.is_empty() {
                return false;
            }
            keys.contains(&subject)
                || self
                    .requester_key
                    .as_deref()
                    .is_some_and(|own| identifier_keys_match(own, &subject, self.min_fuzzy_digits))
        })
    }
}

/// A page of records plus the total number of matches
#[derive(Debug, Clone, Default)]
pub struct ProcessPage {
    pub records: Vec<ProcessRecord>,
    pub total: usize,
}

/// Result of a lease attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    Acquired,
    HeldUntil(DateTime<Utc>),
}

/// Persisted provider token. Exactly one is active at a time.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn current_token(&self) -> StoreResult<Option<ExternalToken>>;

    /// Atomically replace any existing token with `token`
    async fn replace_token(&self, token: &ExternalToken) -> StoreResult<()>;
}

/// Canonical process records, unique on `process_id`
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn get_process(&self, process_id: i64) -> StoreResult<Option<ProcessRecord>>;

    async fn get_processes(&self, process_ids: &[i64]) -> StoreResult<Vec<ProcessRecord>>;

    /// Insert or update each record independently. A failing record is
    /// reported in `BatchWrite::failed` and does not stop the others.
    async fn upsert_processes(&self, records: &[ProcessRecord]) -> StoreResult<BatchWrite>;

    /// Delete every record whose id is not in `keep`. Returns the count deleted.
    async fn delete_absent(&self, keep: &[i64]) -> StoreResult<u64>;

    async fn query_processes(&self, query: &ProcessQuery) -> StoreResult<ProcessPage>;

    /// Take the named lease for `ttl` unless someone else holds an unexpired one
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> StoreResult<Lease>;

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()>;
}

/// Stage change events awaiting or past notification
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_events(&self, events: &[StageChangeEvent]) -> StoreResult<()>;

    /// Unreported events with `created_at < before`, oldest first
    async fn unreported_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<StageChangeEvent>>;

    async fn mark_reported(&self, ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete events created before `cutoff`, reported or not
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// Sales hierarchy and company assignments
#[async_trait]
pub trait OrgDirectory: Send + Sync {
    async fn find_team_by_lead(&self, lead_email: &str) -> StoreResult<Option<SalesTeam>>;

    /// Identifiers of companies assigned to any of the given account managers
    async fn identifiers_assigned_to(&self, manager_emails: &[String]) -> StoreResult<Vec<String>>;

    /// Active companies with a contact email
    async fn active_recipients(&self) -> StoreResult<Vec<Company>>;
}
