pub mod access;
pub mod config;
pub mod digest;
pub mod error;
pub mod models;
pub mod provider;
pub mod query;
pub mod reconcile;
pub mod stages;
pub mod store;

pub use access::AccessControlResolver;
pub use config::Config;
pub use digest::{consolidate, DigestNotifier, DigestPeriod, DigestReport, Mailer, WebhookMailer};
pub use error::{SyncError, SyncResult};
pub use models::*;
pub use provider::{AuthTokenManager, ProcessDetail, ProviderClient};
pub use query::{Page, ProcessFilter, ProcessSummary, ProcessView, QueryService};
pub use reconcile::{canonicalize, ReconcileReport, ReconciliationEngine};
pub use stages::{translate_class, translate_stage, ClientClass, ClientStage};
pub use store::{MemoryStore, PostgresStore};
