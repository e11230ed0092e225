pub mod auth;
pub mod client;
pub mod types;

pub use auth::AuthTokenManager;
pub use client::ProviderClient;
pub use types::{ExtractItem, ProcessDetail, SubjectRole};
