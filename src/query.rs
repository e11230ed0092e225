use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::access::AccessControlResolver;
use crate::config::QueryConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{AccessScope, Principal, ProcessRecord};
use crate::provider::types::{DocketEntry, PrecautionaryMeasure};
use crate::provider::{ProcessDetail, ProviderClient};
use crate::stages::{translate_class, translate_stage};
use crate::store::{ProcessQuery, ProcessStore, SubjectScope};

/// Listing filter; `page` is 1-based
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessFilter {
    pub text: Option<String>,
    pub page: usize,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    fn empty(page: usize, page_size: usize) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page,
            page_size,
        }
    }
}

/// A stored process in client-facing terms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub process_id: i64,
    pub case_number: String,
    pub alternate_code: String,
    pub client_class: String,
    pub client_stage: String,
    pub court_office: String,
    pub plaintiff_name: String,
    pub plaintiff_identifier: String,
    pub defendant_name: String,
    pub defendant_identifier: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&ProcessRecord> for ProcessSummary {
    fn from(record: &ProcessRecord) -> Self {
        Self {
            process_id: record.process_id,
            case_number: record.case_number.clone(),
            alternate_code: record.alternate_code.clone(),
            client_class: translate_class(&record.process_class).label().to_string(),
            client_stage: translate_stage(&record.internal_stage).label().to_string(),
            court_office: record.court_office.clone(),
            plaintiff_name: record.plaintiff_name.clone(),
            plaintiff_identifier: record.plaintiff_identifier.clone(),
            defendant_name: record.defendant_name.clone(),
            defendant_identifier: record.defendant_identifier.clone(),
            updated_at: record.updated_at,
        }
    }
}

/// Detail of one process: the stored record plus, when a provider client is
/// configured, the live view projected to the fields clients care about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessView {
    pub summary: ProcessSummary,
    pub internal_stage: String,
    pub internal_class: String,
    pub latest_docket_entry: Option<DocketEntry>,
    pub precautionary_measure: Option<PrecautionaryMeasure>,
    pub contract_location: Option<String>,
    pub live: Option<ProcessDetail>,
}

impl ProcessView {
    fn new(record: &ProcessRecord, live: Option<ProcessDetail>) -> Self {
        Self {
            summary: ProcessSummary::from(record),
            internal_stage: record.internal_stage.clone(),
            internal_class: record.process_class.clone(),
            latest_docket_entry: live.as_ref().and_then(|d| d.latest_docket_entry().cloned()),
            precautionary_measure: live
                .as_ref()
                .and_then(|d| d.first_precautionary_measure().cloned()),
            contract_location: live
                .as_ref()
                .and_then(|d| d.contract_location().map(str::to_string)),
            live,
        }
    }
}

/// Scoped read access to stored processes
pub struct QueryService {
    processes: Arc<dyn ProcessStore>,
    resolver: AccessControlResolver,
    provider: Option<ProviderClient>,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(
        processes: Arc<dyn ProcessStore>,
        resolver: AccessControlResolver,
        config: QueryConfig,
    ) -> Self {
        Self {
            processes,
            resolver,
            provider: None,
            config,
        }
    }

    /// Enrich detail lookups with the provider's live view
    pub fn with_provider(mut self, provider: ProviderClient) -> Self {
        self.provider = Some(provider);
        self
    }

    #[instrument(skip(self, principal), fields(email = %principal.email))]
    pub async fn list(
        &self,
        principal: &Principal,
        filter: &ProcessFilter,
    ) -> SyncResult<Page<ProcessSummary>> {
        let page = filter.page.max(1);
        let page_size = filter
            .page_size
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size.max(1));

        let scope = self.resolver.resolve(principal).await?;
        if scope.is_empty() {
            debug!("Empty scope, skipping store query");
            return Ok(Page::empty(page, page_size));
        }

        let query = ProcessQuery {
            text: filter
                .text
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            scope: (!scope.is_global).then(|| self.subject_scope(&scope, principal)),
            offset: (page - 1) * page_size,
            limit: page_size,
        };

        let result = self.processes.query_processes(&query).await?;

        debug!(total = result.total, returned = result.records.len(), "Listed processes");

        Ok(Page {
            items: result.records.iter().map(ProcessSummary::from).collect(),
            total: result.total,
            page,
            page_size,
        })
    }

    /// Free-text search over identifiers, case number and alternate code
    pub async fn search(&self, principal: &Principal, term: &str) -> SyncResult<Page<ProcessSummary>> {
        self.list(
            principal,
            &ProcessFilter {
                text: Some(term.to_string()),
                page: 1,
                page_size: None,
            },
        )
        .await
    }

    #[instrument(skip(self, principal), fields(email = %principal.email))]
    pub async fn detail(&self, principal: &Principal, process_id: i64) -> SyncResult<ProcessView> {
        let record = self
            .processes
            .get_process(process_id)
            .await?
            .ok_or(SyncError::NotFound { process_id })?;

        let scope = self.resolver.resolve(principal).await?;
        if !self.can_view(&scope, principal, &record) {
            info!(process_id, "Denied process detail");
            return Err(if self.config.conceal_forbidden {
                SyncError::NotFound { process_id }
            } else {
                SyncError::AccessDenied { process_id }
            });
        }

        let live = match &self.provider {
            Some(provider) => provider.fetch_process_detail(process_id).await?,
            None => None,
        };

        Ok(ProcessView::new(&record, live))
    }

    /// Whether `principal` with `scope` may see `record`
    pub fn can_view(&self, scope: &AccessScope, principal: &Principal, record: &ProcessRecord) -> bool {
        if scope.is_global {
            return true;
        }
        !scope.is_empty() && self.subject_scope(scope, principal).admits(record)
    }

    fn subject_scope(&self, scope: &AccessScope, principal: &Principal) -> SubjectScope {
        SubjectScope::new(
            scope.allowed_identifiers.iter().cloned(),
            principal.identifier.as_deref(),
            self.config.min_fuzzy_match_digits,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::store::MemoryStore;

    async fn fixture(config: QueryConfig) -> (Arc<MemoryStore>, QueryService) {
        let store = Arc::new(MemoryStore::new());
        let mut record = ProcessRecord::new(42);
        record.defendant_identifier = "900123456-7".to_string();
        record.internal_stage = "MANDAMIENTO DE PAGO".to_string();
        store.upsert_processes(&[record]).await.unwrap();

        let resolver = AccessControlResolver::new(store.clone());
        let service = QueryService::new(store.clone(), resolver, config);
        (store, service)
    }

    #[tokio::test]
    async fn test_detail_grants_by_requester_identifier() {
        let (_, service) = fixture(QueryConfig::default()).await;
        let principal = Principal::from_claims(Role::Client, &[], "c@client.co", Some("900123456"));

        let view = service.detail(&principal, 42).await.unwrap();
        assert_eq!(view.summary.client_stage, "payment order");
        assert!(view.live.is_none());
    }

    #[tokio::test]
    async fn test_detail_denies_and_conceals() {
        let (_, service) = fixture(QueryConfig::default()).await;
        let stranger = Principal::from_claims(Role::Client, &[], "x@client.co", Some("111111111"));

        let err = service.detail(&stranger, 42).await.unwrap_err();
        assert!(matches!(err, SyncError::AccessDenied { process_id: 42 }));

        let err = service.detail(&stranger, 7).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { process_id: 7 }));

        let (_, concealing) = fixture(QueryConfig {
            conceal_forbidden: true,
            ..Default::default()
        })
        .await;
        let err = concealing.detail(&stranger, 42).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { process_id: 42 }));
    }

    #[tokio::test]
    async fn test_list_and_detail_agree_on_formatted_identifiers() {
        let (store, service) = fixture(QueryConfig::default()).await;
        let mut dotted = ProcessRecord::new(43);
        dotted.plaintiff_identifier = "900.123.456-7".to_string();
        store.upsert_processes(&[dotted]).await.unwrap();
        let principal = Principal::from_claims(Role::Client, &[], "c@client.co", Some("900123456"));

        let page = service.list(&principal, &ProcessFilter::default()).await.unwrap();
        let listed: Vec<i64> = page.items.iter().map(|p| p.process_id).collect();
        assert_eq!(listed, vec![42, 43]);
        for id in listed {
            assert!(service.detail(&principal, id).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_no_capability_sees_nothing_even_with_identifier() {
        let (_, service) = fixture(QueryConfig::default()).await;
        let principal = Principal::from_claims(
            Role::Client,
            &["utils:export".to_string()],
            "c@client.co",
            Some("900123456"),
        );

        let page = service.list(&principal, &ProcessFilter::default()).await.unwrap();
        assert!(page.items.is_empty());
        let err = service.detail(&principal, 42).await.unwrap_err();
        assert!(matches!(err, SyncError::AccessDenied { process_id: 42 }));
    }

    #[tokio::test]
    async fn test_list_clamps_page_size() {
        let (store, service) = fixture(QueryConfig {
            max_page_size: 2,
            ..Default::default()
        })
        .await;
        store
            .upsert_processes(&[ProcessRecord::new(1), ProcessRecord::new(2)])
            .await
            .unwrap();
        let admin = Principal::from_claims(Role::Admin, &[], "root@firm.co", None);

        let page = service
            .list(
                &admin,
                &ProcessFilter {
                    text: None,
                    page: 2,
                    page_size: Some(50),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.page_size, 2);
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
    }
}
