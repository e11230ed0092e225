use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use case_sync::config::{ProviderConfig, QueryConfig};
use case_sync::store::{
    BatchWrite, Lease, MemoryStore, ProcessPage, ProcessQuery, ProcessStore, StoreResult,
};
use case_sync::{
    AccessControlResolver, AuthTokenManager, Company, Principal, ProcessFilter, ProcessRecord,
    ProviderClient, QueryService, Region, Role, SalesTeam, SyncError,
};
use chrono::Duration;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Delegates to a memory store and counts listing queries
struct CountingStore {
    inner: Arc<MemoryStore>,
    queries: AtomicUsize,
}

#[async_trait]
impl ProcessStore for CountingStore {
    async fn get_process(&self, process_id: i64) -> StoreResult<Option<ProcessRecord>> {
        self.inner.get_process(process_id).await
    }

    async fn get_processes(&self, process_ids: &[i64]) -> StoreResult<Vec<ProcessRecord>> {
        self.inner.get_processes(process_ids).await
    }

    async fn upsert_processes(&self, records: &[ProcessRecord]) -> StoreResult<BatchWrite> {
        self.inner.upsert_processes(records).await
    }

    async fn delete_absent(&self, keep: &[i64]) -> StoreResult<u64> {
        self.inner.delete_absent(keep).await
    }

    async fn query_processes(&self, query: &ProcessQuery) -> StoreResult<ProcessPage> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query_processes(query).await
    }

    async fn try_acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> StoreResult<Lease> {
        self.inner.try_acquire_lease(name, holder, ttl).await
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        self.inner.release_lease(name, holder).await
    }
}

fn record(id: i64, plaintiff: &str, defendant: &str, case_number: &str) -> ProcessRecord {
    let mut record = ProcessRecord::new(id);
    record.plaintiff_identifier = plaintiff.to_string();
    record.defendant_identifier = defendant.to_string();
    record.case_number = case_number.to_string();
    record.process_class = "VERBAL SUMARIO".to_string();
    record.internal_stage = "NOTIFICACION POR AVISO".to_string();
    record
}

async fn fixture() -> (Arc<MemoryStore>, Arc<CountingStore>) {
    let memory = Arc::new(MemoryStore::new());
    memory
        .upsert_processes(&[
            record(1, "A", "111", "11001-2023-001"),
            record(2, "B", "222", "11001-2023-002"),
            record(3, "C", "333", "05001-2024-ABC"),
            record(4, "Z", "444", "05001-2024-004"),
        ])
        .await
        .unwrap();

    memory
        .add_team(SalesTeam {
            lead_email: "lead@firm.co".to_string(),
            lead_role: Role::CommercialDirector,
            subordinate_emails: vec!["m1@firm.co".to_string(), "m2@firm.co".to_string()],
            region: Region::National,
        })
        .await;
    for (identifier, manager) in [("A", "m1@firm.co"), ("B", "m1@firm.co"), ("C", "m2@firm.co")] {
        memory
            .add_company(Company {
                identifier: identifier.to_string(),
                name: format!("Client {}", identifier),
                email: None,
                assigned_account_manager_email: Some(manager.to_string()),
                active: true,
            })
            .await;
    }

    let counting = Arc::new(CountingStore {
        inner: memory.clone(),
        queries: AtomicUsize::new(0),
    });
    (memory, counting)
}

fn service(memory: &Arc<MemoryStore>, counting: &Arc<CountingStore>) -> QueryService {
    QueryService::new(
        counting.clone(),
        AccessControlResolver::new(memory.clone()),
        QueryConfig::default(),
    )
}

#[tokio::test]
async fn empty_scope_skips_the_store_query() {
    let (memory, counting) = fixture().await;
    let service = service(&memory, &counting);
    let nobody = Principal::from_claims(Role::Staff, &["reports:view".to_string()], "ops@firm.co", None);

    let page = service.list(&nobody, &ProcessFilter::default()).await.unwrap();

    assert!(page.items.is_empty());
    assert_eq!(page.total, 0);
    assert_eq!(counting.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn team_lead_lists_only_team_processes() {
    let (memory, counting) = fixture().await;
    let service = service(&memory, &counting);
    let lead = Principal::from_claims(Role::CommercialDirector, &[], "lead@firm.co", None);

    let page = service.list(&lead, &ProcessFilter::default()).await.unwrap();

    let ids: Vec<i64> = page.items.iter().map(|p| p.process_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(page.items[0].client_class, "eviction");
    assert_eq!(page.items[0].client_stage, "notification");
    assert_eq!(counting.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn search_is_case_insensitive_within_scope() {
    let (memory, counting) = fixture().await;
    let service = service(&memory, &counting);
    let lead = Principal::from_claims(Role::CommercialDirector, &[], "lead@firm.co", None);
    let admin = Principal::from_claims(Role::Admin, &[], "root@firm.co", None);

    let page = service.search(&lead, "abc").await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].process_id, 3);

    let page = service.search(&lead, "05001").await.unwrap();
    assert_eq!(page.total, 1);

    let page = service.search(&admin, "05001").await.unwrap();
    assert_eq!(page.total, 2);
}

#[tokio::test]
async fn detail_access_follows_subject_identifiers() {
    let memory = Arc::new(MemoryStore::new());
    memory
        .upsert_processes(&[record(9, "", "900123456-7", "X-1")])
        .await
        .unwrap();
    let service = QueryService::new(
        memory.clone(),
        AccessControlResolver::new(memory.clone()),
        QueryConfig::default(),
    );

    let owner = Principal::from_claims(Role::Client, &[], "c@client.co", Some("900123456"));
    assert!(service.detail(&owner, 9).await.is_ok());

    let stranger = Principal::from_claims(Role::Client, &[], "s@client.co", Some("111111111"));
    let err = service.detail(&stranger, 9).await.unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied { process_id: 9 }));
}

#[tokio::test]
async fn client_lists_every_process_it_can_open() {
    let memory = Arc::new(MemoryStore::new());
    memory
        .upsert_processes(&[
            record(1, "900123456-7", "52", "X-1"),
            record(2, "", "900.123.456", "X-2"),
            record(3, "111111111", "", "X-3"),
        ])
        .await
        .unwrap();
    let service = QueryService::new(
        memory.clone(),
        AccessControlResolver::new(memory.clone()),
        QueryConfig::default(),
    );
    let owner = Principal::from_claims(Role::Client, &[], "c@client.co", Some("900123456"));

    let page = service.list(&owner, &ProcessFilter::default()).await.unwrap();
    let listed: Vec<i64> = page.items.iter().map(|p| p.process_id).collect();
    assert_eq!(listed, vec![1, 2]);

    for id in [1, 2, 3] {
        let visible = service.detail(&owner, id).await.is_ok();
        assert_eq!(visible, listed.contains(&id), "process {}", id);
    }

    let page = service.search(&owner, "X-").await.unwrap();
    assert_eq!(page.total, 2);
}

#[tokio::test]
async fn account_manager_matches_formatted_company_identifiers() {
    let memory = Arc::new(MemoryStore::new());
    memory
        .upsert_processes(&[record(5, "800.555.123-4", "", "Y-5")])
        .await
        .unwrap();
    memory
        .add_company(Company {
            identifier: "8005551234".to_string(),
            name: "Client Y".to_string(),
            email: None,
            assigned_account_manager_email: Some("am@firm.co".to_string()),
            active: true,
        })
        .await;
    let service = QueryService::new(
        memory.clone(),
        AccessControlResolver::new(memory.clone()),
        QueryConfig::default(),
    );
    let manager = Principal::from_claims(Role::AccountManager, &[], "am@firm.co", None);

    let page = service.list(&manager, &ProcessFilter::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert!(service.detail(&manager, 5).await.is_ok());
}

#[tokio::test]
async fn detail_includes_live_view_when_provider_is_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/apikeys/CreateApiKey"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "authToken": "tok" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Procesos/GetProceso"))
        .and(query_param("procesoId", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "proceso": {
                "ProcesoId": 1,
                "MedidasCautelares": [
                    { "Id": 5, "TipoMedida": "EMBARGO", "AvaluoJudicial": 1500000.0 }
                ],
                "CamposPersonalizados": [
                    { "Nombre": "Abogado externo", "Valor": "Medellin" },
                    { "Nombre": "Ubicacion Contrato", "Valor": "Bogota" }
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (memory, counting) = fixture().await;
    let config = ProviderConfig {
        base_url: server.uri(),
        api_key_env: "CASE_SYNC_TEST_UNSET_API_KEY".to_string(),
        api_key: Some("api-key".to_string()),
        ..Default::default()
    };
    let client = ProviderClient::new(&server.uri(), AuthTokenManager::new(&config, memory.clone()));
    let service = service(&memory, &counting).with_provider(client);
    let admin = Principal::from_claims(Role::Admin, &[], "root@firm.co", None);

    let view = service.detail(&admin, 1).await.unwrap();

    assert_eq!(view.summary.client_stage, "notification");
    let measure = view.precautionary_measure.unwrap();
    assert_eq!(measure.measure_type.as_deref(), Some("EMBARGO"));
    assert_eq!(view.contract_location.as_deref(), Some("Bogota"));
    assert!(view.latest_docket_entry.is_none());
}
