use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    BatchWrite, EventStore, Lease, OrgDirectory, ProcessPage, ProcessQuery, ProcessStore,
    StoreError, StoreResult, TokenStore,
};
use crate::models::{
    normalize_email, Company, ExternalToken, ProcessRecord, SalesTeam, StageChangeEvent,
};

/// In-process store for tests and dry runs. Holds every collection behind its
/// own lock; no lock is held across an await point.
#[derive(Debug, Default)]
pub struct MemoryStore {
    token: RwLock<Option<ExternalToken>>,
    processes: RwLock<BTreeMap<i64, ProcessRecord>>,
    events: RwLock<Vec<StageChangeEvent>>,
    teams: RwLock<HashMap<String, SalesTeam>>,
    companies: RwLock<Vec<Company>>,
    leases: RwLock<HashMap<String, (Uuid, DateTime<Utc>)>>,
    rejected_ids: RwLock<HashSet<i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_team(&self, team: SalesTeam) {
        let key = normalize_email(&team.lead_email);
        self.teams.write().await.insert(key, team);
    }

    pub async fn add_company(&self, company: Company) {
        self.companies.write().await.push(company);
    }

    /// Refuse writes for `process_id`, as a constraint violation would
    pub async fn reject_writes_for(&self, process_id: i64) {
        self.rejected_ids.write().await.insert(process_id);
    }

    pub async fn all_processes(&self) -> Vec<ProcessRecord> {
        self.processes.read().await.values().cloned().collect()
    }

    pub async fn all_events(&self) -> Vec<StageChangeEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn current_token(&self) -> StoreResult<Option<ExternalToken>> {
        Ok(self.token.read().await.clone())
    }

    async fn replace_token(&self, token: &ExternalToken) -> StoreResult<()> {
        *self.token.write().await = Some(token.clone());
        Ok(())
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn get_process(&self, process_id: i64) -> StoreResult<Option<ProcessRecord>> {
        Ok(self.processes.read().await.get(&process_id).cloned())
    }

    async fn get_processes(&self, process_ids: &[i64]) -> StoreResult<Vec<ProcessRecord>> {
        let processes = self.processes.read().await;
        Ok(process_ids
            .iter()
            .filter_map(|id| processes.get(id).cloned())
            .collect())
    }

    async fn upsert_processes(&self, records: &[ProcessRecord]) -> StoreResult<BatchWrite> {
        let rejected = self.rejected_ids.read().await.clone();
        let mut processes = self.processes.write().await;
        let mut outcome = BatchWrite::default();

        for record in records {
            if rejected.contains(&record.process_id) {
                outcome.failed.push((
                    record.process_id,
                    StoreError::Rejected(format!("process {} refused", record.process_id))
                        .to_string(),
                ));
                continue;
            }

            match processes.insert(record.process_id, record.clone()) {
                Some(_) => outcome.updated.push(record.process_id),
                None => outcome.inserted.push(record.process_id),
            }
        }

        debug!(
            inserted = outcome.inserted.len(),
            updated = outcome.updated.len(),
            failed = outcome.failed.len(),
            "Upserted process batch"
        );

        Ok(outcome)
    }

    async fn delete_absent(&self, keep: &[i64]) -> StoreResult<u64> {
        let keep: HashSet<i64> = keep.iter().copied().collect();
        let mut processes = self.processes.write().await;
        let before = processes.len();
        processes.retain(|id, _| keep.contains(id));
        Ok((before - processes.len()) as u64)
    }

    async fn query_processes(&self, query: &ProcessQuery) -> StoreResult<ProcessPage> {
        let processes = self.processes.read().await;
        let needle = query.text.as_ref().map(|t| t.to_lowercase());

        let matches: Vec<&ProcessRecord> = processes
            .values()
            .filter(|record| match &query.scope {
                Some(scope) => scope.admits(record),
                None => true,
            })
            .filter(|record| match &needle {
                Some(needle) => [
                    &record.plaintiff_identifier,
                    &record.defendant_identifier,
                    &record.case_number,
                    &record.alternate_code,
                ]
                .iter()
                .any(|field| field.to_lowercase().contains(needle.as_str())),
                None => true,
            })
            .collect();

        Ok(ProcessPage {
            total: matches.len(),
            records: matches
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .cloned()
                .collect(),
        })
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> StoreResult<Lease> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;

        if let Some((current, until)) = leases.get(name) {
            if *current != holder && *until > now {
                return Ok(Lease::HeldUntil(*until));
            }
        }

        leases.insert(name.to_string(), (holder, now + ttl));
        Ok(Lease::Acquired)
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        let mut leases = self.leases.write().await;
        if leases.get(name).is_some_and(|(current, _)| *current == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_events(&self, events: &[StageChangeEvent]) -> StoreResult<()> {
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn unreported_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<StageChangeEvent>> {
        let mut selected: Vec<StageChangeEvent> = self
            .events
            .read()
            .await
            .iter()
            .filter(|e| !e.reported && e.created_at < before)
            .cloned()
            .collect();
        selected.sort_by_key(|e| e.created_at);
        Ok(selected)
    }

    async fn mark_reported(&self, ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<u64> {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut marked = 0;
        for event in self.events.write().await.iter_mut() {
            if ids.contains(&event.id) && !event.reported {
                event.reported = true;
                event.reported_at = Some(at);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

#[async_trait]
impl OrgDirectory for MemoryStore {
    async fn find_team_by_lead(&self, lead_email: &str) -> StoreResult<Option<SalesTeam>> {
        Ok(self
            .teams
            .read()
            .await
            .get(&normalize_email(lead_email))
            .cloned())
    }

    async fn identifiers_assigned_to(&self, manager_emails: &[String]) -> StoreResult<Vec<String>> {
        let managers: HashSet<String> = manager_emails.iter().map(|e| normalize_email(e)).collect();
        Ok(self
            .companies
            .read()
            .await
            .iter()
            .filter(|c| {
                c.assigned_account_manager_email
                    .as_deref()
                    .is_some_and(|email| managers.contains(&normalize_email(email)))
            })
            .map(|c| c.identifier.clone())
            .collect())
    }

    async fn active_recipients(&self) -> StoreResult<Vec<Company>> {
        Ok(self
            .companies
            .read()
            .await
            .iter()
            .filter(|c| c.active && c.email.as_deref().is_some_and(|e| !e.trim().is_empty()))
            .cloned()
            .collect())
    }
}
