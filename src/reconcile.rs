use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{ProcessRecord, StageChangeEvent};
use crate::provider::{ExtractItem, ProviderClient, SubjectRole};
use crate::stages::{translate_class, translate_stage, ClientStage};
use crate::store::{EventStore, Lease, ProcessStore, StoreResult};

const LEASE_NAME: &str = "reconcile";

/// Counters for one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Extract rows received
    pub rows: usize,
    /// Distinct processes after canonicalization
    pub processes: usize,
    pub malformed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub deleted: u64,
    pub events: usize,
    pub events_failed: usize,
}

/// Processes merged from the extract, keyed by process id
#[derive(Debug, Default)]
pub struct Canonical {
    pub records: BTreeMap<i64, ProcessRecord>,
    pub malformed: usize,
}

#[derive(Debug, Default)]
struct BatchTally {
    inserted: usize,
    updated: usize,
    unchanged: usize,
    failed: usize,
    events: usize,
    events_failed: usize,
}

/// Turns provider extracts into stored process records and stage events
pub struct ReconciliationEngine {
    processes: Arc<dyn ProcessStore>,
    events: Arc<dyn EventStore>,
    batch_size: usize,
    lease_ttl: Duration,
}

impl ReconciliationEngine {
    pub fn new(
        processes: Arc<dyn ProcessStore>,
        events: Arc<dyn EventStore>,
        config: &ReconcileConfig,
    ) -> Self {
        Self {
            processes,
            events,
            batch_size: config.batch_size.max(1),
            lease_ttl: Duration::seconds(config.lease_ttl_secs),
        }
    }

    /// Fetch a report from the provider and reconcile it
    #[instrument(skip(self, client))]
    pub async fn sync_report(
        &self,
        client: &ProviderClient,
        report_id: i64,
    ) -> SyncResult<ReconcileReport> {
        let rows = client.fetch_report(report_id).await?;
        self.reconcile(&rows).await
    }

    /// Reconcile a full snapshot of extract rows against the store.
    ///
    /// Holds the `reconcile` lease for the duration; an overlapping run fails
    /// with `RunInProgress`.
    pub async fn reconcile(&self, rows: &[Value]) -> SyncResult<ReconcileReport> {
        let holder = Uuid::new_v4();

        match self
            .processes
            .try_acquire_lease(LEASE_NAME, holder, self.lease_ttl)
            .await?
        {
            Lease::Acquired => {}
            Lease::HeldUntil(until) => {
                warn!(%until, "Reconciliation lease held by another run");
                return Err(SyncError::RunInProgress { until });
            }
        }

        let result = self.reconcile_locked(rows).await;

        if let Err(err) = self.processes.release_lease(LEASE_NAME, holder).await {
            warn!(error = %err, "Failed to release reconciliation lease");
        }

        result
    }

    async fn reconcile_locked(&self, rows: &[Value]) -> SyncResult<ReconcileReport> {
        let canonical = canonicalize(rows);

        let mut report = ReconcileReport {
            rows: rows.len(),
            processes: canonical.records.len(),
            malformed: canonical.malformed,
            ..Default::default()
        };

        info!(
            rows = report.rows,
            processes = report.processes,
            malformed = report.malformed,
            "Starting reconciliation"
        );

        let records: Vec<ProcessRecord> = canonical.records.into_values().collect();
        let snapshot_ids: Vec<i64> = records.iter().map(|r| r.process_id).collect();

        for (index, batch) in records.chunks(self.batch_size).enumerate() {
            match self.apply_batch(batch).await {
                Ok(tally) => {
                    report.inserted += tally.inserted;
                    report.updated += tally.updated;
                    report.unchanged += tally.unchanged;
                    report.failed += tally.failed;
                    report.events += tally.events;
                    report.events_failed += tally.events_failed;
                }
                Err(err) => {
                    warn!(batch = index, size = batch.len(), error = %err, "Batch failed, continuing");
                    report.failed += batch.len();
                }
            }
        }

        report.deleted = self.processes.delete_absent(&snapshot_ids).await?;

        info!(
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            deleted = report.deleted,
            events = report.events,
            "Reconciliation complete"
        );

        Ok(report)
    }

    async fn apply_batch(&self, batch: &[ProcessRecord]) -> StoreResult<BatchTally> {
        let ids: Vec<i64> = batch.iter().map(|r| r.process_id).collect();
        let prior: HashMap<i64, ProcessRecord> = self
            .processes
            .get_processes(&ids)
            .await?
            .into_iter()
            .map(|r| (r.process_id, r))
            .collect();

        let changed: Vec<ProcessRecord> = batch
            .iter()
            .filter(|r| prior.get(&r.process_id).map_or(true, |p| !p.same_content(r)))
            .cloned()
            .collect();

        let mut tally = BatchTally {
            unchanged: batch.len() - changed.len(),
            ..Default::default()
        };

        if changed.is_empty() {
            return Ok(tally);
        }

        let outcome = self.processes.upsert_processes(&changed).await?;
        tally.inserted = outcome.inserted.len();
        tally.updated = outcome.updated.len();
        tally.failed = outcome.failed.len();

        for (process_id, reason) in &outcome.failed {
            warn!(process_id, reason = %reason, "Skipped process record");
        }

        // Only records that reached the store may produce events; the rest
        // are detected again on the next run
        let written: HashSet<i64> = outcome.written().collect();
        let events: Vec<StageChangeEvent> = changed
            .iter()
            .filter(|r| written.contains(&r.process_id))
            .filter_map(|r| detect_transition(prior.get(&r.process_id), r))
            .collect();

        if !events.is_empty() {
            match self.events.insert_events(&events).await {
                Ok(()) => tally.events = events.len(),
                Err(err) => {
                    error!(count = events.len(), error = %err, "Failed to store stage change events");
                    tally.events_failed = events.len();
                }
            }
        }

        Ok(tally)
    }
}

/// Merge extract rows into one record per process
pub fn canonicalize(rows: &[Value]) -> Canonical {
    let mut canonical = Canonical::default();

    for (index, row) in rows.iter().enumerate() {
        let item = match ExtractItem::deserialize(row) {
            Ok(item) => item,
            Err(err) => {
                let err = SyncError::MalformedRecord(format!("row {}: {}", index, err));
                debug!(error = %err, "Skipping extract row");
                canonical.malformed += 1;
                continue;
            }
        };

        let Some(process_id) = item.process_id() else {
            let err = SyncError::MalformedRecord(format!("row {} has no usable process id", index));
            debug!(error = %err, "Skipping extract row");
            canonical.malformed += 1;
            continue;
        };

        let record = canonical
            .records
            .entry(process_id)
            .or_insert_with(|| ProcessRecord::new(process_id));
        merge_item(record, &item);
    }

    canonical
}

fn merge_item(record: &mut ProcessRecord, item: &ExtractItem) {
    overwrite(&mut record.case_number, strip_stray_quotes(&item.case_number));
    overwrite(&mut record.alternate_code, &item.alternate_code);
    overwrite(&mut record.process_class, &item.process_class);
    overwrite(&mut record.internal_stage, &item.stage);
    overwrite(&mut record.court_office, &item.court_office);
    overwrite(&mut record.plaintiff_name, &item.plaintiff_name);
    overwrite(&mut record.plaintiff_identifier, &item.plaintiff_identifier);
    overwrite(&mut record.defendant_name, &item.defendant_name);
    overwrite(&mut record.defendant_identifier, &item.defendant_identifier);

    match item.subject_role() {
        Some(SubjectRole::Plaintiff) => {
            overwrite(&mut record.plaintiff_name, &item.subject_name);
            overwrite(&mut record.plaintiff_identifier, &item.subject_identifier);
        }
        Some(SubjectRole::Defendant) => {
            overwrite(&mut record.defendant_name, &item.subject_name);
            overwrite(&mut record.defendant_identifier, &item.subject_identifier);
        }
        None => {}
    }
}

/// Last non-empty value wins
fn overwrite(field: &mut String, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        *field = value.to_string();
    }
}

fn strip_stray_quotes(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '\'' || c == '"').trim()
}

/// Whether a client-facing stage change is worth telling the client about
pub fn is_reportable(previous: &ClientStage, current: &ClientStage) -> bool {
    previous != current
        && *current != ClientStage::Termination
        && !(*previous == ClientStage::Unknown && current.is_intake())
}

/// Build the event for `next` replacing `prior`, if the change is reportable
pub fn detect_transition(
    prior: Option<&ProcessRecord>,
    next: &ProcessRecord,
) -> Option<StageChangeEvent> {
    let previous = prior.map_or(ClientStage::Unknown, |p| translate_stage(&p.internal_stage));
    let current = translate_stage(&next.internal_stage);

    if !is_reportable(&previous, &current) {
        return None;
    }

    let mut event = StageChangeEvent::new(
        next,
        previous.label().to_string(),
        current.label().to_string(),
    );
    event.process_class = translate_class(&next.process_class).label().to_string();
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonicalize_merges_roles() {
        let rows = vec![
            json!({ "id": 1, "role": "PLAINTIFF", "identifier": "900.1", "stage": "ADMISION" }),
            json!({ "id": 1, "role": "DEFENDANT", "identifier": "12345", "stage": "ADMISION" }),
        ];

        let canonical = canonicalize(&rows);
        assert_eq!(canonical.records.len(), 1);
        assert_eq!(canonical.malformed, 0);

        let record = &canonical.records[&1];
        assert_eq!(record.plaintiff_identifier, "900.1");
        assert_eq!(record.defendant_identifier, "12345");
        assert_eq!(record.internal_stage, "ADMISION");
        assert_eq!(translate_stage(&record.internal_stage).label(), "claim admitted");
    }

    #[test]
    fn test_canonicalize_strips_quotes_and_counts_malformed() {
        let rows = vec![
            json!({ "ID Proceso": 5, "Numero Radicacion": "'2023-0042", "Calidad Sujeto": "DEMANDANTE" }),
            json!({ "Calidad Sujeto": "DEMANDADO", "Sujeto Identificacion": "1" }),
            json!("not an object"),
            json!({ "ID Proceso": 5, "Etapa Procesal": "DEMANDA", "Despacho": "" }),
        ];

        let canonical = canonicalize(&rows);
        assert_eq!(canonical.malformed, 2);
        let record = &canonical.records[&5];
        assert_eq!(record.case_number, "2023-0042");
        assert_eq!(record.internal_stage, "DEMANDA");
    }

    #[test]
    fn test_canonicalize_reads_per_role_columns() {
        let rows = vec![
            json!({
                "ID Proceso": 1.0,
                "Demandante - Nombre": " Inmobiliaria Central ",
                "Demandante - Identificacion": 900123456,
                "Demandado - Nombre": "Ana Perez",
                "Demandado - Identificacion": "52.111.222",
            }),
            json!({ "ID Proceso": 1.0, "Etapa Procesal": "DEMANDA", "Demandado - Nombre": "" }),
        ];

        let canonical = canonicalize(&rows);
        assert_eq!(canonical.malformed, 0);
        let record = &canonical.records[&1];
        assert_eq!(record.plaintiff_name, "Inmobiliaria Central");
        assert_eq!(record.plaintiff_identifier, "900123456");
        assert_eq!(record.defendant_name, "Ana Perez");
        assert_eq!(record.defendant_identifier, "52.111.222");
        assert_eq!(record.internal_stage, "DEMANDA");
    }

    #[test]
    fn test_shared_fields_last_write_wins() {
        let rows = vec![
            json!({ "id": 3, "stage": "DEMANDA", "courtOffice": "Juzgado 1" }),
            json!({ "id": 3, "stage": "MANDAMIENTO" }),
        ];

        let record = &canonicalize(&rows).records[&3];
        assert_eq!(record.internal_stage, "MANDAMIENTO");
        assert_eq!(record.court_office, "Juzgado 1");
    }

    #[test]
    fn test_reportability_rules() {
        use ClientStage::*;

        assert!(is_reportable(&ClaimFiled, &PaymentOrder));
        assert!(!is_reportable(&ClaimFiled, &ClaimFiled));
        assert!(!is_reportable(&Hearing, &Termination));
        assert!(!is_reportable(&Unknown, &DocumentCollection));
        assert!(is_reportable(&DocumentCollection, &ClaimFiled));
    }

    #[test]
    fn test_internal_rename_emits_nothing() {
        let mut prior = ProcessRecord::new(9);
        prior.internal_stage = "AUDIENCIA".to_string();
        let mut next = prior.clone();
        next.internal_stage = "Audiencia Inicial".to_string();

        assert!(detect_transition(Some(&prior), &next).is_none());
    }

    #[test]
    fn test_detect_transition_labels() {
        let mut prior = ProcessRecord::new(9);
        prior.internal_stage = "DEMANDA".to_string();
        let mut next = prior.clone();
        next.internal_stage = "MANDAMIENTO DE PAGO".to_string();
        next.process_class = "EJECUTIVO SINGULAR".to_string();

        let event = detect_transition(Some(&prior), &next).unwrap();
        assert_eq!(event.previous_client_stage, "claim filed");
        assert_eq!(event.current_client_stage, "payment order");
        assert_eq!(event.process_class, "collections");
        assert!(!event.reported);
    }
}
