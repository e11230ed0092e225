use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{DigestConfig, MailerConfig};
use crate::error::{SyncError, SyncResult};
use crate::models::{normalize_identifier, ConsolidatedChange, StageChangeEvent};
use crate::store::{EventStore, OrgDirectory};

/// Delivers one digest to one recipient. An empty `changes` slice means
/// "no changes in the period" and must still be delivered.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_digest(
        &self,
        recipient_email: &str,
        changes: &[ConsolidatedChange],
        period_label: &str,
    ) -> Result<()>;
}

/// Posts digests as JSON to a mail relay webhook
pub struct WebhookMailer {
    client: Client,
    webhook_url: String,
    sender: String,
}

#[derive(Serialize)]
struct DigestMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    period: &'a str,
    no_changes: bool,
    changes: &'a [ConsolidatedChange],
    text: String,
}

impl WebhookMailer {
    pub fn new(webhook_url: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url: webhook_url.into(),
            sender: sender.into(),
        }
    }

    /// None when the mailer is disabled or has no endpoint
    pub fn from_config(config: &MailerConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        config
            .webhook_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.sender.clone()))
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send_digest(
        &self,
        recipient_email: &str,
        changes: &[ConsolidatedChange],
        period_label: &str,
    ) -> Result<()> {
        let message = DigestMessage {
            from: &self.sender,
            to: recipient_email,
            subject: format!("Process stage updates for {}", period_label),
            period: period_label,
            no_changes: changes.is_empty(),
            changes,
            text: render_text(changes, period_label),
        };

        debug!(to = recipient_email, rows = changes.len(), "Posting digest");

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
            .context("Failed to send digest")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Digest delivery failed");
            anyhow::bail!("Mail relay returned error: {} - {}", status, body);
        }

        Ok(())
    }
}

fn render_text(changes: &[ConsolidatedChange], period_label: &str) -> String {
    if changes.is_empty() {
        return format!("No stage changes were recorded on {}.", period_label);
    }

    let rows: Vec<String> = changes
        .iter()
        .map(|c| {
            format!(
                "• {} ({}, {}): {} → {}",
                c.case_number,
                c.defendant_name,
                c.process_class,
                c.previous_client_stage,
                c.current_client_stage
            )
        })
        .collect();

    format!(
        "{} process(es) changed stage on {}:\n{}",
        changes.len(),
        period_label,
        rows.join("\n")
    )
}

/// The calendar day a digest covers, in a fixed UTC offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

impl DigestPeriod {
    /// The calendar day before the one `now` falls on at `utc_offset_hours`
    pub fn previous_day(now: DateTime<Utc>, utc_offset_hours: i32) -> SyncResult<Self> {
        if !(-23..=23).contains(&utc_offset_hours) {
            return Err(SyncError::Configuration(format!(
                "utc_offset_hours out of range: {}",
                utc_offset_hours
            )));
        }

        let offset = Duration::hours(i64::from(utc_offset_hours));
        let today = (now + offset).date_naive();
        let day = today
            .pred_opt()
            .ok_or_else(|| SyncError::Configuration(format!("no day before {}", today)))?;

        Ok(Self::for_day(day, offset))
    }

    fn for_day(day: NaiveDate, offset: Duration) -> Self {
        let start = Utc.from_utc_datetime(&(day.and_time(NaiveTime::MIN) - offset));
        Self {
            start,
            end: start + Duration::days(1),
            label: day.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Counters for one digest run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestReport {
    pub recipients: usize,
    pub sent: usize,
    pub failed: usize,
    pub events_marked: u64,
    pub purged: u64,
}

/// Daily digest of stage changes, one message per active client
pub struct DigestNotifier {
    events: Arc<dyn EventStore>,
    directory: Arc<dyn OrgDirectory>,
    mailer: Arc<dyn Mailer>,
    config: DigestConfig,
}

impl DigestNotifier {
    pub fn new(
        events: Arc<dyn EventStore>,
        directory: Arc<dyn OrgDirectory>,
        mailer: Arc<dyn Mailer>,
        config: DigestConfig,
    ) -> Self {
        Self {
            events,
            directory,
            mailer,
            config,
        }
    }

    /// Send the digest for the day before `now`. Each recipient gets every
    /// unreported event created before the end of that day, so events left
    /// over by a failed send go out on the next run. An event is marked
    /// reported only when every recipient it belongs to received it.
    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> SyncResult<DigestReport> {
        let mut report = DigestReport::default();

        let cutoff = now - Duration::days(self.config.retention_days);
        match self.events.purge_events_before(cutoff).await {
            Ok(purged) => report.purged = purged,
            Err(err) => warn!(error = %err, "Failed to purge expired events"),
        }

        let period = DigestPeriod::previous_day(now, self.config.utc_offset_hours)?;
        let recipients = self.directory.active_recipients().await?;
        let events = self.events.unreported_before(period.end).await?;

        info!(
            period = %period.label,
            recipients = recipients.len(),
            events = events.len(),
            "Starting digest run"
        );

        let mut delivered: HashSet<Uuid> = HashSet::new();
        let mut undelivered: HashSet<Uuid> = HashSet::new();

        for company in &recipients {
            let Some(email) = company
                .email
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
            else {
                continue;
            };

            let key = normalize_identifier(&company.identifier);
            let selected: Vec<&StageChangeEvent> = events
                .iter()
                .filter(|e| !key.is_empty() && normalize_identifier(&e.plaintiff_identifier) == key)
                .collect();
            let changes = consolidate(selected.iter().copied());

            report.recipients += 1;

            match self.mailer.send_digest(email, &changes, &period.label).await {
                Ok(()) => {
                    debug!(email, rows = changes.len(), "Digest sent");
                    report.sent += 1;
                    delivered.extend(selected.iter().map(|e| e.id));
                }
                Err(err) => {
                    warn!(email, identifier = %company.identifier, error = ?err, "Digest send failed");
                    report.failed += 1;
                    undelivered.extend(selected.iter().map(|e| e.id));
                }
            }
        }

        let to_mark: Vec<Uuid> = delivered.difference(&undelivered).copied().collect();
        if !to_mark.is_empty() {
            match self.events.mark_reported(&to_mark, now).await {
                Ok(marked) => report.events_marked = marked,
                Err(err) => error!(count = to_mark.len(), error = %err, "Failed to mark events reported"),
            }
        }

        info!(
            sent = report.sent,
            failed = report.failed,
            events_marked = report.events_marked,
            purged = report.purged,
            "Digest run complete"
        );

        Ok(report)
    }
}

/// Collapse events per process: the earliest previous stage, the latest
/// current stage and the latest case metadata. Rows keep the order in which
/// each process first changed.
pub fn consolidate<'a>(events: impl IntoIterator<Item = &'a StageChangeEvent>) -> Vec<ConsolidatedChange> {
    let mut ordered: Vec<&StageChangeEvent> = events.into_iter().collect();
    ordered.sort_by_key(|e| e.created_at);

    let mut rows: Vec<ConsolidatedChange> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();

    for event in ordered {
        match index.get(&event.process_id) {
            Some(&i) => {
                let row = &mut rows[i];
                row.current_client_stage = event.current_client_stage.clone();
                row.case_number = event.case_number.clone();
                row.process_class = event.process_class.clone();
                row.court_office = event.court_office.clone();
                row.defendant_name = event.defendant_name.clone();
                row.defendant_identifier = event.defendant_identifier.clone();
                row.changed_at = event.created_at;
            }
            None => {
                index.insert(event.process_id, rows.len());
                rows.push(ConsolidatedChange {
                    process_id: event.process_id,
                    case_number: event.case_number.clone(),
                    process_class: event.process_class.clone(),
                    court_office: event.court_office.clone(),
                    defendant_name: event.defendant_name.clone(),
                    defendant_identifier: event.defendant_identifier.clone(),
                    previous_client_stage: event.previous_client_stage.clone(),
                    current_client_stage: event.current_client_stage.clone(),
                    changed_at: event.created_at,
                });
            }
        }
    }

    rows
}
