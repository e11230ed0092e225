use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use case_sync::config::DigestConfig;
use case_sync::store::{EventStore, MemoryStore};
use case_sync::{
    Company, ConsolidatedChange, DigestNotifier, Mailer, ProcessRecord, StageChangeEvent,
    WebhookMailer,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Sent = (String, Vec<ConsolidatedChange>, String);

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<Sent>>,
    failing: HashSet<String>,
}

impl RecordingMailer {
    fn failing_for(email: &str) -> Self {
        Self {
            failing: [email.to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    fn sent_to(&self, email: &str) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _, _)| to == email)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_digest(
        &self,
        recipient_email: &str,
        changes: &[ConsolidatedChange],
        period_label: &str,
    ) -> anyhow::Result<()> {
        if self.failing.contains(recipient_email) {
            anyhow::bail!("relay refused {}", recipient_email);
        }
        self.sent.lock().unwrap().push((
            recipient_email.to_string(),
            changes.to_vec(),
            period_label.to_string(),
        ));
        Ok(())
    }
}

fn company(identifier: &str, email: &str, active: bool) -> Company {
    Company {
        identifier: identifier.to_string(),
        name: format!("Client {}", identifier),
        email: Some(email.to_string()),
        assigned_account_manager_email: None,
        active,
    }
}

fn event(
    process_id: i64,
    plaintiff: &str,
    prev: &str,
    cur: &str,
    at: DateTime<Utc>,
) -> StageChangeEvent {
    let mut record = ProcessRecord::new(process_id);
    record.plaintiff_identifier = plaintiff.to_string();
    record.case_number = format!("CASE-{}", process_id);
    let mut event = StageChangeEvent::new(&record, prev.to_string(), cur.to_string());
    event.created_at = at;
    event
}

/// 10:00 on 2024-03-10 at -05:00; the reported day is 2024-03-09
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap()
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_company(company("900123456-7", "a@client.co", true)).await;
    store.add_company(company("800", "b@client.co", true)).await;
    store.add_company(company("600", "c@client.co", false)).await;
    store.add_company(company("700", "d@client.co", true)).await;

    let day = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
    store
        .insert_events(&[
            event(1, "900.123.456-7", "claim filed", "payment order", day + Duration::hours(2)),
            event(1, "900.123.456-7", "payment order", "notification", day + Duration::hours(6)),
            event(2, "700", "hearing", "ruling", day),
            event(3, "900123456-7", "ruling", "liquidation", now() - Duration::days(40)),
            event(4, "900123456-7", "ruling", "liquidation", now() - Duration::hours(2)),
        ])
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn digest_consolidates_and_marks_delivered_events() {
    let store = seeded_store().await;
    let mailer = Arc::new(RecordingMailer::failing_for("d@client.co"));
    let notifier = DigestNotifier::new(
        store.clone(),
        store.clone(),
        mailer.clone(),
        DigestConfig::default(),
    );

    let report = notifier.run(now()).await.unwrap();

    assert_eq!(report.recipients, 3);
    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.events_marked, 2);
    assert_eq!(report.purged, 1);

    let to_a = mailer.sent_to("a@client.co");
    assert_eq!(to_a.len(), 1);
    let (_, rows, period) = &to_a[0];
    assert_eq!(period, "2024-03-09");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].process_id, 1);
    assert_eq!(rows[0].previous_client_stage, "claim filed");
    assert_eq!(rows[0].current_client_stage, "notification");

    // No qualifying events still means exactly one message
    let to_b = mailer.sent_to("b@client.co");
    assert_eq!(to_b.len(), 1);
    assert!(to_b[0].1.is_empty());

    assert!(mailer.sent_to("c@client.co").is_empty());

    let events = store.all_events().await;
    let reported: Vec<i64> = events
        .iter()
        .filter(|e| e.reported)
        .map(|e| e.process_id)
        .collect();
    assert_eq!(reported, vec![1, 1]);
    assert!(events.iter().all(|e| e.process_id != 3));
    assert!(events.iter().any(|e| e.process_id == 2 && !e.reported));
    assert!(events.iter().any(|e| e.process_id == 4 && !e.reported));
}

#[tokio::test]
async fn failed_recipient_is_retried_on_the_next_day() {
    let store = seeded_store().await;

    let first = DigestNotifier::new(
        store.clone(),
        store.clone(),
        Arc::new(RecordingMailer::failing_for("d@client.co")),
        DigestConfig::default(),
    );
    first.run(now()).await.unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let second = DigestNotifier::new(store.clone(), store.clone(), mailer.clone(), DigestConfig::default());
    let report = second.run(now() + Duration::days(1)).await.unwrap();

    assert_eq!(report.sent, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.events_marked, 2);

    // The change from the day before is still delivered
    let to_d = mailer.sent_to("d@client.co");
    assert_eq!(to_d.len(), 1);
    assert_eq!(to_d[0].2, "2024-03-10");
    assert_eq!(to_d[0].1.len(), 1);
    assert_eq!(to_d[0].1[0].process_id, 2);
    assert_eq!(to_d[0].1[0].current_client_stage, "ruling");

    // Already reported changes are not sent twice
    let to_a = mailer.sent_to("a@client.co");
    let ids: Vec<i64> = to_a[0].1.iter().map(|c| c.process_id).collect();
    assert_eq!(ids, vec![4]);

    assert!(store.all_events().await.iter().all(|e| e.reported));
}

#[tokio::test]
async fn same_day_rerun_sends_nothing_new() {
    let store = seeded_store().await;
    let notifier = DigestNotifier::new(
        store.clone(),
        store.clone(),
        Arc::new(RecordingMailer::default()),
        DigestConfig::default(),
    );
    notifier.run(now()).await.unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let rerun = DigestNotifier::new(store.clone(), store.clone(), mailer.clone(), DigestConfig::default());
    let report = rerun.run(now()).await.unwrap();

    assert_eq!(report.events_marked, 0);
    assert!(mailer.sent_to("a@client.co")[0].1.is_empty());
    assert!(mailer.sent_to("d@client.co")[0].1.is_empty());
}

#[tokio::test]
async fn shared_identifier_keeps_events_until_every_recipient_has_them() {
    let store = Arc::new(MemoryStore::new());
    store.add_company(company("800.555", "ok@client.co", true)).await;
    store.add_company(company("0800555", "down@client.co", true)).await;
    store
        .insert_events(&[event(
            7,
            "800555",
            "claim filed",
            "payment order",
            Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap(),
        )])
        .await
        .unwrap();

    let mailer = Arc::new(RecordingMailer::failing_for("down@client.co"));
    let notifier = DigestNotifier::new(store.clone(), store.clone(), mailer.clone(), DigestConfig::default());
    let report = notifier.run(now()).await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.events_marked, 0);
    assert_eq!(mailer.sent_to("ok@client.co")[0].1.len(), 1);
    assert!(store.all_events().await.iter().all(|e| !e.reported));
}

#[tokio::test]
async fn webhook_mailer_posts_the_digest() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .and(body_partial_json(json!({
            "from": "digest@firm.co",
            "to": "a@client.co",
            "period": "2024-03-09",
            "no_changes": true
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let mailer = WebhookMailer::new(format!("{}/send", server.uri()), "digest@firm.co");
    mailer
        .send_digest("a@client.co", &[], "2024-03-09")
        .await
        .unwrap();
}

#[tokio::test]
async fn webhook_mailer_surfaces_relay_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("relay down"))
        .mount(&server)
        .await;

    let mailer = WebhookMailer::new(format!("{}/send", server.uri()), "digest@firm.co");
    let err = mailer
        .send_digest("a@client.co", &[], "2024-03-09")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));
}
