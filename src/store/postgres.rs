use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BatchWrite, EventStore, Lease, OrgDirectory, ProcessPage, ProcessQuery, ProcessStore,
    StoreError, StoreResult, SubjectScope, TokenStore,
};
use crate::models::{
    normalize_email, Company, ExternalToken, ProcessRecord, Region, Role, SalesTeam,
    StageChangeEvent,
};

const PROCESS_COLUMNS: &str = "process_id, case_number, alternate_code, process_class, \
     internal_stage, court_office, plaintiff_name, plaintiff_identifier, defendant_name, \
     defendant_identifier, updated_at";

const EVENT_COLUMNS: &str = "id, process_id, case_number, process_class, court_office, \
     plaintiff_identifier, defendant_name, defendant_identifier, previous_client_stage, \
     current_client_stage, reported, reported_at, created_at";

/// PostgreSQL-backed store for production persistence
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with the given connection string
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations complete");

        Ok(())
    }

    /// Insert or replace a sales team
    pub async fn save_team(&self, team: &SalesTeam) -> StoreResult<()> {
        let subordinates: Vec<String> = team
            .subordinate_emails
            .iter()
            .map(|e| normalize_email(e))
            .collect();

        sqlx::query(
            r#"
            INSERT INTO sales_teams (lead_email, lead_role, subordinate_emails, region)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lead_email) DO UPDATE SET
                lead_role = EXCLUDED.lead_role,
                subordinate_emails = EXCLUDED.subordinate_emails,
                region = EXCLUDED.region
            "#,
        )
        .bind(normalize_email(&team.lead_email))
        .bind(team.lead_role.as_str())
        .bind(&subordinates)
        .bind(team.region.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_one(&self, record: &ProcessRecord) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO process_records (
                process_id, case_number, alternate_code, process_class, internal_stage,
                court_office, plaintiff_name, plaintiff_identifier, defendant_name,
                defendant_identifier, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (process_id) DO UPDATE SET
                case_number = EXCLUDED.case_number,
                alternate_code = EXCLUDED.alternate_code,
                process_class = EXCLUDED.process_class,
                internal_stage = EXCLUDED.internal_stage,
                court_office = EXCLUDED.court_office,
                plaintiff_name = EXCLUDED.plaintiff_name,
                plaintiff_identifier = EXCLUDED.plaintiff_identifier,
                defendant_name = EXCLUDED.defendant_name,
                defendant_identifier = EXCLUDED.defendant_identifier,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(record.process_id)
        .bind(&record.case_number)
        .bind(&record.alternate_code)
        .bind(&record.process_class)
        .bind(&record.internal_stage)
        .bind(&record.court_office)
        .bind(&record.plaintiff_name)
        .bind(&record.plaintiff_identifier)
        .bind(&record.defendant_name)
        .bind(&record.defendant_identifier)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("inserted"))
    }
}

#[async_trait]
impl TokenStore for PostgresStore {
    async fn current_token(&self) -> StoreResult<Option<ExternalToken>> {
        let row = sqlx::query("SELECT token, expires_at FROM external_tokens WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| ExternalToken {
            token: row.get("token"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn replace_token(&self, token: &ExternalToken) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM external_tokens")
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO external_tokens (id, token, expires_at) VALUES (1, $1, $2)")
            .bind(&token.token)
            .bind(token.expires_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(expires_at = %token.expires_at, "Stored provider token");

        Ok(())
    }
}

#[async_trait]
impl ProcessStore for PostgresStore {
    async fn get_process(&self, process_id: i64) -> StoreResult<Option<ProcessRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PROCESS_COLUMNS} FROM process_records WHERE process_id = $1"
        ))
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(process_from_row))
    }

    async fn get_processes(&self, process_ids: &[i64]) -> StoreResult<Vec<ProcessRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROCESS_COLUMNS} FROM process_records WHERE process_id = ANY($1)"
        ))
        .bind(process_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(process_from_row).collect())
    }

    async fn upsert_processes(&self, records: &[ProcessRecord]) -> StoreResult<BatchWrite> {
        let mut outcome = BatchWrite::default();

        // One statement per record so a bad row cannot roll back its neighbours
        for record in records {
            match self.upsert_one(record).await {
                Ok(true) => outcome.inserted.push(record.process_id),
                Ok(false) => outcome.updated.push(record.process_id),
                Err(err) => {
                    warn!(process_id = record.process_id, error = %err, "Process upsert failed");
                    outcome.failed.push((record.process_id, err.to_string()));
                }
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
        let result = sqlx::query("DELETE FROM process_records WHERE NOT (process_id = ANY($1))")
            .bind(keep)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn query_processes(&self, query: &ProcessQuery) -> StoreResult<ProcessPage> {
        let pattern = query.text.as_deref().map(like_pattern);
        let restricted = query.scope.is_some();
        let identifiers = query
            .scope
            .as_ref()
            .map(|scope| scope.identifiers.clone())
            .unwrap_or_default();
        let keys = query.scope.as_ref().map(SubjectScope::keys).unwrap_or_default();
        let requester_key = query.scope.as_ref().and_then(|scope| scope.requester_key.clone());
        let min_digits = query
            .scope
            .as_ref()
            .map_or(0, |scope| i32::try_from(scope.min_fuzzy_digits).unwrap_or(i32::MAX));

        // Mirrors SubjectScope::admits
        let filter = r#"
            WHERE ($1::text IS NULL
                OR plaintiff_identifier ILIKE $1
                OR defendant_identifier ILIKE $1
                OR case_number ILIKE $1
                OR alternate_code ILIKE $1)
              AND (NOT $2
                OR plaintiff_identifier = ANY($3)
                OR defendant_identifier = ANY($3)
                OR plaintiff_key = ANY($4)
                OR defendant_key = ANY($4)
                OR ($5::text IS NOT NULL AND (
                    (plaintiff_key <> '' AND (plaintiff_key = $5
                        OR (length(plaintiff_key) >= $6 AND length($5) >= $6
                            AND (strpos(plaintiff_key, $5) > 0 OR strpos($5, plaintiff_key) > 0))))
                    OR (defendant_key <> '' AND (defendant_key = $5
                        OR (length(defendant_key) >= $6 AND length($5) >= $6
                            AND (strpos(defendant_key, $5) > 0 OR strpos($5, defendant_key) > 0)))))))
        "#;

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM process_records {filter}"))
            .bind(&pattern)
            .bind(restricted)
            .bind(&identifiers)
            .bind(&keys)
            .bind(&requester_key)
            .bind(min_digits)
            .fetch_one(&self.pool)
            .await?
            .get("total");

        let rows = sqlx::query(&format!(
            "SELECT {PROCESS_COLUMNS} FROM process_records {filter} \
             ORDER BY process_id LIMIT $7 OFFSET $8"
        ))
        .bind(&pattern)
        .bind(restricted)
        .bind(&identifiers)
        .bind(&keys)
        .bind(&requester_key)
        .bind(min_digits)
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ProcessPage {
            records: rows.iter().map(process_from_row).collect(),
            total: total as usize,
        })
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> StoreResult<Lease> {
        let acquired = sqlx::query(
            r#"
            INSERT INTO sync_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE sync_leases.expires_at < now() OR sync_leases.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(Utc::now() + ttl)
        .fetch_optional(&self.pool)
        .await?;

        if acquired.is_some() {
            return Ok(Lease::Acquired);
        }

        let until: DateTime<Utc> = sqlx::query("SELECT expires_at FROM sync_leases WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?
            .get("expires_at");

        Ok(Lease::HeldUntil(until))
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_events(&self, events: &[StageChangeEvent]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            sqlx::query(&format!(
                "INSERT INTO stage_change_events ({EVENT_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
            ))
            .bind(event.id)
            .bind(event.process_id)
            .bind(&event.case_number)
            .bind(&event.process_class)
            .bind(&event.court_office)
            .bind(&event.plaintiff_identifier)
            .bind(&event.defendant_name)
            .bind(&event.defendant_identifier)
            .bind(&event.previous_client_stage)
            .bind(&event.current_client_stage)
            .bind(event.reported)
            .bind(event.reported_at)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn unreported_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<StageChangeEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM stage_change_events \
             WHERE reported = FALSE AND created_at < $1 \
             ORDER BY created_at"
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(event_from_row).collect())
    }

    async fn mark_reported(&self, ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stage_change_events
            SET reported = TRUE, reported_at = $2
            WHERE id = ANY($1) AND reported = FALSE
            "#,
        )
        .bind(ids)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM stage_change_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OrgDirectory for PostgresStore {
    async fn find_team_by_lead(&self, lead_email: &str) -> StoreResult<Option<SalesTeam>> {
        let row = sqlx::query(
            r#"
            SELECT lead_email, lead_role, subordinate_emails, region
            FROM sales_teams WHERE lead_email = $1
            "#,
        )
        .bind(normalize_email(lead_email))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let lead_role: String = row.get("lead_role");
        let region: String = row.get("region");

        Ok(Some(SalesTeam {
            lead_email: row.get("lead_email"),
            lead_role: Role::parse(&lead_role)
                .ok_or_else(|| StoreError::InvalidValue(format!("lead role {:?}", lead_role)))?,
            subordinate_emails: row.get("subordinate_emails"),
            region: Region::parse(&region)
                .ok_or_else(|| StoreError::InvalidValue(format!("region {:?}", region)))?,
        }))
    }

    async fn identifiers_assigned_to(&self, manager_emails: &[String]) -> StoreResult<Vec<String>> {
        let emails: Vec<String> = manager_emails.iter().map(|e| normalize_email(e)).collect();

        let rows = sqlx::query(
            "SELECT identifier FROM companies WHERE lower(assigned_account_manager_email) = ANY($1)",
        )
        .bind(&emails)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("identifier")).collect())
    }

    async fn active_recipients(&self) -> StoreResult<Vec<Company>> {
        let rows = sqlx::query(
            r#"
            SELECT identifier, name, email, assigned_account_manager_email, active
            FROM companies
            WHERE active = TRUE AND email IS NOT NULL AND email <> ''
            ORDER BY identifier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Company {
                identifier: row.get("identifier"),
                name: row.get("name"),
                email: row.get("email"),
                assigned_account_manager_email: row.get("assigned_account_manager_email"),
                active: row.get("active"),
            })
            .collect())
    }
}

fn process_from_row(row: &PgRow) -> ProcessRecord {
    ProcessRecord {
        process_id: row.get("process_id"),
        case_number: row.get("case_number"),
        alternate_code: row.get("alternate_code"),
        process_class: row.get("process_class"),
        internal_stage: row.get("internal_stage"),
        court_office: row.get("court_office"),
        plaintiff_name: row.get("plaintiff_name"),
        plaintiff_identifier: row.get("plaintiff_identifier"),
        defendant_name: row.get("defendant_name"),
        defendant_identifier: row.get("defendant_identifier"),
        updated_at: row.get("updated_at"),
    }
}

fn event_from_row(row: &PgRow) -> StageChangeEvent {
    StageChangeEvent {
        id: row.get("id"),
        process_id: row.get("process_id"),
        case_number: row.get("case_number"),
        process_class: row.get("process_class"),
        court_office: row.get("court_office"),
        plaintiff_identifier: row.get("plaintiff_identifier"),
        defendant_name: row.get("defendant_name"),
        defendant_identifier: row.get("defendant_identifier"),
        previous_client_stage: row.get("previous_client_stage"),
        current_client_stage: row.get("current_client_stage"),
        reported: row.get("reported"),
        reported_at: row.get("reported_at"),
        created_at: row.get("created_at"),
    }
}

/// Wrap a search term for ILIKE, escaping its wildcards
fn like_pattern(term: &str) -> String {
    let escaped = term
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}
