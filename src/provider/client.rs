use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::auth::AuthTokenManager;
use super::types::{DetailEnvelope, ProcessDetail, ReportEnvelope};
use crate::error::{SyncError, SyncResult};

/// Authenticated client for the case-management provider
#[derive(Clone)]
pub struct ProviderClient {
    client: Client,
    base_url: String,
    auth: AuthTokenManager,
}

impl ProviderClient {
    pub fn new(base_url: &str, auth: AuthTokenManager) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn auth(&self) -> &AuthTokenManager {
        &self.auth
    }

    /// Fetch the flat report extract. The provider wraps the rows in a JSON
    /// string that has to be parsed a second time.
    #[instrument(skip(self))]
    pub async fn fetch_report(&self, report_id: i64) -> SyncResult<Vec<Value>> {
        let api_key = self.auth.api_key()?.to_string();

        let envelope: ReportEnvelope = self
            .get_json(
                "Informes/GetInformeJson",
                &[("token", api_key), ("informeId", report_id.to_string())],
            )
            .await?;

        let rows: Vec<Value> = serde_json::from_str(&envelope.json_string)
            .map_err(|e| SyncError::InvalidPayload(format!("report {} rows: {}", report_id, e)))?;

        info!(report_id, rows = rows.len(), "Fetched report extract");

        Ok(rows)
    }

    /// Fetch the live detail of one process
    #[instrument(skip(self))]
    pub async fn fetch_process_detail(&self, process_id: i64) -> SyncResult<Option<ProcessDetail>> {
        let envelope: DetailEnvelope = self
            .get_json("Procesos/GetProceso", &[("procesoId", process_id.to_string())])
            .await?;

        debug!(process_id, found = envelope.process.is_some(), "Fetched process detail");

        Ok(envelope.process)
    }

    /// GET with a valid token; on 401 refresh once and retry once
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> SyncResult<T> {
        let token = self.auth.get_valid_token().await?;

        match self.send(path, query, &token).await {
            Err(SyncError::UpstreamAuth(reason)) => {
                warn!(path, reason = %reason, "Provider rejected token, forcing refresh");
                let token = self.auth.force_refresh().await?;

                match self.send(path, query, &token).await {
                    Err(SyncError::UpstreamAuth(reason)) => Err(SyncError::UpstreamUnavailable(
                        format!("{} still unauthorized after token refresh: {}", path, reason),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: &str,
    ) -> SyncResult<T> {
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .query(query)
            .header(AUTHORIZATION, token)
            .send()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("{}: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::UpstreamAuth(format!("{} returned 401", path)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::UpstreamUnavailable(format!(
                "{} returned {}: {}",
                path, status, body
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::InvalidPayload(format!("{}: {}", path, e)))
    }
}
