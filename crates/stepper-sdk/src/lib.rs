//! Shared records, the persistence seam, and an asynchronous client for the
//! StepperGO dispatch service.
//!
//! The client is used by the cron trigger and by platform services that need
//! to kick off an offer broadcast without linking the dispatch crate.

pub mod models;
pub mod store;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone)]
pub struct StepperClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastOfferResponse {
    pub success: bool,
    pub trip_id: String,
    pub trip_title: String,
    pub drivers_notified: u32,
    pub eligible_drivers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceError {
    pub step: String,
    pub record_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSummary {
    pub schedules_expired: u32,
    pub schedules_applied: u32,
    pub drivers_reclaimed: u32,
    pub offers_expired: u32,
    pub errors: Vec<MaintenanceError>,
}

impl MaintenanceSummary {
    /// True when the run found nothing left to reconcile.
    pub fn is_noop(&self) -> bool {
        self.schedules_expired == 0
            && self.schedules_applied == 0
            && self.drivers_reclaimed == 0
            && self.offers_expired == 0
    }
}

impl StepperClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub async fn broadcast_offer(
        &self,
        trip_id: &str,
    ) -> Result<BroadcastOfferResponse, ClientError> {
        let url = format!("{}/trips/{}/broadcast-offer", self.base_url, trip_id);
        self.send(self.http.post(url)).await
    }

    pub async fn run_availability_maintenance(&self) -> Result<MaintenanceSummary, ClientError> {
        let url = format!("{}/cron/availability", self.base_url);
        self.send(self.http.post(url)).await
    }

    async fn send<T>(&self, request: reqwest::RequestBuilder) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let res = request.send().await?;

        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ClientError::UnexpectedStatus { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client = StepperClient::new("http://localhost:8080/").with_token("secret");
        assert_eq!(client.base_url, "http://localhost:8080");
        assert_eq!(client.token.as_deref(), Some("secret"));
    }

    #[test]
    fn summary_wire_format_is_camel_case() {
        let summary = MaintenanceSummary {
            schedules_expired: 1,
            ..MaintenanceSummary::default()
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["schedulesExpired"], 1);
        assert_eq!(value["driversReclaimed"], 0);
        assert!(!summary.is_noop());
        assert!(MaintenanceSummary::default().is_noop());
    }
}
