//! HTTP client for an external placement service.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{SchedulerClient, SchedulerError};
use crate::config::SchedulerConfig;
use crate::model::{FilterProperties, HostCandidate, RequestSpec};

#[derive(Debug, Serialize)]
struct SelectDestinationsRequest<'a> {
    request_spec: &'a RequestSpec,
    filter_properties: &'a FilterProperties,
}

#[derive(Debug, Deserialize)]
struct SelectDestinationsResponse {
    destinations: Vec<HostCandidate>,
}

#[derive(Debug, Deserialize)]
struct PlacementFailure {
    #[serde(default)]
    reason: Option<String>,
}

/// Placement over `POST {placement_url}/v1/select-destinations`.
pub struct HttpSchedulerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchedulerClient {
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.placement_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    async fn select_destinations(
        &self,
        spec: &RequestSpec,
        filter: &FilterProperties,
    ) -> Result<Vec<HostCandidate>, SchedulerError> {
        let url = format!("{}/v1/select-destinations", self.base_url);
        debug!(url = %url, num_instances = spec.num_instances, "Requesting destinations");

        let response = self
            .client
            .post(&url)
            .json(&SelectDestinationsRequest {
                request_spec: spec,
                filter_properties: filter,
            })
            .send()
            .await
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: SelectDestinationsResponse = response
                .json()
                .await
                .map_err(|e| SchedulerError::Unavailable(format!("invalid response: {e}")))?;
            return Ok(body.destinations);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                let reason = serde_json::from_str::<PlacementFailure>(&body)
                    .ok()
                    .and_then(|f| f.reason)
                    .unwrap_or(body);
                Err(SchedulerError::NoValidHost { reason })
            }
            _ => {
                error!(status = %status, body = %body, "Placement request failed");
                Err(SchedulerError::Rejected {
                    status: status.as_u16(),
                    message: body,
                })
            }
        }
    }
}
