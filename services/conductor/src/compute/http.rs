//! Compute agent transport over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, error};

use super::{ComputeOperation, ComputeReply, ComputeRpc, ComputeRpcError};
use crate::config::ComputeAgentConfig;
use crate::error::PreCheckError;

/// Sends each operation as `POST {agent}/v1/compute/{method}`.
///
/// `202 Accepted` acknowledges a cast; `200` carries a [`ComputeReply`];
/// `422` carries a [`PreCheckError`].
///
/// Synchronous calls get a transport timeout no shorter than `call_timeout`,
/// so the caller's own bound decides when a call has timed out.
pub struct HttpComputeRpc {
    client: reqwest::Client,
    config: ComputeAgentConfig,
    call_timeout: Duration,
}

impl HttpComputeRpc {
    pub fn new(config: ComputeAgentConfig, call_timeout: Duration) -> Result<Self, ComputeRpcError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ComputeRpcError::Unreachable {
                host: "*".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            config,
            call_timeout,
        })
    }

    fn timeout_for(&self, operation: &ComputeOperation) -> Duration {
        if operation.is_call() {
            self.config.request_timeout.max(self.call_timeout)
        } else {
            self.config.request_timeout
        }
    }
}

#[async_trait]
impl ComputeRpc for HttpComputeRpc {
    async fn dispatch(
        &self,
        host: &str,
        operation: ComputeOperation,
    ) -> Result<ComputeReply, ComputeRpcError> {
        let name = operation.name();
        let url = format!(
            "{}/v1/compute/{}",
            self.config.url_for(host).trim_end_matches('/'),
            name
        );
        let timeout = self.timeout_for(&operation);
        debug!(url = %url, timeout = ?timeout, "Dispatching compute operation");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&operation)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ComputeRpcError::Timeout {
                        host: host.to_string(),
                        operation: name,
                        timeout,
                    }
                } else {
                    ComputeRpcError::Unreachable {
                        host: host.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        match status {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(ComputeReply::Accepted),
            StatusCode::OK => response
                .json::<ComputeReply>()
                .await
                .map_err(|_| ComputeRpcError::UnexpectedReply {
                    host: host.to_string(),
                    operation: name,
                }),
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                match serde_json::from_str::<PreCheckError>(&body) {
                    Ok(failure) => Err(ComputeRpcError::PreCheck {
                        host: host.to_string(),
                        failure,
                    }),
                    Err(_) => Err(ComputeRpcError::Remote {
                        host: host.to_string(),
                        operation: name.to_string(),
                        message: body,
                    }),
                }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, host, method = name, "Compute operation failed");
                Err(ComputeRpcError::Remote {
                    host: host.to_string(),
                    operation: name.to_string(),
                    message: format!("{status}: {body}"),
                })
            }
        }
    }
}
