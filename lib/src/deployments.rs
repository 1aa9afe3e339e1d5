//! The deployment-facing device API: update checks, artifact fetch,
//! status reports and log upload.

use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use crate::download::ResumableReader;
use crate::http::{ApiClient, ApiRequest, HttpError, Reauthorizer};
use crate::spec::{ArtifactDescriptor, CurrentUpdate, StatusReport, UpdateResponse};

pub(crate) const DEPLOYMENTS_NEXT_PATH: &str =
    "/api/devices/v1/deployments/device/deployments/next";

/// Anything shorter than this cannot be a real image.
pub(crate) const MIN_IMAGE_SIZE: u64 = 4096;

fn status_path(deployment_id: &str) -> String {
    format!("/api/devices/v1/deployments/device/deployments/{deployment_id}/status")
}

fn log_path(deployment_id: &str) -> String {
    format!("/api/devices/v1/deployments/device/deployments/{deployment_id}/log")
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    /// The token was rejected and reauthorization did not help
    #[error("not authorized")]
    NotAuthorized,
    /// The server aborted this deployment (409 on the status endpoint)
    #[error("deployment aborted by the server")]
    DeploymentAborted,
    /// Shutdown was requested while the request was in flight
    #[error("operation cancelled")]
    Cancelled,
    /// Connection-level failure; worth retrying
    #[error(transparent)]
    Transport(HttpError),
    /// The server answered, but not with anything usable
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<HttpError> for ApiError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Cancelled => ApiError::Cancelled,
            other => ApiError::Transport(other),
        }
    }
}

impl ApiError {
    /// Errors that a backoff-and-retry loop may absorb.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

/// Borrow of the transport plus the reauthorization hook.
pub(crate) struct DeploymentsClient<'a> {
    pub(crate) api: &'a ApiClient,
    pub(crate) reauth: Option<&'a dyn Reauthorizer>,
}

impl DeploymentsClient<'_> {
    /// Ask whether a deployment is scheduled for this device.
    ///
    /// Prefers POSTing the provides map; falls back to the legacy GET
    /// form when the server rejects the POST with a non-auth 4xx.
    pub(crate) async fn check_update(
        &self,
        current: &CurrentUpdate,
    ) -> Result<Option<ArtifactDescriptor>, ApiError> {
        let body = serde_json::to_vec(&current.post_provides())
            .context("Serializing update check")?;
        let resp = self
            .api
            .dispatch(&ApiRequest::post(DEPLOYMENTS_NEXT_PATH, body), self.reauth)
            .await?;
        let resp = match resp.status().as_u16() {
            401 => return Err(ApiError::NotAuthorized),
            s if (400..500).contains(&s) => {
                tracing::debug!("update check POST returned {s}, falling back to GET");
                let mut req = ApiRequest::get(DEPLOYMENTS_NEXT_PATH)
                    .query("device_type", &current.device_type);
                if let Some(name) = current.artifact_name.as_deref() {
                    if !name.is_empty() {
                        req = req.query("artifact_name", name);
                    }
                }
                self.api.dispatch(&req, self.reauth).await?
            }
            _ => resp,
        };
        match resp.status().as_u16() {
            200 => {
                let raw: UpdateResponse = resp
                    .json()
                    .await
                    .map_err(|e| ApiError::Protocol(format!("bad update response: {e}")))?;
                let descriptor = ArtifactDescriptor::try_from(raw)
                    .map_err(|e| ApiError::Protocol(format!("{e:#}")))?;
                Ok(Some(descriptor))
            }
            204 => Ok(None),
            401 => Err(ApiError::NotAuthorized),
            s => Err(ApiError::Protocol(format!("update check returned {s}"))),
        }
    }

    /// Open the artifact download and wrap it for resumption.
    pub(crate) async fn fetch_artifact(
        &self,
        uri: &str,
        max_retry_interval: Duration,
    ) -> Result<ResumableReader<'_>, ApiError> {
        let req = ApiRequest::get_absolute(uri);
        let resp = self.api.dispatch(&req, self.reauth).await?;
        if resp.status().as_u16() != 200 {
            return Err(ApiError::Protocol(format!(
                "artifact fetch from {uri} returned {}",
                resp.status().as_u16()
            )));
        }
        let length = resp.content_length().ok_or_else(|| {
            ApiError::Protocol(format!("artifact at {uri} has unknown length"))
        })?;
        if length < MIN_IMAGE_SIZE {
            return Err(ApiError::Protocol(format!(
                "artifact of {length} bytes is below the {MIN_IMAGE_SIZE} byte minimum"
            )));
        }
        Ok(ResumableReader::new(
            self.api,
            req,
            resp,
            length,
            max_retry_interval,
        ))
    }

    /// Report one status transition. 409 means the server aborted the
    /// deployment; the caller unwinds.
    pub(crate) async fn report_status(&self, report: &StatusReport) -> Result<(), ApiError> {
        let body = serde_json::to_vec(report).context("Serializing status report")?;
        let resp = self
            .api
            .dispatch(
                &ApiRequest::put(status_path(&report.deployment_id), body),
                self.reauth,
            )
            .await?;
        match resp.status().as_u16() {
            204 => Ok(()),
            401 => Err(ApiError::NotAuthorized),
            409 => Err(ApiError::DeploymentAborted),
            s => Err(ApiError::Protocol(format!("status report returned {s}"))),
        }
    }

    /// Upload captured deployment logs.
    pub(crate) async fn upload_logs(
        &self,
        deployment_id: &str,
        messages: &serde_json::Value,
    ) -> Result<(), ApiError> {
        let body = serde_json::to_vec(&json!({ "messages": messages }))
            .context("Serializing logs")?;
        let resp = self
            .api
            .dispatch(&ApiRequest::put(log_path(deployment_id), body), self.reauth)
            .await?;
        match resp.status().as_u16() {
            204 => Ok(()),
            401 => Err(ApiError::NotAuthorized),
            s => Err(ApiError::Protocol(format!("log upload returned {s}"))),
        }
    }
}
