//! The definitions for deployment state and the device-facing wire types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deployment status as reported to the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    /// Artifact bytes are being fetched
    Downloading,
    /// Artifact is being written to the inactive partition
    Installing,
    /// The device is about to reboot into the new partition
    Rebooting,
    /// Terminal: the update was committed
    Success,
    /// Terminal: the update failed or was rolled back
    Failure,
    /// Terminal: the device already runs the deployed artifact
    AlreadyInstalled,
}

impl DeploymentStatus {
    /// Whether this status ends a deployment.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::AlreadyInstalled)
    }
}

impl Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Rebooting => "rebooting",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::AlreadyInstalled => "already-installed",
        };
        f.write_str(s)
    }
}

/// What the device currently runs; sent with every update check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentUpdate {
    /// Name of the installed artifact, if known
    pub artifact_name: Option<String>,
    /// The configured device type
    pub device_type: String,
    /// Additional provides from the installed artifact
    pub provides: BTreeMap<String, String>,
}

impl CurrentUpdate {
    /// The full provides map for the update-check POST body; `artifact_name`
    /// and `device_type` are always present here even when omitted from the
    /// fallback GET query.
    pub fn post_provides(&self) -> BTreeMap<String, String> {
        let mut r = self.provides.clone();
        if let Some(name) = self.artifact_name.as_deref() {
            r.insert("artifact_name".into(), name.to_string());
        }
        r.insert("device_type".into(), self.device_type.clone());
        r
    }
}

/// The `artifact.source` object of an update-check response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct ArtifactSource {
    pub(crate) uri: Option<String>,
    pub(crate) expire: Option<DateTime<Utc>>,
}

/// The `artifact` object of an update-check response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct ArtifactInfo {
    pub(crate) artifact_name: Option<String>,
    pub(crate) source: Option<ArtifactSource>,
    #[serde(default)]
    pub(crate) device_types_compatible: BTreeSet<String>,
}

/// The raw body of a 200 update-check response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct UpdateResponse {
    pub(crate) id: Option<String>,
    pub(crate) artifact: Option<ArtifactInfo>,
}

/// A validated deployment instruction from the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    /// Server-side deployment id
    pub deployment_id: String,
    /// Name of the artifact to converge on
    pub artifact_name: String,
    /// Device types this artifact applies to
    pub device_types_compatible: BTreeSet<String>,
    /// Where to fetch the artifact container
    pub source_uri: String,
    /// Optional expiry of the source URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire: Option<DateTime<Utc>>,
}

impl TryFrom<UpdateResponse> for ArtifactDescriptor {
    type Error = anyhow::Error;

    fn try_from(r: UpdateResponse) -> Result<Self> {
        fn require(v: Option<String>, what: &str) -> Result<String> {
            match v {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(anyhow!("update response is missing {what}")),
            }
        }
        let deployment_id = require(r.id, "a deployment id")?;
        let artifact = r
            .artifact
            .ok_or_else(|| anyhow!("update response is missing the artifact object"))?;
        let artifact_name = require(artifact.artifact_name, "an artifact name")?;
        let source_uri = require(
            artifact.source.as_ref().and_then(|s| s.uri.clone()),
            "a source uri",
        )?;
        if artifact.device_types_compatible.is_empty() {
            return Err(anyhow!("update response has no compatible device types"));
        }
        Ok(Self {
            deployment_id,
            artifact_name,
            device_types_compatible: artifact.device_types_compatible,
            source_uri,
            expire: artifact.source.and_then(|s| s.expire),
        })
    }
}

/// A status report for a deployment; idempotent per (deployment, status).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    /// The deployment being reported on
    #[serde(skip)]
    pub deployment_id: String,
    /// The new status
    pub status: DeploymentStatus,
    /// Optional free-form substate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substate: Option<String>,
}

impl StatusReport {
    pub(crate) fn new(deployment_id: &str, status: DeploymentStatus) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            status,
            substate: None,
        }
    }
}

/// The persisted deployment state; every variant other than `Idle` carries
/// what is needed to resume after a crash or reboot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub(crate) enum DeploymentState {
    /// No deployment in flight
    Idle,
    /// Fetching artifact metadata and opening the download
    UpdateFetch { deployment: ArtifactDescriptor },
    /// Streaming artifact bytes to the inactive partition
    UpdateStore { deployment: ArtifactDescriptor },
    /// Finalizing the installation
    UpdateInstall { deployment: ArtifactDescriptor },
    /// Bootloader intent is set; a reboot is pending or under way
    UpdateReboot { deployment: ArtifactDescriptor },
    /// Back up after reboot on the new partition; verifying
    UpdateVerifyReboot { deployment: ArtifactDescriptor },
    /// Making the new partition permanent
    UpdateCommit { deployment: ArtifactDescriptor },
    /// Post-commit bookkeeping
    UpdateAfterCommit { deployment: ArtifactDescriptor },
    /// Abandoning the new partition
    UpdateRollback { deployment: ArtifactDescriptor },
    /// Rollback requires a reboot into the old partition
    UpdateRollbackReboot { deployment: ArtifactDescriptor },
    /// Back up after a rollback reboot; confirming the old partition
    UpdateVerifyRollbackReboot { deployment: ArtifactDescriptor },
    /// The deployment failed
    UpdateError {
        deployment: ArtifactDescriptor,
        cause: String,
    },
    /// Reporting a terminal status (and logs on failure) to the server
    UpdateStatusReport {
        deployment: ArtifactDescriptor,
        status: DeploymentStatus,
    },
    /// Removing on-disk deployment state
    UpdateCleanup {
        deployment: ArtifactDescriptor,
        status: DeploymentStatus,
    },
}

impl DeploymentState {
    /// The descriptor of the in-flight deployment, if any.
    pub(crate) fn deployment(&self) -> Option<&ArtifactDescriptor> {
        match self {
            DeploymentState::Idle => None,
            DeploymentState::UpdateFetch { deployment }
            | DeploymentState::UpdateStore { deployment }
            | DeploymentState::UpdateInstall { deployment }
            | DeploymentState::UpdateReboot { deployment }
            | DeploymentState::UpdateVerifyReboot { deployment }
            | DeploymentState::UpdateCommit { deployment }
            | DeploymentState::UpdateAfterCommit { deployment }
            | DeploymentState::UpdateRollback { deployment }
            | DeploymentState::UpdateRollbackReboot { deployment }
            | DeploymentState::UpdateVerifyRollbackReboot { deployment }
            | DeploymentState::UpdateError { deployment, .. }
            | DeploymentState::UpdateStatusReport { deployment, .. }
            | DeploymentState::UpdateCleanup { deployment, .. } => Some(deployment),
        }
    }
}
