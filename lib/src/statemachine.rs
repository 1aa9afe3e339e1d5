//! The deployment state machine.
//!
//! This is the decision core of the agent: it sequences download,
//! install, reboot, verify, commit and rollback, persists every
//! deployment-carrying state to the store before that state's work
//! begins, and resumes from the persisted state after a crash or
//! reboot. It is the sole mutator of the deployment state and of the
//! bootloader intent flags.
//!
//! The ordering that makes crash recovery sound: bootloader intent is
//! flipped at the end of the install step, and only then is the reboot
//! state persisted. A crash between the two leaves the persisted state
//! at install, which re-runs idempotently.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use conveyd_utils::exponential_backoff_time;
use futures_util::future::LocalBoxFuture;

use crate::deployments::ApiError;
use crate::reporter::{self, DeploymentLog};
use crate::spec::{
    ArtifactDescriptor, CurrentUpdate, DeploymentState, DeploymentStatus, StatusReport,
};
use crate::store::{Store, ARTIFACT_NAME_KEY, DEPLOYMENT_LOG_KEY, STATE_KEY};

/// What a completed install pipeline reports back.
#[derive(Debug, Default, Clone)]
pub(crate) struct InstallOutcome {
    /// The artifact's self-declared name, from the container header
    pub(crate) artifact_name: Option<String>,
    pub(crate) total_payload_bytes: u64,
}

/// Server-facing operations the machine drives, one coarse operation per
/// suspension point. The production implementation wires these to the
/// transport, the auth manager and the streaming install pipeline.
pub(crate) trait UpdateOps {
    /// Ensure the agent holds a usable token.
    fn authorize<'a>(&'a self) -> LocalBoxFuture<'a, Result<(), ApiError>>;
    /// What this device currently runs.
    fn current(&self) -> Result<CurrentUpdate>;
    fn check_update<'a>(
        &'a self,
        current: &'a CurrentUpdate,
    ) -> LocalBoxFuture<'a, Result<Option<ArtifactDescriptor>, ApiError>>;
    /// Stream the artifact onto the inactive partition, verifying as the
    /// bytes flow. Resumes interrupted transfers internally.
    fn download_and_install<'a>(
        &'a self,
        deployment: &'a ArtifactDescriptor,
    ) -> LocalBoxFuture<'a, Result<InstallOutcome, ApiError>>;
    fn report_status<'a>(
        &'a self,
        report: &'a StatusReport,
    ) -> LocalBoxFuture<'a, Result<(), ApiError>>;
    fn upload_logs<'a>(
        &'a self,
        deployment_id: &'a str,
        messages: serde_json::Value,
    ) -> LocalBoxFuture<'a, Result<(), ApiError>>;
    fn submit_inventory<'a>(&'a self) -> LocalBoxFuture<'a, Result<(), ApiError>>;
}

/// Bootloader-facing operations; see the installer for the production
/// implementation and the tests for the in-memory one.
pub(crate) trait InstallerOps {
    fn needs_reboot(&self) -> bool;
    fn enable_updated_partition(&self) -> Result<()>;
    fn commit_update(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn has_update(&self) -> Result<bool>;
    fn boot_attempted(&self) -> Result<bool>;
    fn booted_intended_partition(&self) -> Result<bool>;
}

pub(crate) trait SystemOps {
    /// Initiate a reboot; in production this does not return.
    fn reboot(&self) -> Result<()>;
}

/// Wake reasons handed to the machine by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeEvent {
    UpdateCheck,
    Inventory,
    Terminate,
}

pub(crate) trait Scheduler {
    fn wait<'a>(&'a self) -> LocalBoxFuture<'a, WakeEvent>;
}

enum StepError {
    /// Stop making progress; the persisted state is the resume point
    Paused,
    /// The process cannot continue (e.g. the store is unwritable)
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        StepError::Fatal(e)
    }
}

enum ReportOutcome {
    Sent,
    /// Parked in the store for later delivery
    Buffered,
    /// The server aborted the deployment (409)
    Aborted,
}

enum OpFailure {
    Paused,
    Failed(String),
}

pub(crate) struct StateMachine<'a> {
    ops: &'a dyn UpdateOps,
    installer: &'a dyn InstallerOps,
    system: &'a dyn SystemOps,
    scheduler: &'a dyn Scheduler,
    store: &'a Store,
    log: RefCell<DeploymentLog>,
    /// Status reports already delivered (or parked), per deployment
    sent: RefCell<BTreeSet<(String, DeploymentStatus)>>,
    retry_max: Duration,
    retry_unit: Duration,
}

impl<'a> StateMachine<'a> {
    pub(crate) fn new(
        ops: &'a dyn UpdateOps,
        installer: &'a dyn InstallerOps,
        system: &'a dyn SystemOps,
        scheduler: &'a dyn Scheduler,
        store: &'a Store,
        retry_max: Duration,
        retry_unit: Duration,
    ) -> Self {
        // Pick up log lines recorded before a reboot
        let log = store
            .read_json::<DeploymentLog>(DEPLOYMENT_LOG_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            ops,
            installer,
            system,
            scheduler,
            store,
            log: RefCell::new(log),
            sent: RefCell::new(BTreeSet::new()),
            retry_max,
            retry_unit,
        }
    }

    /// Drive the machine until termination is requested. Exit code 0
    /// corresponds to this returning `Ok`.
    pub(crate) async fn run(&self) -> Result<()> {
        // Crash/reboot recovery comes before any scheduling
        if let Some(state) = self.store.read_json::<DeploymentState>(STATE_KEY)? {
            if state != DeploymentState::Idle {
                if let Some(d) = state.deployment() {
                    tracing::info!(
                        "resuming deployment {} ({})",
                        d.deployment_id,
                        d.artifact_name
                    );
                }
                let state = self.resolve_resumed_state(state)?;
                self.run_deployment(state).await?;
            }
        }
        loop {
            match self.scheduler.wait().await {
                WakeEvent::Terminate => return Ok(()),
                WakeEvent::Inventory => {
                    if let Err(e) = self.ops.submit_inventory().await {
                        tracing::warn!("inventory submission failed: {e:#}");
                    }
                }
                WakeEvent::UpdateCheck => self.check_cycle().await?,
            }
        }
    }

    /// One authorize→check→deploy cycle.
    async fn check_cycle(&self) -> Result<()> {
        self.flush_buffered_report().await;
        match self.ops.authorize().await {
            Ok(()) => {}
            Err(ApiError::Cancelled) => return Ok(()),
            Err(e) => {
                tracing::warn!("authorization failed: {e:#}; retrying on the next poll");
                return Ok(());
            }
        }
        let current = self.ops.current()?;
        match self.ops.check_update(&current).await {
            Ok(None) => {
                tracing::debug!("no deployment scheduled");
                Ok(())
            }
            Ok(Some(deployment)) => {
                let state = self.plan_deployment(deployment, &current);
                self.run_deployment(state).await
            }
            Err(ApiError::Cancelled) => Ok(()),
            Err(e) => {
                tracing::warn!("update check failed: {e:#}");
                Ok(())
            }
        }
    }

    /// Decide how to treat a fresh deployment instruction.
    fn plan_deployment(
        &self,
        deployment: ArtifactDescriptor,
        current: &CurrentUpdate,
    ) -> DeploymentState {
        if current.artifact_name.as_deref() == Some(deployment.artifact_name.as_str()) {
            tracing::info!("artifact {} is already installed", deployment.artifact_name);
            DeploymentState::UpdateStatusReport {
                deployment,
                status: DeploymentStatus::AlreadyInstalled,
            }
        } else {
            tracing::info!(
                "accepted deployment {} ({})",
                deployment.deployment_id,
                deployment.artifact_name
            );
            DeploymentState::UpdateFetch { deployment }
        }
    }

    /// Map a persisted state across a process restart (invariant: resume
    /// at or before the crash point, consistent with the bootloader).
    fn resolve_resumed_state(&self, state: DeploymentState) -> Result<DeploymentState> {
        Ok(match state {
            DeploymentState::UpdateReboot { deployment } => {
                if !self.installer.boot_attempted()? {
                    // We persisted the reboot but died before issuing it
                    DeploymentState::UpdateReboot { deployment }
                } else if self.installer.booted_intended_partition()? {
                    DeploymentState::UpdateVerifyReboot { deployment }
                } else {
                    // The bootloader fell back to the old partition
                    DeploymentState::UpdateVerifyRollbackReboot { deployment }
                }
            }
            DeploymentState::UpdateRollbackReboot { deployment } => {
                DeploymentState::UpdateVerifyRollbackReboot { deployment }
            }
            other => other,
        })
    }

    /// Run one deployment to `Idle` (or to a pause point).
    async fn run_deployment(&self, mut state: DeploymentState) -> Result<()> {
        loop {
            if state == DeploymentState::Idle {
                self.store.remove(STATE_KEY)?;
                return Ok(());
            }
            self.store.write_json(STATE_KEY, &state)?;
            match self.step(state).await {
                Ok(next) => state = next,
                Err(StepError::Paused) => {
                    tracing::info!("deployment paused; persisted state is the resume point");
                    return Ok(());
                }
                Err(StepError::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn step(&self, state: DeploymentState) -> Result<DeploymentState, StepError> {
        use DeploymentState::*;
        use DeploymentStatus::*;
        Ok(match state {
            Idle => Idle,
            UpdateFetch { deployment } => {
                self.log_line("info", format!("downloading {}", deployment.artifact_name));
                match self.send_report(&deployment, Downloading).await? {
                    ReportOutcome::Aborted => self.abort_state(deployment),
                    _ => UpdateStore { deployment },
                }
            }
            UpdateStore { deployment } => match self.install_with_retry(&deployment).await {
                Ok(outcome) => {
                    if let Some(name) = outcome.artifact_name.as_deref() {
                        if name != deployment.artifact_name {
                            let cause = format!(
                                "artifact names itself {name} but the deployment promised {}",
                                deployment.artifact_name
                            );
                            return Ok(UpdateError { deployment, cause });
                        }
                    }
                    self.log_line(
                        "info",
                        format!("stored {} payload bytes", outcome.total_payload_bytes),
                    );
                    UpdateInstall { deployment }
                }
                Err(OpFailure::Paused) => return Err(StepError::Paused),
                Err(OpFailure::Failed(cause)) => UpdateError { deployment, cause },
            },
            UpdateInstall { deployment } => {
                match self.send_report(&deployment, Installing).await? {
                    ReportOutcome::Aborted => return Ok(self.abort_state(deployment)),
                    _ => {}
                }
                if !self.installer.needs_reboot() {
                    return Ok(UpdateCommit { deployment });
                }
                // The commit point: intent first, the reboot state is
                // persisted by the caller only after this succeeds
                match self.installer.enable_updated_partition() {
                    Ok(()) => UpdateReboot { deployment },
                    Err(e) => {
                        let cause = format!("cannot set bootloader intent: {e:#}");
                        UpdateError { deployment, cause }
                    }
                }
            }
            UpdateReboot { deployment } => {
                self.log_line("info", "rebooting into the updated partition");
                match self.send_report(&deployment, Rebooting).await? {
                    ReportOutcome::Aborted => return Ok(self.abort_state(deployment)),
                    _ => {}
                }
                match self.system.reboot() {
                    // The process is going away; resume happens after boot
                    Ok(()) => return Err(StepError::Paused),
                    Err(e) => {
                        self.log_line("error", format!("reboot failed: {e:#}"));
                        UpdateRollback { deployment }
                    }
                }
            }
            UpdateVerifyReboot { deployment } => {
                let healthy = self.installer.booted_intended_partition().unwrap_or(false)
                    && self.installer.has_update().unwrap_or(false);
                if healthy {
                    UpdateCommit { deployment }
                } else {
                    self.log_line("error", "post-reboot verification failed");
                    UpdateRollback { deployment }
                }
            }
            UpdateCommit { deployment } => match self.installer.commit_update() {
                Ok(()) => {
                    self.store
                        .write(ARTIFACT_NAME_KEY, deployment.artifact_name.as_bytes())?;
                    UpdateAfterCommit { deployment }
                }
                Err(e) => {
                    let cause = format!("cannot commit update: {e:#}");
                    UpdateError { deployment, cause }
                }
            },
            UpdateAfterCommit { deployment } => {
                self.log_line("info", format!("committed {}", deployment.artifact_name));
                UpdateStatusReport {
                    deployment,
                    status: Success,
                }
            }
            UpdateRollback { deployment } => {
                self.log_line("warn", "rolling back to the previous partition");
                match self.installer.rollback() {
                    Ok(()) => UpdateRollbackReboot { deployment },
                    Err(e) => {
                        let cause = format!("rollback failed: {e:#}");
                        UpdateError { deployment, cause }
                    }
                }
            }
            UpdateRollbackReboot { deployment } => match self.system.reboot() {
                Ok(()) => return Err(StepError::Paused),
                Err(e) => {
                    let cause = format!("rollback reboot failed: {e:#}");
                    UpdateError { deployment, cause }
                }
            },
            UpdateVerifyRollbackReboot { deployment } => {
                // Clear any leftover attempt flag so the bootloader cannot
                // retry the abandoned partition on a later reset
                if let Err(e) = self.installer.rollback() {
                    tracing::warn!("clearing bootloader intent failed: {e:#}");
                }
                UpdateError {
                    deployment,
                    cause: "update was rolled back".into(),
                }
            }
            UpdateError { deployment, cause } => {
                tracing::error!("deployment {} failed: {cause}", deployment.deployment_id);
                self.log_line("error", cause);
                UpdateStatusReport {
                    deployment,
                    status: Failure,
                }
            }
            UpdateStatusReport { deployment, status } => {
                match self.send_report(&deployment, status).await? {
                    ReportOutcome::Aborted => return Ok(self.abort_state(deployment)),
                    _ => {}
                }
                if status == Failure {
                    let messages = self.log.borrow().to_messages();
                    if !self.log.borrow().is_empty() {
                        if let Err(e) = self
                            .ops
                            .upload_logs(&deployment.deployment_id, messages)
                            .await
                        {
                            tracing::warn!("log upload failed: {e:#}");
                        }
                    }
                }
                UpdateCleanup { deployment, status }
            }
            UpdateCleanup { deployment, status } => {
                self.log.borrow_mut().clear();
                let _ = self.store.remove(DEPLOYMENT_LOG_KEY);
                self.sent
                    .borrow_mut()
                    .retain(|(id, _)| id != &deployment.deployment_id);
                tracing::info!(
                    "deployment {} finished: {status}",
                    deployment.deployment_id
                );
                Idle
            }
        })
    }

    /// Server-side abort: abandon the attempt, revert intent if it was
    /// already flipped, and clean up without a terminal report.
    fn abort_state(&self, deployment: ArtifactDescriptor) -> DeploymentState {
        tracing::warn!(
            "deployment {} aborted by the server",
            deployment.deployment_id
        );
        if self.installer.has_update().unwrap_or(false) {
            if let Err(e) = self.installer.rollback() {
                tracing::error!("reverting bootloader intent failed: {e:#}");
            }
        }
        DeploymentState::UpdateCleanup {
            deployment,
            status: DeploymentStatus::Failure,
        }
    }

    /// The install pipeline with the transient-failure retry budget.
    async fn install_with_retry(
        &self,
        deployment: &ArtifactDescriptor,
    ) -> Result<InstallOutcome, OpFailure> {
        let mut tried = 0u32;
        loop {
            match self.ops.download_and_install(deployment).await {
                Ok(outcome) => return Ok(outcome),
                Err(ApiError::Cancelled) => return Err(OpFailure::Paused),
                Err(ApiError::DeploymentAborted) => {
                    return Err(OpFailure::Failed("deployment aborted".into()))
                }
                Err(e) if e.is_transient() => {
                    let delay = match exponential_backoff_time(
                        tried,
                        self.retry_max,
                        self.retry_unit,
                    ) {
                        Ok(d) => d,
                        Err(_) => {
                            return Err(OpFailure::Failed(format!(
                                "download failed after retries: {e:#}"
                            )))
                        }
                    };
                    tried += 1;
                    tracing::warn!("download failed ({e:#}); retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(OpFailure::Failed(format!("{e:#}"))),
            }
        }
    }

    /// Deliver one status transition exactly once, retrying transient
    /// failures under the backoff budget and parking the report in the
    /// store when the budget runs out.
    async fn send_report(
        &self,
        deployment: &ArtifactDescriptor,
        status: DeploymentStatus,
    ) -> Result<ReportOutcome, StepError> {
        let key = (deployment.deployment_id.clone(), status);
        if self.sent.borrow().contains(&key) {
            return Ok(ReportOutcome::Sent);
        }
        let report = StatusReport::new(&deployment.deployment_id, status);
        let mut tried = 0u32;
        loop {
            match self.ops.report_status(&report).await {
                Ok(()) => {
                    self.sent.borrow_mut().insert(key);
                    return Ok(ReportOutcome::Sent);
                }
                Err(ApiError::DeploymentAborted) => return Ok(ReportOutcome::Aborted),
                Err(ApiError::Cancelled) => return Err(StepError::Paused),
                Err(e) if e.is_transient() => {
                    match exponential_backoff_time(tried, self.retry_max, self.retry_unit) {
                        Ok(delay) => {
                            tried += 1;
                            tracing::warn!("status report failed ({e:#}); retrying in {delay:?}");
                            tokio::time::sleep(delay).await;
                        }
                        Err(_) => {
                            reporter::buffer_report(self.store, &report)?;
                            self.sent.borrow_mut().insert(key);
                            return Ok(ReportOutcome::Buffered);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("status report rejected ({e:#}); buffering");
                    reporter::buffer_report(self.store, &report)?;
                    self.sent.borrow_mut().insert(key);
                    return Ok(ReportOutcome::Buffered);
                }
            }
        }
    }

    /// Try to deliver a report parked by an earlier cycle.
    async fn flush_buffered_report(&self) {
        let Ok(Some(buffered)) = reporter::buffered_report(self.store) else {
            return;
        };
        match self.ops.report_status(&buffered.to_report()).await {
            Ok(()) | Err(ApiError::DeploymentAborted) => {
                tracing::info!(
                    "delivered buffered {} report for deployment {}",
                    buffered.status,
                    buffered.deployment_id
                );
                let _ = reporter::clear_buffered_report(self.store);
            }
            Err(e) => tracing::debug!("buffered report still undeliverable: {e:#}"),
        }
    }

    fn log_line(&self, level: &str, message: impl Into<String>) {
        let mut log = self.log.borrow_mut();
        log.record(level, message);
        // Keep the on-disk copy current so the lines survive a reboot
        if let Err(e) = self.store.write_json(DEPLOYMENT_LOG_KEY, &*log) {
            tracing::debug!("persisting deployment log failed: {e:#}");
        }
    }
}
