//! The control loop: timers, signals, and assembly of the running agent.
//!
//! One cooperative loop on the current-thread runtime. Signals never
//! preempt a running operation; they flip wake flags that the scheduler
//! observes on its next pass, except for termination, which also fires
//! the cancellation token that in-flight requests select against.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use conveyd_utils::DEFAULT_BACKOFF_UNIT;
use fn_error_context::context;
use futures_util::future::LocalBoxFuture;
use openssl::pkey::{PKey, Public};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactReader;
use crate::auth::AuthManager;
use crate::bootenv::UBootEnv;
use crate::config::AgentConfig;
use crate::deployments::{ApiError, DeploymentsClient};
use crate::http::ApiClient;
use crate::identity::{DeviceIdentity, DeviceKey};
use crate::installer::{detect_booted_root, Installer, PartitionSink};
use crate::inventory;
use crate::spec::{ArtifactDescriptor, CurrentUpdate, StatusReport};
use crate::statemachine::{
    InstallOutcome, Scheduler, StateMachine, SystemOps, UpdateOps, WakeEvent,
};
use crate::store::{Store, ARTIFACT_NAME_KEY};

/// Wake flags shared between the signal listener task and the scheduler.
pub(crate) struct SignalFlags {
    check_now: AtomicBool,
    inventory_now: AtomicBool,
    notify: tokio::sync::Notify,
    cancel: CancellationToken,
}

impl SignalFlags {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            check_now: AtomicBool::new(false),
            inventory_now: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
            cancel,
        }
    }

    fn request_check(&self) {
        self.check_now.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn request_inventory(&self) {
        self.inventory_now.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Runs concurrently with the agent and only touches `Send` state, so it
/// can be a plain spawned task even on the current-thread runtime.
async fn signal_listener(flags: Arc<SignalFlags>) {
    use tokio::signal::unix::{signal, SignalKind};
    let (Ok(mut usr1), Ok(mut usr2), Ok(mut term)) = (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
        signal(SignalKind::terminate()),
    ) else {
        tracing::error!("cannot install signal handlers");
        return;
    };
    loop {
        tokio::select! {
            _ = usr1.recv() => {
                tracing::info!("SIGUSR1: scheduling an update check");
                flags.request_check();
            }
            _ = usr2.recv() => {
                tracing::info!("SIGUSR2: scheduling an inventory submission");
                flags.request_inventory();
            }
            _ = term.recv() => {
                tracing::info!("SIGTERM: draining to a persistable state");
                flags.cancel.cancel();
                return;
            }
        }
    }
}

/// Timer- and signal-driven wake source for the state machine.
pub(crate) struct AgentScheduler {
    flags: Arc<SignalFlags>,
    update_interval: Duration,
    inventory_interval: Duration,
    next_update: Cell<Instant>,
    next_inventory: Cell<Instant>,
}

impl AgentScheduler {
    pub(crate) fn new(
        flags: Arc<SignalFlags>,
        update_interval: Duration,
        inventory_interval: Duration,
    ) -> Self {
        // Both timers are due immediately on startup
        let now = Instant::now();
        Self {
            flags,
            update_interval,
            inventory_interval,
            next_update: Cell::new(now),
            next_inventory: Cell::new(now),
        }
    }
}

impl Scheduler for AgentScheduler {
    fn wait<'a>(&'a self) -> LocalBoxFuture<'a, WakeEvent> {
        Box::pin(async move {
            loop {
                if self.flags.cancel.is_cancelled() {
                    return WakeEvent::Terminate;
                }
                let now = Instant::now();
                if self.flags.check_now.swap(false, Ordering::SeqCst)
                    || now >= self.next_update.get()
                {
                    self.next_update.set(now + self.update_interval);
                    return WakeEvent::UpdateCheck;
                }
                if self.flags.inventory_now.swap(false, Ordering::SeqCst)
                    || now >= self.next_inventory.get()
                {
                    self.next_inventory.set(now + self.inventory_interval);
                    return WakeEvent::Inventory;
                }
                let deadline = self.next_update.get().min(self.next_inventory.get());
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.flags.notify.notified() => {}
                    _ = self.flags.cancel.cancelled() => {}
                }
            }
        })
    }
}

/// Reboot through the system command; the process does not come back.
struct SystemReboot;

impl SystemOps for SystemReboot {
    fn reboot(&self) -> Result<()> {
        crate::reboot::reboot()
    }
}

/// Production wiring of the state machine's server-facing operations.
pub(crate) struct AgentOps<'a> {
    api: &'a ApiClient,
    auth: &'a AuthManager,
    installer: &'a Installer,
    store: Rc<Store>,
    config: &'a AgentConfig,
    device_type: String,
    scripts_dir: Utf8PathBuf,
}

impl AgentOps<'_> {
    fn client(&self) -> DeploymentsClient<'_> {
        DeploymentsClient {
            api: self.api,
            reauth: Some(self.auth),
        }
    }
}

impl UpdateOps for AgentOps<'_> {
    fn authorize<'a>(&'a self) -> LocalBoxFuture<'a, Result<(), ApiError>> {
        Box::pin(async move {
            if !self.api.token().is_empty() {
                return Ok(());
            }
            let token = self
                .auth
                .obtain_token()
                .await
                .map_err(ApiError::Other)?;
            self.api.set_token(&token);
            Ok(())
        })
    }

    fn current(&self) -> Result<CurrentUpdate> {
        let artifact_name = self
            .store
            .read(ARTIFACT_NAME_KEY)?
            .map(|buf| String::from_utf8(buf).context("Stored artifact name is not UTF-8"))
            .transpose()?;
        Ok(CurrentUpdate {
            artifact_name,
            device_type: self.device_type.clone(),
            provides: Default::default(),
        })
    }

    fn check_update<'a>(
        &'a self,
        current: &'a CurrentUpdate,
    ) -> LocalBoxFuture<'a, Result<Option<ArtifactDescriptor>, ApiError>> {
        Box::pin(async move { self.client().check_update(current).await })
    }

    fn download_and_install<'a>(
        &'a self,
        deployment: &'a ArtifactDescriptor,
    ) -> LocalBoxFuture<'a, Result<InstallOutcome, ApiError>> {
        Box::pin(async move { self.download_and_install_impl(deployment).await })
    }

    fn report_status<'a>(
        &'a self,
        report: &'a StatusReport,
    ) -> LocalBoxFuture<'a, Result<(), ApiError>> {
        Box::pin(async move { self.client().report_status(report).await })
    }

    fn upload_logs<'a>(
        &'a self,
        deployment_id: &'a str,
        messages: serde_json::Value,
    ) -> LocalBoxFuture<'a, Result<(), ApiError>> {
        Box::pin(async move { self.client().upload_logs(deployment_id, &messages).await })
    }

    fn submit_inventory<'a>(&'a self) -> LocalBoxFuture<'a, Result<(), ApiError>> {
        Box::pin(async move {
            let current = self.current()?;
            let attributes = inventory::collect(self.auth.identity(), &current);
            inventory::submit(self.api, Some(self.auth), &attributes).await
        })
    }
}

impl AgentOps<'_> {
    /// The streaming pipeline: the download feeds a pipe whose blocking
    /// side parses, verifies and writes the container onto the inactive
    /// partition. The image never materializes in memory or on a spare
    /// filesystem.
    async fn download_and_install_impl(
        &self,
        deployment: &ArtifactDescriptor,
    ) -> Result<InstallOutcome, ApiError> {
        let client = self.client();
        let reader = client
            .fetch_artifact(&deployment.source_uri, self.config.retry_max_interval())
            .await?;
        tracing::info!(
            "fetching {} ({} bytes)",
            deployment.source_uri,
            reader.content_length()
        );
        let (pipe_reader, pipe_writer) = os_pipe::pipe()
            .context("Creating install pipe")
            .map_err(ApiError::Other)?;

        let device_type = self.device_type.clone();
        let verify_key = load_verify_key(self.config).map_err(ApiError::Other)?;
        let scripts_dir = self.scripts_dir.clone();
        let target = self
            .installer
            .inactive_partition()
            .map_err(ApiError::Other)?
            .to_owned();
        let install = tokio::task::spawn_blocking(move || {
            let artifact = ArtifactReader {
                device_type: &device_type,
                verify_key,
                scripts_dir: Some(&scripts_dir),
            };
            let mut sink = PartitionSink::new(target);
            artifact.read_stream(pipe_reader, &mut sink)
        });
        let drive = reader.copy_to(pipe_writer);

        let (drive_result, install_result) = tokio::join!(drive, install);
        let install_result = install_result
            .map_err(|e| ApiError::Other(anyhow!("install task failed: {e}")))?;
        match install_result {
            Ok(summary) => {
                // The parser owns correctness; a leftover tail error from
                // the download side is just the closed pipe
                if let Err(e) = drive_result {
                    tracing::debug!("download tail after completed install: {e:#}");
                }
                Ok(InstallOutcome {
                    artifact_name: summary.artifact_name,
                    total_payload_bytes: summary.total_payload_bytes,
                })
            }
            Err(parse_err) => {
                if let Err(drive_err) = drive_result {
                    if crate::http::error_is_cancelled(&drive_err) {
                        return Err(ApiError::Cancelled);
                    }
                    // The download died first; the parse failure is a symptom
                    return Err(ApiError::Other(
                        drive_err.context("download failed during install"),
                    ));
                }
                Err(ApiError::Other(parse_err))
            }
        }
    }
}

#[context("Loading artifact verification key")]
pub(crate) fn load_verify_key(config: &AgentConfig) -> Result<Option<PKey<Public>>> {
    let Some(path) = config.artifact_verify_key.as_ref() else {
        return Ok(None);
    };
    let pem = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
    let key = PKey::public_key_from_pem(&pem).with_context(|| format!("Parsing {path}"))?;
    Ok(Some(key))
}

/// Assemble the installer from configuration.
#[context("Setting up installer")]
pub(crate) fn build_installer(config: &AgentConfig) -> Result<Installer> {
    let (part_a, part_b) = match (config.rootfs_part_a.as_ref(), config.rootfs_part_b.as_ref()) {
        (Some(a), Some(b)) => (a.clone(), b.clone()),
        _ => anyhow::bail!("RootfsPartA and RootfsPartB must be configured for the daemon"),
    };
    let env = UBootEnv::new(
        config.fw_printenv_path.as_deref(),
        config.fw_setenv_path.as_deref(),
    );
    Installer::new(Box::new(env), part_a, part_b, detect_booted_root()?)
}

pub(crate) fn pidfile_path(config: &AgentConfig) -> Utf8PathBuf {
    config.data_store().join("conveyd.pid")
}

/// Run the agent until termination. Exit code 0 corresponds to `Ok`.
pub async fn run_daemon(config: &AgentConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let flags = Arc::new(SignalFlags::new(cancel.clone()));
    tokio::spawn(signal_listener(flags.clone()));

    let store = Rc::new(Store::open(&config.data_store())?);
    let api = ApiClient::new(config, cancel.clone())?;
    let key = DeviceKey::load_or_generate(&config.device_key_path())?;
    let identity = DeviceIdentity::load(config)?;
    let auth = AuthManager::new(
        api.raw_client().clone(),
        key,
        identity,
        config.servers(),
        store.clone(),
    );
    if let Some(token) = auth.cached_token()? {
        api.set_token(&token);
    }

    let installer = build_installer(config)?;
    let device_type = config.device_type()?;
    tracing::info!("agent starting; device type {device_type}");

    let pidfile = pidfile_path(config);
    if let Err(e) = std::fs::write(&pidfile, std::process::id().to_string()) {
        tracing::warn!("cannot write pidfile {pidfile}: {e}");
    }

    let ops = AgentOps {
        api: &api,
        auth: &auth,
        installer: &installer,
        store: store.clone(),
        config,
        device_type,
        scripts_dir: config.data_store().join("scripts"),
    };
    let scheduler = AgentScheduler::new(
        flags,
        config.update_poll_interval(),
        config.inventory_poll_interval(),
    );
    let system = SystemReboot;
    let machine = StateMachine::new(
        &ops,
        &installer,
        &system,
        &scheduler,
        &store,
        config.retry_max_interval(),
        DEFAULT_BACKOFF_UNIT,
    );
    let result = machine.run().await;
    let _ = std::fs::remove_file(&pidfile);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn test_scheduler_fires_due_timers_in_priority_order() {
        let flags = Arc::new(SignalFlags::new(CancellationToken::new()));
        let scheduler = AgentScheduler::new(
            flags.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        // Both are due at construction; update checks win
        assert_eq!(scheduler.wait().await, WakeEvent::UpdateCheck);
        assert_eq!(scheduler.wait().await, WakeEvent::Inventory);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_scheduler_signal_flags() {
        let flags = Arc::new(SignalFlags::new(CancellationToken::new()));
        let scheduler = AgentScheduler::new(
            flags.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        // Drain the startup firings
        scheduler.wait().await;
        scheduler.wait().await;

        flags.request_inventory();
        assert_eq!(scheduler.wait().await, WakeEvent::Inventory);
        flags.request_check();
        assert_eq!(scheduler.wait().await, WakeEvent::UpdateCheck);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_scheduler_terminate_wins() {
        let cancel = CancellationToken::new();
        let flags = Arc::new(SignalFlags::new(cancel.clone()));
        let scheduler = AgentScheduler::new(
            flags.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        cancel.cancel();
        assert_eq!(scheduler.wait().await, WakeEvent::Terminate);
    }
}
