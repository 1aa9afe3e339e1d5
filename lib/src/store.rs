//! Crash-safe single-value store backing state machine checkpoints.
//!
//! Each key is one file in the store directory; writes go through a
//! tempfile, an fsync, and an atomic rename followed by a directory
//! fsync, so a reader observes either the previous value or the new
//! one and never a torn write.

use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialized [`crate::spec::DeploymentState`].
pub(crate) const STATE_KEY: &str = "state";
/// The current bearer token.
pub(crate) const AUTH_TOKEN_KEY: &str = "auth-token";
/// Name of the artifact running on the active partition.
pub(crate) const ARTIFACT_NAME_KEY: &str = "artifact-name";
/// A status report that could not be delivered yet.
pub(crate) const PENDING_REPORT_KEY: &str = "pending-report";
/// Captured installer log lines for the in-flight deployment.
pub(crate) const DEPLOYMENT_LOG_KEY: &str = "deployment-log";

pub(crate) struct Store {
    dir: Dir,
}

impl Store {
    #[context("Opening store {path}")]
    pub(crate) fn open(path: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(path).with_context(|| format!("Creating {path}"))?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self { dir })
    }

    pub(crate) fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.dir.read(key) {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading store key {key}")),
        }
    }

    #[context("Writing store key {key}")]
    pub(crate) fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.dir
            .atomic_replace_with(key, |w| -> Result<()> {
                w.write_all(value)?;
                w.flush()?;
                // The data must hit the disk before the rename commits it
                w.get_mut().as_file_mut().sync_all()?;
                Ok(())
            })?;
        self.sync_dir()?;
        Ok(())
    }

    /// fsync the store directory itself.
    ///
    /// `cap_std::fs::Dir` is opened with `O_PATH`, which cannot be fsynced
    /// directly, so a non-`O_PATH` copy of the fd is required.
    fn sync_dir(&self) -> Result<()> {
        let fd = self
            .dir
            .reopen_as_ownedfd()
            .context("Reopening store directory for sync")?;
        rustix::fs::fsync(&fd).context("Syncing store directory")?;
        Ok(())
    }

    /// Remove a key; absent keys are fine.
    pub(crate) fn remove(&self, key: &str) -> Result<bool> {
        match self.dir.remove_file(key) {
            Ok(()) => {
                self.sync_dir()?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Removing store key {key}")),
        }
    }

    pub(crate) fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(buf) = self.read(key)? else {
            return Ok(None);
        };
        let v = serde_json::from_slice(&buf)
            .with_context(|| format!("Parsing store key {key}"))?;
        Ok(Some(v))
    }

    pub(crate) fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.write(key, &serde_json::to_vec(value)?)
    }
}
