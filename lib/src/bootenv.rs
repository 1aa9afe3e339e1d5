//! Bootloader environment access.
//!
//! The bootloader and the agent share three environment variables that
//! carry the update intent across reboots. Reads and writes go through
//! the U-Boot tool pair; the tool's exit status is authoritative.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::task::Task;

/// Set to `1` while an update is staged but not yet committed.
pub(crate) const UPGRADE_AVAILABLE: &str = "upgrade_available";
/// Incremented by the bootloader on every boot attempt of a staged update.
pub(crate) const BOOTCOUNT: &str = "bootcount";
/// Partition number the bootloader should select.
pub(crate) const BOOT_PART: &str = "mender_boot_part";

/// The bootloader environment as the agent sees it.
pub(crate) trait BootEnv {
    /// Read the named variables; unset variables are absent from the result.
    fn read_env(&self, names: &[&str]) -> Result<BTreeMap<String, String>>;

    /// Write the given variables in a single transaction.
    fn set_env(&self, pairs: &[(&str, &str)]) -> Result<()>;
}

/// Production implementation driving `fw_printenv`/`fw_setenv`.
pub(crate) struct UBootEnv {
    printenv: Utf8PathBuf,
    setenv: Utf8PathBuf,
}

impl UBootEnv {
    pub(crate) fn new(printenv: Option<&Utf8Path>, setenv: Option<&Utf8Path>) -> Self {
        Self {
            printenv: printenv.unwrap_or(Utf8Path::new("fw_printenv")).to_owned(),
            setenv: setenv.unwrap_or(Utf8Path::new("fw_setenv")).to_owned(),
        }
    }
}

impl BootEnv for UBootEnv {
    #[context("Reading bootloader environment")]
    fn read_env(&self, names: &[&str]) -> Result<BTreeMap<String, String>> {
        let mut r = BTreeMap::new();
        // One invocation per variable: the tool fails wholesale when any
        // requested variable is unset, and unset must read as absent.
        for name in names {
            let out = match Task::new(format!("Reading {name}"), &self.printenv)
                .args([*name])
                .quiet()
                .read()
            {
                Ok(out) => out,
                Err(e) => {
                    tracing::debug!("{name} not set in bootloader environment: {e:#}");
                    continue;
                }
            };
            for line in out.lines() {
                if let Some((k, v)) = line.split_once('=') {
                    if k == *name {
                        r.insert(k.to_string(), v.to_string());
                    }
                }
            }
        }
        Ok(r)
    }

    #[context("Writing bootloader environment")]
    fn set_env(&self, pairs: &[(&str, &str)]) -> Result<()> {
        // `-s -` consumes a script on stdin and applies it as one
        // transaction with the tool's own locking.
        let mut script = String::new();
        for (k, v) in pairs {
            script.push_str(k);
            script.push(' ');
            script.push_str(v);
            script.push('\n');
        }
        Task::new("Updating bootloader environment", &self.setenv)
            .args(["-s", "-"])
            .stdin_data(script.into_bytes())
            .quiet()
            .quiet_output()
            .run()
            .context("fw_setenv")?;
        // Read back to detect a torn write before we rely on it
        let names = pairs.iter().map(|(k, _)| *k).collect::<Vec<_>>();
        let observed = self.read_env(&names)?;
        for (k, v) in pairs {
            if observed.get(*k).map(|s| s.as_str()) != Some(*v) {
                anyhow::bail!("bootloader environment readback mismatch for {k}");
            }
        }
        Ok(())
    }
}

/// In-memory environment used by tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryBootEnv {
    values: std::cell::RefCell<BTreeMap<String, String>>,
    fail_writes: std::cell::Cell<bool>,
}

#[cfg(test)]
impl MemoryBootEnv {
    pub(crate) fn with(pairs: &[(&str, &str)]) -> Self {
        let values = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            values: std::cell::RefCell::new(values),
            fail_writes: Default::default(),
        }
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    pub(crate) fn get(&self, name: &str) -> Option<String> {
        self.values.borrow().get(name).cloned()
    }
}

#[cfg(test)]
impl BootEnv for MemoryBootEnv {
    fn read_env(&self, names: &[&str]) -> Result<BTreeMap<String, String>> {
        let values = self.values.borrow();
        Ok(names
            .iter()
            .filter_map(|n| values.get(*n).map(|v| (n.to_string(), v.clone())))
            .collect())
    }

    fn set_env(&self, pairs: &[(&str, &str)]) -> Result<()> {
        if self.fail_writes.get() {
            anyhow::bail!("injected bootloader environment failure");
        }
        let mut values = self.values.borrow_mut();
        for (k, v) in pairs {
            values.insert(k.to_string(), v.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_env_roundtrip() {
        let env = MemoryBootEnv::with(&[(BOOT_PART, "2")]);
        env.set_env(&[(UPGRADE_AVAILABLE, "1"), (BOOTCOUNT, "0")])
            .unwrap();
        let r = env
            .read_env(&[UPGRADE_AVAILABLE, BOOTCOUNT, BOOT_PART, "other"])
            .unwrap();
        assert_eq!(r.get(UPGRADE_AVAILABLE).unwrap(), "1");
        assert_eq!(r.get(BOOTCOUNT).unwrap(), "0");
        assert_eq!(r.get(BOOT_PART).unwrap(), "2");
        assert!(!r.contains_key("other"));
    }

    #[test]
    fn test_memory_env_write_failure() {
        let env = MemoryBootEnv::default();
        env.fail_writes(true);
        assert!(env.set_env(&[(UPGRADE_AVAILABLE, "1")]).is_err());
    }
}
