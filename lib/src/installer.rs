//! Writes update images to the inactive partition of the dual-rootfs
//! pair and drives the bootloader intent flags around them.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::bootenv::{BootEnv, BOOTCOUNT, BOOT_PART, UPGRADE_AVAILABLE};

/// Stream copy granularity for partition writes.
const BLOCK_SIZE: usize = 1024 * 1024;

pub(crate) struct Installer {
    env: Box<dyn BootEnv>,
    part_a: Utf8PathBuf,
    part_b: Utf8PathBuf,
    booted_root: Utf8PathBuf,
}

impl Installer {
    pub(crate) fn new(
        env: Box<dyn BootEnv>,
        part_a: Utf8PathBuf,
        part_b: Utf8PathBuf,
        booted_root: Utf8PathBuf,
    ) -> Result<Self> {
        let r = Self {
            env,
            part_a,
            part_b,
            booted_root,
        };
        // Fail at construction when the booted root is not in the pair
        r.active_partition()?;
        Ok(r)
    }

    /// The partition the bootloader selected for this boot.
    pub(crate) fn active_partition(&self) -> Result<&Utf8Path> {
        if self.booted_root == self.part_a {
            Ok(&self.part_a)
        } else if self.booted_root == self.part_b {
            Ok(&self.part_b)
        } else {
            anyhow::bail!(
                "booted root {} is neither {} nor {}",
                self.booted_root,
                self.part_a,
                self.part_b
            )
        }
    }

    /// The peer of the active partition.
    pub(crate) fn inactive_partition(&self) -> Result<&Utf8Path> {
        Ok(if self.active_partition()? == self.part_a {
            &self.part_b
        } else {
            &self.part_a
        })
    }

    /// Rootfs updates always require a reboot into the new partition.
    pub(crate) fn needs_reboot(&self) -> bool {
        true
    }

    /// Point the bootloader at the freshly written partition for the next
    /// boot. The bootloader clears the attempt by itself if the new
    /// partition never commits.
    #[context("Enabling updated partition")]
    pub(crate) fn enable_updated_partition(&self) -> Result<()> {
        let inactive = partition_number(self.inactive_partition()?)?;
        self.env.set_env(&[
            (UPGRADE_AVAILABLE, "1"),
            (BOOTCOUNT, "0"),
            (BOOT_PART, &inactive.to_string()),
        ])
    }

    /// Make the booted partition permanent.
    #[context("Committing update")]
    pub(crate) fn commit_update(&self) -> Result<()> {
        self.env.set_env(&[(UPGRADE_AVAILABLE, "0")])
    }

    /// Abandon an uncommitted update. `mender_boot_part` stays as-is: with
    /// `bootcount` nonzero and `upgrade_available` cleared the bootloader
    /// falls back to the previous partition on the next reset.
    #[context("Rolling back")]
    pub(crate) fn rollback(&self) -> Result<()> {
        self.env.set_env(&[(UPGRADE_AVAILABLE, "0")])
    }

    /// Whether an uncommitted update from a previous boot is staged.
    pub(crate) fn has_update(&self) -> Result<bool> {
        let env = self.env.read_env(&[UPGRADE_AVAILABLE])?;
        Ok(env.get(UPGRADE_AVAILABLE).map(|v| v.as_str()) == Some("1"))
    }

    /// Whether the bootloader has tried booting the staged update at least
    /// once; it increments `bootcount` on every attempt.
    pub(crate) fn boot_attempted(&self) -> Result<bool> {
        let env = self.env.read_env(&[BOOTCOUNT])?;
        Ok(matches!(env.get(BOOTCOUNT), Some(v) if v.trim() != "0" && !v.trim().is_empty()))
    }

    /// After a reboot: did the bootloader actually select the partition we
    /// pointed it at?
    pub(crate) fn booted_intended_partition(&self) -> Result<bool> {
        let env = self.env.read_env(&[BOOT_PART])?;
        let Some(intended) = env.get(BOOT_PART) else {
            anyhow::bail!("bootloader environment has no {BOOT_PART}");
        };
        let intended: u32 = intended
            .trim()
            .parse()
            .with_context(|| format!("Parsing {BOOT_PART} value {intended:?}"))?;
        Ok(intended == partition_number(self.active_partition()?)?)
    }
}

/// Stream an image to a partition device, enforcing the byte count.
#[context("Installing image to {target}")]
pub(crate) fn write_image(target: &Utf8Path, src: &mut dyn Read, expected_size: u64) -> Result<()> {
    tracing::info!("Writing {expected_size} bytes to {target}");
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(target)
        .with_context(|| format!("Opening {target}"))?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        f.write_all(&buf[..n])
            .with_context(|| format!("Writing to {target}"))?;
        written += n as u64;
        if written > expected_size {
            anyhow::bail!(
                "image exceeds advertised size: got at least {written}, expected {expected_size}"
            );
        }
    }
    if written != expected_size {
        anyhow::bail!("short image: got {written} bytes, expected {expected_size}");
    }
    f.sync_all().with_context(|| format!("Syncing {target}"))?;
    tracing::info!("Wrote {written} bytes to {target}");
    Ok(())
}

/// [`crate::artifact::PayloadSink`] writing the (single) rootfs payload
/// onto a partition device; safe to move into a blocking task.
pub(crate) struct PartitionSink {
    pub(crate) target: Utf8PathBuf,
    payloads: u32,
}

impl PartitionSink {
    pub(crate) fn new(target: Utf8PathBuf) -> Self {
        Self {
            target,
            payloads: 0,
        }
    }
}

impl crate::artifact::PayloadSink for PartitionSink {
    fn payload(&mut self, name: &str, size: u64, src: &mut dyn Read) -> Result<()> {
        if self.payloads > 0 {
            anyhow::bail!("artifact carries more than one rootfs payload");
        }
        self.payloads += 1;
        tracing::info!("writing payload {name}");
        write_image(&self.target, src, size)
    }
}

/// The bootloader-facing face of the installer, as the state machine
/// sees it.
impl crate::statemachine::InstallerOps for Installer {
    fn needs_reboot(&self) -> bool {
        Installer::needs_reboot(self)
    }
    fn enable_updated_partition(&self) -> Result<()> {
        Installer::enable_updated_partition(self)
    }
    fn commit_update(&self) -> Result<()> {
        Installer::commit_update(self)
    }
    fn rollback(&self) -> Result<()> {
        Installer::rollback(self)
    }
    fn has_update(&self) -> Result<bool> {
        Installer::has_update(self)
    }
    fn boot_attempted(&self) -> Result<bool> {
        Installer::boot_attempted(self)
    }
    fn booted_intended_partition(&self) -> Result<bool> {
        Installer::booted_intended_partition(self)
    }
}

/// The partition number is the trailing digit run of the device path,
/// e.g. `/dev/mmcblk0p3` is partition 3.
pub(crate) fn partition_number(path: &Utf8Path) -> Result<u32> {
    let s = path.as_str();
    let digits = s
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits == 0 {
        anyhow::bail!("partition path {path} has no trailing number");
    }
    Ok(s[s.len() - digits..].parse()?)
}

/// Extract the `root=` device from a kernel command line.
pub(crate) fn root_from_cmdline(cmdline: &str) -> Option<Utf8PathBuf> {
    cmdline
        .split_ascii_whitespace()
        .find_map(|arg| arg.strip_prefix("root="))
        .map(Into::into)
}

/// The device the running system was booted from.
#[context("Detecting booted root")]
pub(crate) fn detect_booted_root() -> Result<Utf8PathBuf> {
    let cmdline = std::fs::read_to_string("/proc/cmdline")?;
    root_from_cmdline(&cmdline)
        .ok_or_else(|| anyhow::anyhow!("no root= argument on the kernel command line"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootenv::MemoryBootEnv;

    fn test_installer(booted: &str) -> (std::rc::Rc<MemoryBootEnv>, Installer, tempfile::TempDir) {
        let td = tempfile::tempdir().unwrap();
        let a = Utf8PathBuf::from_path_buf(td.path().join("part2")).unwrap();
        let b = Utf8PathBuf::from_path_buf(td.path().join("part3")).unwrap();
        std::fs::write(&a, b"").unwrap();
        std::fs::write(&b, b"").unwrap();
        let env = std::rc::Rc::new(MemoryBootEnv::default());
        let booted = if booted == "a" { a.clone() } else { b.clone() };
        let installer = Installer::new(Box::new(SharedEnv(env.clone())), a, b, booted).unwrap();
        (env, installer, td)
    }

    // Lets the test keep a handle on the env owned by the installer
    struct SharedEnv(std::rc::Rc<MemoryBootEnv>);
    impl BootEnv for SharedEnv {
        fn read_env(
            &self,
            names: &[&str],
        ) -> Result<std::collections::BTreeMap<String, String>> {
            self.0.read_env(names)
        }
        fn set_env(&self, pairs: &[(&str, &str)]) -> Result<()> {
            self.0.set_env(pairs)
        }
    }

    #[test]
    fn test_partition_number() {
        assert_eq!(partition_number(Utf8Path::new("/dev/mmcblk0p3")).unwrap(), 3);
        assert_eq!(partition_number(Utf8Path::new("/dev/sda12")).unwrap(), 12);
        assert!(partition_number(Utf8Path::new("/dev/disk/by-label/root")).is_err());
    }

    #[test]
    fn test_root_from_cmdline() {
        assert_eq!(
            root_from_cmdline("console=ttyS0 root=/dev/mmcblk0p2 ro").unwrap(),
            Utf8PathBuf::from("/dev/mmcblk0p2")
        );
        assert_eq!(root_from_cmdline("console=ttyS0 ro"), None);
    }

    #[test]
    fn test_active_inactive_selection() {
        let (_env, installer, _td) = test_installer("a");
        assert!(installer.active_partition().unwrap().as_str().ends_with("part2"));
        assert!(installer
            .inactive_partition()
            .unwrap()
            .as_str()
            .ends_with("part3"));
    }

    #[test]
    fn test_booted_root_outside_pair_is_fatal() {
        let env = Box::new(MemoryBootEnv::default());
        assert!(Installer::new(
            env,
            "/dev/sda2".into(),
            "/dev/sda3".into(),
            "/dev/nvme0n1p5".into(),
        )
        .is_err());
    }

    #[test]
    fn test_write_image_checks_size() {
        let (_env, installer, _td) = test_installer("a");
        let target = installer.inactive_partition().unwrap();
        let payload = vec![7u8; 8192];
        write_image(target, &mut payload.as_slice(), 8192).unwrap();
        assert_eq!(std::fs::read(target).unwrap(), payload);

        // Short stream
        assert!(write_image(target, &mut payload.as_slice(), 10000).is_err());
        // Oversized stream
        assert!(write_image(target, &mut payload.as_slice(), 4096).is_err());
    }

    #[test]
    fn test_partition_sink_accepts_single_payload() {
        use crate::artifact::PayloadSink;
        let td = tempfile::tempdir().unwrap();
        let target = Utf8PathBuf::from_path_buf(td.path().join("part")).unwrap();
        let mut sink = PartitionSink::new(target.clone());
        let payload = b"image bytes here";
        sink.payload("rootfs.img", payload.len() as u64, &mut &payload[..])
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), payload);
        // A second rootfs payload in one artifact is malformed
        assert!(sink
            .payload("other.img", payload.len() as u64, &mut &payload[..])
            .is_err());
    }

    #[test]
    fn test_bootloader_intent_sequence() {
        let (env, installer, _td) = test_installer("a");
        assert!(!installer.has_update().unwrap());

        installer.enable_updated_partition().unwrap();
        assert_eq!(env.get(UPGRADE_AVAILABLE).unwrap(), "1");
        assert_eq!(env.get(BOOTCOUNT).unwrap(), "0");
        assert_eq!(env.get(BOOT_PART).unwrap(), "3");
        assert!(installer.has_update().unwrap());

        installer.commit_update().unwrap();
        assert_eq!(env.get(UPGRADE_AVAILABLE).unwrap(), "0");
        assert!(!installer.has_update().unwrap());
        // Rollback never flips the partition pointer
        installer.rollback().unwrap();
        assert_eq!(env.get(BOOT_PART).unwrap(), "3");
    }

    #[test]
    fn test_booted_intended_partition() {
        // Intent points at partition 3 (the "b" device); we booted "b"
        let (env, installer, _td) = test_installer("b");
        env.set_env(&[(BOOT_PART, "3")]).unwrap();
        assert!(installer.booted_intended_partition().unwrap());

        // Same intent, but the bootloader fell back to "a"
        let (env, installer, _td) = test_installer("a");
        env.set_env(&[(BOOT_PART, "3")]).unwrap();
        assert!(!installer.booted_intended_partition().unwrap());
    }
}
