//! # Update agent CLI
//!
//! Command line tool wrapping the update agent: the daemon itself plus
//! standalone commit/rollback/install operations and signals to a
//! running daemon.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use fn_error_context::context;

use crate::artifact::{ArtifactReader, ArtifactSummary, DiscardSink};
use crate::config::{AgentConfig, DEFAULT_CONF_PATH};
use crate::installer::PartitionSink;

/// Normal termination.
pub const EXIT_OK: i32 = 0;
/// Unrecoverable error.
pub const EXIT_FATAL: i32 = 1;
/// `commit`/`rollback` found no update pending.
pub const EXIT_NOTHING_TO_COMMIT: i32 = 2;
/// An update is staged; the operator must reboot to proceed.
pub const EXIT_REBOOT_REQUIRED: i32 = 4;

/// Install an artifact without a deployment server.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    /// Path or http(s) URL of the artifact container
    pub(crate) artifact: String,
}

/// Inspect an artifact container.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ShowArtifactOpts {
    /// Path of the artifact container
    pub(crate) path: Utf8PathBuf,
}

#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum Opt {
    /// Run the update agent
    Daemon,
    /// Make an update pending verification permanent
    Commit,
    /// Abandon an uncommitted update
    Rollback,
    /// Install an artifact directly, without a deployment server
    Install(InstallOpts),
    /// Print what an artifact container carries
    ShowArtifact(ShowArtifactOpts),
    /// Ask a running daemon to check for updates now
    CheckUpdate,
    /// Ask a running daemon to submit inventory now
    SendInventory,
}

#[derive(Debug, Parser)]
#[clap(name = "conveyd", version, about = "Device update agent")]
pub(crate) struct Cli {
    /// Path of the configuration file
    #[clap(long, global = true, default_value = DEFAULT_CONF_PATH)]
    pub(crate) config: Utf8PathBuf,

    /// Log verbosity; `RUST_LOG` directives override this
    #[clap(long, global = true, default_value = "info")]
    pub(crate) log_level: tracing::Level,

    #[clap(subcommand)]
    pub(crate) cmd: Opt,
}

/// Parse the CLI and run the selected operation, returning the process
/// exit code.
pub async fn run_from_iter<I>(args: I) -> Result<i32>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    conveyd_utils::initialize_tracing(cli.log_level);
    tracing::trace!("starting");
    let config = AgentConfig::load(&cli.config)?;
    match cli.cmd {
        Opt::Daemon => {
            crate::daemon::run_daemon(&config).await?;
            Ok(EXIT_OK)
        }
        Opt::Commit => commit(&config),
        Opt::Rollback => rollback(&config),
        Opt::Install(opts) => install(&config, opts).await,
        Opt::ShowArtifact(opts) => show_artifact(opts),
        Opt::CheckUpdate => signal_daemon(&config, rustix::process::Signal::Usr1),
        Opt::SendInventory => signal_daemon(&config, rustix::process::Signal::Usr2),
    }
}

#[context("Committing")]
fn commit(config: &AgentConfig) -> Result<i32> {
    let installer = crate::daemon::build_installer(config)?;
    if !installer.has_update()? {
        eprintln!("No update pending verification");
        return Ok(EXIT_NOTHING_TO_COMMIT);
    }
    installer.commit_update()?;
    println!("Update committed; the booted partition is now permanent");
    Ok(EXIT_OK)
}

#[context("Rolling back")]
fn rollback(config: &AgentConfig) -> Result<i32> {
    let installer = crate::daemon::build_installer(config)?;
    if !installer.has_update()? {
        eprintln!("No update to roll back");
        return Ok(EXIT_NOTHING_TO_COMMIT);
    }
    installer.rollback()?;
    println!("Update abandoned; the previous partition boots on the next reset");
    Ok(EXIT_OK)
}

#[context("Installing artifact")]
async fn install(config: &AgentConfig, opts: InstallOpts) -> Result<i32> {
    let installer = crate::daemon::build_installer(config)?;
    let device_type = config.device_type()?;
    let verify_key = crate::daemon::load_verify_key(config)?;
    let scripts_dir = config.data_store().join("scripts");
    let target = installer.inactive_partition()?.to_owned();

    let summary = if opts.artifact.starts_with("http://") || opts.artifact.starts_with("https://")
    {
        let resp = reqwest::get(&opts.artifact)
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Fetching {}", opts.artifact))?;
        let (pipe_reader, pipe_writer) = os_pipe::pipe().context("Creating install pipe")?;
        let parse = tokio::task::spawn_blocking(move || {
            let artifact = ArtifactReader {
                device_type: &device_type,
                verify_key,
                scripts_dir: Some(&scripts_dir),
            };
            artifact.read_stream(pipe_reader, &mut PartitionSink::new(target))
        });
        let drive = async move {
            let mut resp = resp;
            let mut w = pipe_writer;
            while let Some(chunk) = resp.chunk().await? {
                w.write_all(&chunk)?;
            }
            anyhow::Ok(())
        };
        let (drive_result, parse_result) = tokio::join!(drive, parse);
        let summary = parse_result.context("install task failed")??;
        drive_result?;
        summary
    } else {
        let path = Utf8PathBuf::from(&opts.artifact);
        let f = std::fs::File::open(&path).with_context(|| format!("Opening {path}"))?;
        tokio::task::spawn_blocking(move || {
            let artifact = ArtifactReader {
                device_type: &device_type,
                verify_key,
                scripts_dir: Some(&scripts_dir),
            };
            artifact.read_stream(std::io::BufReader::new(f), &mut PartitionSink::new(target))
        })
        .await
        .context("install task failed")??
    };

    installer.enable_updated_partition()?;
    if let Some(name) = summary.artifact_name.as_deref() {
        println!("Installed {name}");
    }
    println!("Reboot to try the new partition, then run `conveyd commit`");
    Ok(EXIT_REBOOT_REQUIRED)
}

#[context("Reading artifact")]
fn show_artifact(opts: ShowArtifactOpts) -> Result<i32> {
    let f = std::fs::File::open(&opts.path).with_context(|| format!("Opening {}", opts.path))?;
    let artifact = ArtifactReader {
        device_type: "",
        verify_key: None,
        scripts_dir: None,
    };
    let summary = artifact.read_stream(std::io::BufReader::new(f), &mut DiscardSink)?;
    print_summary(&summary);
    Ok(EXIT_OK)
}

fn print_summary(summary: &ArtifactSummary) {
    if let Some(name) = summary.artifact_name.as_deref() {
        println!("Artifact: {name}");
    }
    let types = summary
        .device_types_compatible
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    println!("Compatible device types: {types}");
    for t in &summary.payload_types {
        println!("Payload type: {t}");
    }
    for f in &summary.files {
        println!("  {f}");
    }
    println!("Payload bytes: {}", summary.total_payload_bytes);
    if summary.script_count > 0 {
        println!("State scripts: {}", summary.script_count);
    }
    if !summary.provides.is_empty() {
        println!("Provides:");
        for (k, v) in &summary.provides {
            println!("  {k}: {v}");
        }
    }
}

/// Deliver a wake-up signal to the daemon named in the pidfile.
fn signal_daemon(config: &AgentConfig, sig: rustix::process::Signal) -> Result<i32> {
    let pidfile = crate::daemon::pidfile_path(config);
    let raw = std::fs::read_to_string(&pidfile)
        .with_context(|| format!("Reading {pidfile} (is the daemon running?)"))?;
    let pid: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("Parsing pid from {pidfile}"))?;
    let pid = rustix::process::Pid::from_raw(pid)
        .ok_or_else(|| anyhow::anyhow!("pidfile {pidfile} holds an invalid pid"))?;
    rustix::process::kill_process(pid, sig)
        .with_context(|| format!("Signalling pid {raw}"))?;
    Ok(EXIT_OK)
}
