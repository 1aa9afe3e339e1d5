//! The nested header archive: `header-info`, per-payload `type-info` and
//! `meta-data`, plus optional state scripts.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::decompress::decompress;

/// One payload slot announced by `header-info`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct PayloadInfo {
    #[serde(rename = "type")]
    pub(crate) payload_type: String,
}

/// The `header-info` document.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct HeaderInfo {
    pub(crate) payloads: Vec<PayloadInfo>,
    #[serde(default)]
    pub(crate) device_types_compatible: BTreeSet<String>,
    #[serde(default)]
    pub(crate) artifact_provides: BTreeMap<String, String>,
}

impl HeaderInfo {
    /// The artifact name, carried in the provides map.
    pub(crate) fn artifact_name(&self) -> Option<&str> {
        self.artifact_provides.get("artifact_name").map(|s| s.as_str())
    }
}

/// Per-payload `type-info`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub(crate) struct TypeInfo {
    #[serde(rename = "type", default)]
    pub(crate) payload_type: Option<String>,
    #[serde(default)]
    pub(crate) artifact_provides: BTreeMap<String, String>,
}

/// Everything parsed out of `header.tar[.gz|.xz|.zst]`.
#[derive(Debug, Default)]
pub(crate) struct Header {
    pub(crate) info: Option<HeaderInfo>,
    pub(crate) type_infos: BTreeMap<String, TypeInfo>,
    pub(crate) meta_data: BTreeMap<String, serde_json::Value>,
    /// State scripts by file name, in archive order
    pub(crate) scripts: Vec<(String, Vec<u8>)>,
}

impl Header {
    pub(crate) fn info(&self) -> Result<&HeaderInfo> {
        self.info
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("header archive has no header-info"))
    }

    /// Parse the (possibly compressed) nested header archive.
    pub(crate) fn parse(src: impl Read) -> Result<Self> {
        let mut archive = tar::Archive::new(decompress(src)?);
        let mut header = Self::default();
        let mut first = true;
        for entry in archive.entries().context("Reading header archive")? {
            let mut entry = entry.context("Reading header entry")?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.to_string_lossy().into_owned();
            // header-info leads so the reader can reject early
            if first && path != "header-info" {
                anyhow::bail!("header archive must start with header-info, found {path}");
            }
            first = false;
            match path.as_str() {
                "header-info" => {
                    let info: HeaderInfo = serde_json::from_reader(&mut entry)
                        .context("Parsing header-info")?;
                    if info.payloads.is_empty() {
                        anyhow::bail!("header-info lists no payloads");
                    }
                    header.info = Some(info);
                }
                p if p.starts_with("scripts/") => {
                    let name = p.trim_start_matches("scripts/").to_string();
                    let mut buf = Vec::new();
                    entry.read_to_end(&mut buf)?;
                    header.scripts.push((name, buf));
                }
                p if p.starts_with("headers/") && p.ends_with("/type-info") => {
                    let slot = payload_slot(p)?;
                    let ti: TypeInfo = serde_json::from_reader(&mut entry)
                        .with_context(|| format!("Parsing {p}"))?;
                    header.type_infos.insert(slot, ti);
                }
                p if p.starts_with("headers/") && p.ends_with("/meta-data") => {
                    let slot = payload_slot(p)?;
                    let mut buf = Vec::new();
                    entry.read_to_end(&mut buf)?;
                    if !buf.is_empty() {
                        let v = serde_json::from_slice(&buf)
                            .with_context(|| format!("Parsing {p}"))?;
                        header.meta_data.insert(slot, v);
                    }
                }
                other => {
                    tracing::debug!("Ignoring unknown header entry {other}");
                }
            }
        }
        // Presence is validated here so callers can rely on info()
        header.info()?;
        Ok(header)
    }
}

fn payload_slot(path: &str) -> Result<String> {
    path.split('/')
        .nth(1)
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("malformed header path {path}"))
}
