//! Streaming reader of the update artifact container.
//!
//! The container is an uncompressed outer tar whose entry order is part
//! of the format: `version`, `manifest`, optional `manifest.sig`, the
//! nested `header.tar[.gz|.xz|.zst]`, then one or more `data/NNNN.tar[...]`
//! payload archives. Payload bytes are handed to a [`PayloadSink`] as they
//! stream; checksums and the manifest signature are verified on the fly so
//! the full image never materializes in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::sign::Verifier;
use serde::Deserialize;

pub(crate) mod decompress;
pub(crate) mod header;
pub(crate) mod manifest;

use header::Header;
use manifest::{ChecksumReader, Manifest};

const VERSION_ENTRY: &str = "version";
const MANIFEST_ENTRY: &str = "manifest";
const SIGNATURE_ENTRY: &str = "manifest.sig";
const HEADER_PREFIX: &str = "header.tar";
const DATA_PREFIX: &str = "data/";

/// The container format version this reader understands.
const SUPPORTED_VERSION: u32 = 3;
/// Bound on the buffered metadata entries (version, manifest, signature).
const MAX_META_ENTRY_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct VersionInfo {
    format: String,
    version: u32,
}

/// Receives payload files as they stream out of the container.
pub(crate) trait PayloadSink {
    fn payload(&mut self, name: &str, size: u64, src: &mut dyn Read) -> Result<()>;
}

/// A sink that drains and discards, for metadata-only reads.
pub(crate) struct DiscardSink;

impl PayloadSink for DiscardSink {
    fn payload(&mut self, _name: &str, _size: u64, src: &mut dyn Read) -> Result<()> {
        std::io::copy(src, &mut std::io::sink())?;
        Ok(())
    }
}

/// What was learned about an accepted artifact.
#[derive(Debug, Default)]
pub(crate) struct ArtifactSummary {
    pub(crate) artifact_name: Option<String>,
    pub(crate) payload_types: Vec<String>,
    pub(crate) device_types_compatible: BTreeSet<String>,
    pub(crate) provides: BTreeMap<String, String>,
    pub(crate) files: Vec<String>,
    pub(crate) total_payload_bytes: u64,
    pub(crate) script_count: usize,
}

/// Configuration for one streaming read.
pub(crate) struct ArtifactReader<'a> {
    /// The device type the artifact must be compatible with
    pub(crate) device_type: &'a str,
    /// When set, `manifest.sig` is mandatory and must verify against it
    pub(crate) verify_key: Option<PKey<Public>>,
    /// When set, state scripts from the header are stored here
    pub(crate) scripts_dir: Option<&'a Utf8Path>,
}

enum Stage {
    Version,
    Manifest,
    Header,
    Data,
}

impl ArtifactReader<'_> {
    /// Stream the container from `src`, handing payload files to `sink`.
    ///
    /// Enforces entry order, per-entry checksums, the manifest signature
    /// (before any data is accepted), and device-type compatibility
    /// (before any payload byte reaches the sink).
    #[context("Reading artifact")]
    pub(crate) fn read_stream(
        &self,
        src: impl Read,
        sink: &mut dyn PayloadSink,
    ) -> Result<ArtifactSummary> {
        let mut archive = tar::Archive::new(src);
        let mut stage = Stage::Version;
        let mut version_bytes: Vec<u8> = Vec::new();
        let mut manifest_raw: Vec<u8> = Vec::new();
        let mut manifest: Option<Manifest> = None;
        let mut signature_verified = false;
        let mut summary = ArtifactSummary::default();
        let mut data_entries = 0usize;

        for entry in archive.entries().context("Reading container")? {
            let mut entry = entry.context("Reading container entry")?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.to_string_lossy().into_owned();
            match path.as_str() {
                VERSION_ENTRY => {
                    if !matches!(stage, Stage::Version) {
                        anyhow::bail!("unexpected {VERSION_ENTRY} entry");
                    }
                    version_bytes = read_meta_entry(&mut entry, VERSION_ENTRY)?;
                    let info: VersionInfo = serde_json::from_slice(&version_bytes)
                        .context("Parsing version entry")?;
                    if info.format.is_empty() {
                        anyhow::bail!("version entry has an empty format field");
                    }
                    if info.version != SUPPORTED_VERSION {
                        anyhow::bail!(
                            "unsupported artifact format version {} (supported: {SUPPORTED_VERSION})",
                            info.version
                        );
                    }
                    stage = Stage::Manifest;
                }
                MANIFEST_ENTRY => {
                    if !matches!(stage, Stage::Manifest) {
                        anyhow::bail!("{MANIFEST_ENTRY} must follow {VERSION_ENTRY}");
                    }
                    let raw = read_meta_entry(&mut entry, MANIFEST_ENTRY)?;
                    let parsed = Manifest::parse(&raw)?;
                    // The version entry streamed before the manifest existed;
                    // settle its digest now.
                    let version_digest = openssl::sha::sha256(&version_bytes);
                    if parsed.digest_for(VERSION_ENTRY)? != version_digest {
                        anyhow::bail!("checksum mismatch for {VERSION_ENTRY}");
                    }
                    manifest = Some(parsed);
                    // The raw bytes are what the signature covers
                    manifest_raw = raw;
                    stage = Stage::Header;
                }
                SIGNATURE_ENTRY => {
                    if !matches!(stage, Stage::Header) || signature_verified {
                        anyhow::bail!("unexpected {SIGNATURE_ENTRY} entry");
                    }
                    let sig = read_meta_entry(&mut entry, SIGNATURE_ENTRY)?;
                    match self.verify_key.as_ref() {
                        Some(key) => {
                            verify_manifest_signature(key, &manifest_raw, &sig)?;
                            signature_verified = true;
                        }
                        None => {
                            tracing::warn!(
                                "artifact carries {SIGNATURE_ENTRY} but no verification key is configured"
                            );
                        }
                    }
                }
                p if p.starts_with(HEADER_PREFIX) => {
                    if !matches!(stage, Stage::Header) {
                        anyhow::bail!("unexpected header entry {p}");
                    }
                    if self.verify_key.is_some() && !signature_verified {
                        anyhow::bail!(
                            "artifact is unsigned but signature verification is required"
                        );
                    }
                    // SAFETY: stage Header implies the manifest was parsed
                    let manifest = manifest.as_ref().unwrap();
                    let digest = manifest.digest_for(&path)?;
                    let mut checked = ChecksumReader::new(&mut entry, &path, digest);
                    let header = Header::parse(&mut checked)?;
                    checked.verify()?;
                    self.accept_header(&header, &mut summary)?;
                    stage = Stage::Data;
                }
                p if p.starts_with(DATA_PREFIX) => {
                    if !matches!(stage, Stage::Data) {
                        anyhow::bail!("payload entry {p} before the header");
                    }
                    // SAFETY: stage Data implies the manifest was parsed
                    let manifest = manifest.as_ref().unwrap();
                    let slot = data_slot(&path)?;
                    self.stream_payload(&mut entry, manifest, &slot, sink, &mut summary)?;
                    data_entries += 1;
                }
                other => anyhow::bail!("unexpected container entry {other}"),
            }
        }
        if data_entries == 0 {
            anyhow::bail!("artifact has no payload entries");
        }
        Ok(summary)
    }

    fn accept_header(&self, header: &Header, summary: &mut ArtifactSummary) -> Result<()> {
        let info = header.info()?;
        // An empty device type means "inspect only, accept anything"
        if !self.device_type.is_empty() && !info.device_types_compatible.contains(self.device_type)
        {
            anyhow::bail!(
                "artifact is incompatible with device type {} (compatible: {:?})",
                self.device_type,
                info.device_types_compatible
            );
        }
        if let Some(dir) = self.scripts_dir {
            std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
            for (name, body) in &header.scripts {
                let path = dir.join(name);
                std::fs::write(&path, body).with_context(|| format!("Writing {path}"))?;
            }
        }
        summary.artifact_name = info.artifact_name().map(|s| s.to_string());
        summary.payload_types = info
            .payloads
            .iter()
            .map(|p| p.payload_type.clone())
            .collect();
        summary.device_types_compatible = info.device_types_compatible.clone();
        summary.provides = info.artifact_provides.clone();
        // Per-payload type-info must agree with the announced payloads;
        // its provides supplement the artifact-level ones
        for (slot, type_info) in &header.type_infos {
            if let Some(t) = type_info.payload_type.as_deref() {
                if !info.payloads.iter().any(|p| p.payload_type == t) {
                    anyhow::bail!("type-info for payload {slot} declares unknown type {t}");
                }
            }
            summary
                .provides
                .extend(type_info.artifact_provides.clone());
        }
        if !header.meta_data.is_empty() {
            tracing::debug!(
                "artifact carries meta-data for {} payload(s)",
                header.meta_data.len()
            );
        }
        summary.script_count = header.scripts.len();
        Ok(())
    }

    fn stream_payload(
        &self,
        entry: &mut dyn Read,
        manifest: &Manifest,
        slot: &str,
        sink: &mut dyn PayloadSink,
        summary: &mut ArtifactSummary,
    ) -> Result<()> {
        let mut inner = tar::Archive::new(decompress::decompress(entry)?);
        for file in inner.entries().context("Reading payload archive")? {
            let mut file = file.context("Reading payload file")?;
            if !file.header().entry_type().is_file() {
                continue;
            }
            let name = file.path()?.to_string_lossy().into_owned();
            let size = file.header().size()?;
            let manifest_path = format!("{DATA_PREFIX}{slot}/{name}");
            let digest = manifest.digest_for(&manifest_path)?;
            let mut checked = ChecksumReader::new(&mut file, &manifest_path, digest);
            sink.payload(&name, size, &mut checked)
                .with_context(|| format!("Handling payload {name}"))?;
            checked.verify()?;
            summary.files.push(manifest_path);
            summary.total_payload_bytes += size;
        }
        Ok(())
    }
}

/// `data/0000.tar.gz` → `0000`
fn data_slot(path: &str) -> Result<String> {
    let rest = path.trim_start_matches(DATA_PREFIX);
    let slot = rest.split(".tar").next().unwrap_or_default();
    if slot.is_empty() || !slot.chars().all(|c| c.is_ascii_digit()) {
        anyhow::bail!("malformed payload entry name {path}");
    }
    Ok(slot.to_string())
}

fn read_meta_entry(entry: &mut tar::Entry<'_, impl Read>, what: &str) -> Result<Vec<u8>> {
    let size = entry.header().size()?;
    if size > MAX_META_ENTRY_SIZE {
        anyhow::bail!("{what} entry of {size} bytes exceeds {MAX_META_ENTRY_SIZE}");
    }
    let mut buf = Vec::with_capacity(size as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

#[context("Verifying manifest signature")]
fn verify_manifest_signature(
    key: &PKey<Public>,
    manifest_raw: &[u8],
    sig: &[u8],
) -> Result<()> {
    use base64::Engine;
    // The signature entry is base64; tolerate raw bytes for robustness
    let text = std::str::from_utf8(sig).unwrap_or_default();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .unwrap_or_else(|_| sig.to_vec());
    let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
    verifier.update(manifest_raw)?;
    if !verifier.verify(&decoded)? {
        anyhow::bail!("manifest signature does not verify");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use openssl::pkey::Private;
    use std::io::Write;

    const DEVICE_TYPE: &str = "qemux86-64";

    struct Fixture {
        device_type: &'static str,
        payload: Vec<u8>,
        sign_with: Option<PKey<Private>>,
        tamper_payload_digest: bool,
        omit_version: bool,
        corrupt_signature: bool,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                device_type: DEVICE_TYPE,
                payload: b"pretend this is a rootfs image".to_vec(),
                sign_with: None,
                tamper_payload_digest: false,
                omit_version: false,
                corrupt_signature: false,
            }
        }
    }

    fn keypair() -> (PKey<Private>, PKey<Public>) {
        let group =
            openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
        let ec = openssl::ec::EcKey::generate(&group).unwrap();
        let private = PKey::from_ec_key(ec).unwrap();
        let public_pem = private.public_key_to_pem().unwrap();
        let public = PKey::public_key_from_pem(&public_pem).unwrap();
        (private, public)
    }

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut b = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut h = tar::Header::new_gnu();
            h.set_size(data.len() as u64);
            h.set_mode(0o644);
            h.set_cksum();
            b.append_data(&mut h, path, *data).unwrap();
        }
        b.into_inner().unwrap()
    }

    fn build(f: &Fixture) -> Vec<u8> {
        let version = br#"{"format": "conveyd", "version": 3}"#.to_vec();
        let header_info = format!(
            r#"{{"payloads": [{{"type": "rootfs-image"}}],
                "device_types_compatible": ["{}"],
                "artifact_provides": {{"artifact_name": "release-2"}}}}"#,
            f.device_type
        );
        let header_tar = gz(&tar_with(&[
            ("header-info", header_info.as_bytes()),
            ("headers/0000/type-info", br#"{"type": "rootfs-image"}"#),
        ]));
        let data_tar = gz(&tar_with(&[("rootfs.img", &f.payload)]));

        let mut payload_digest = openssl::sha::sha256(&f.payload);
        if f.tamper_payload_digest {
            payload_digest[0] ^= 0xff;
        }
        let manifest = format!(
            "{}  version\n{}  header.tar.gz\n{}  data/0000/rootfs.img\n",
            hex::encode(openssl::sha::sha256(&version)),
            hex::encode(openssl::sha::sha256(&header_tar)),
            hex::encode(payload_digest),
        );

        let mut entries: Vec<(&str, Vec<u8>)> = Vec::new();
        if !f.omit_version {
            entries.push(("version", version));
        }
        entries.push(("manifest", manifest.clone().into_bytes()));
        if let Some(key) = f.sign_with.as_ref() {
            let mut signer =
                openssl::sign::Signer::new(MessageDigest::sha256(), key).unwrap();
            signer.update(manifest.as_bytes()).unwrap();
            let mut raw = signer.sign_to_vec().unwrap();
            if f.corrupt_signature {
                let last = raw.len() - 1;
                raw[last] ^= 0xff;
            }
            let sig = base64::engine::general_purpose::STANDARD.encode(raw);
            entries.push(("manifest.sig", sig.into_bytes()));
        }
        entries.push(("header.tar.gz", header_tar));
        entries.push(("data/0000.tar.gz", data_tar));

        let borrowed: Vec<(&str, &[u8])> =
            entries.iter().map(|(p, d)| (*p, d.as_slice())).collect();
        tar_with(&borrowed)
    }

    #[derive(Default)]
    struct CollectSink {
        files: Vec<(String, Vec<u8>)>,
    }

    impl PayloadSink for CollectSink {
        fn payload(&mut self, name: &str, _size: u64, src: &mut dyn Read) -> Result<()> {
            let mut buf = Vec::new();
            src.read_to_end(&mut buf)?;
            self.files.push((name.to_string(), buf));
            Ok(())
        }
    }

    fn reader(key: Option<PKey<Public>>) -> ArtifactReader<'static> {
        ArtifactReader {
            device_type: DEVICE_TYPE,
            verify_key: key,
            scripts_dir: None,
        }
    }

    #[test]
    fn test_happy_path_unsigned() {
        let f = Fixture::default();
        let buf = build(&f);
        let mut sink = CollectSink::default();
        let summary = reader(None).read_stream(&buf[..], &mut sink).unwrap();
        assert_eq!(summary.artifact_name.as_deref(), Some("release-2"));
        assert_eq!(summary.payload_types, ["rootfs-image"]);
        assert_eq!(summary.total_payload_bytes, f.payload.len() as u64);
        assert_eq!(summary.files, ["data/0000/rootfs.img"]);
        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0, "rootfs.img");
        assert_eq!(sink.files[0].1, f.payload);
    }

    #[test]
    fn test_happy_path_signed() {
        let (private, public) = keypair();
        let f = Fixture {
            sign_with: Some(private),
            ..Default::default()
        };
        let buf = build(&f);
        let mut sink = CollectSink::default();
        let summary = reader(Some(public)).read_stream(&buf[..], &mut sink).unwrap();
        assert_eq!(sink.files[0].1, f.payload);
        assert_eq!(summary.artifact_name.as_deref(), Some("release-2"));
    }

    #[test]
    fn test_unsigned_rejected_when_key_configured() {
        let (_, public) = keypair();
        let buf = build(&Fixture::default());
        let mut sink = CollectSink::default();
        let err = reader(Some(public))
            .read_stream(&buf[..], &mut sink)
            .unwrap_err();
        assert!(format!("{err:#}").contains("unsigned"));
        assert!(sink.files.is_empty());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let (private, public) = keypair();
        let buf = build(&Fixture {
            sign_with: Some(private),
            corrupt_signature: true,
            ..Default::default()
        });
        let mut sink = CollectSink::default();
        let err = reader(Some(public))
            .read_stream(&buf[..], &mut sink)
            .unwrap_err();
        assert!(format!("{err:#}").contains("signature"));
        assert!(sink.files.is_empty());
    }

    #[test]
    fn test_payload_checksum_mismatch() {
        let buf = build(&Fixture {
            tamper_payload_digest: true,
            ..Default::default()
        });
        let mut sink = CollectSink::default();
        let err = reader(None).read_stream(&buf[..], &mut sink).unwrap_err();
        assert!(format!("{err:#}").contains("checksum mismatch"));
    }

    #[test]
    fn test_incompatible_device_gets_no_payload() {
        let buf = build(&Fixture {
            device_type: "beaglebone",
            ..Default::default()
        });
        let mut sink = CollectSink::default();
        let err = reader(None).read_stream(&buf[..], &mut sink).unwrap_err();
        assert!(format!("{err:#}").contains("incompatible"));
        // No payload byte may reach the sink for an incompatible artifact
        assert!(sink.files.is_empty());
    }

    #[test]
    fn test_entry_order_is_enforced() {
        let buf = build(&Fixture {
            omit_version: true,
            ..Default::default()
        });
        let mut sink = CollectSink::default();
        assert!(reader(None).read_stream(&buf[..], &mut sink).is_err());
    }

    #[test]
    fn test_unknown_entry_rejected() {
        let buf = tar_with(&[("surprise", b"hello")]);
        let mut sink = CollectSink::default();
        assert!(reader(None).read_stream(&buf[..], &mut sink).is_err());
    }

    #[test]
    fn test_data_slot_parse() {
        assert_eq!(data_slot("data/0000.tar.gz").unwrap(), "0000");
        assert_eq!(data_slot("data/0001.tar").unwrap(), "0001");
        assert!(data_slot("data/.tar").is_err());
        assert!(data_slot("data/abc.tar").is_err());
    }
}
