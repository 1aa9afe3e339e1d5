//! The artifact manifest and the checksummed entry reader.
//!
//! Manifest lines are `<64 hex sha256><two spaces><path>`, one per
//! subsequent container entry.

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{Context, Result};

pub(crate) const DIGEST_LEN: usize = 32;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Manifest {
    entries: BTreeMap<String, [u8; DIGEST_LEN]>,
}

impl Manifest {
    pub(crate) fn parse(buf: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(buf).context("Manifest is not UTF-8")?;
        let mut entries = BTreeMap::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let (digest, path) = line
                .split_once("  ")
                .with_context(|| format!("Manifest line {}: missing separator", lineno + 1))?;
            if digest.len() != DIGEST_LEN * 2 {
                anyhow::bail!("Manifest line {}: bad digest length", lineno + 1);
            }
            let digest = hex::decode(digest)
                .with_context(|| format!("Manifest line {}: bad digest", lineno + 1))?;
            if path.is_empty() {
                anyhow::bail!("Manifest line {}: empty path", lineno + 1);
            }
            // SAFETY: length checked above
            let digest: [u8; DIGEST_LEN] = digest.try_into().unwrap();
            entries.insert(path.to_string(), digest);
        }
        if entries.is_empty() {
            anyhow::bail!("Manifest has no entries");
        }
        Ok(Self { entries })
    }

    pub(crate) fn digest_for(&self, path: &str) -> Result<[u8; DIGEST_LEN]> {
        self.entries
            .get(path)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("{path} is not listed in the manifest"))
    }

    #[allow(dead_code)]
    pub(crate) fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }
}

/// Reader adapter hashing everything that flows through it; [`verify`]
/// compares against the manifest digest once the entry is drained.
///
/// [`verify`]: ChecksumReader::verify
pub(crate) struct ChecksumReader<R> {
    inner: R,
    hasher: openssl::sha::Sha256,
    expected: [u8; DIGEST_LEN],
    path: String,
}

impl<R: Read> ChecksumReader<R> {
    pub(crate) fn new(inner: R, path: &str, expected: [u8; DIGEST_LEN]) -> Self {
        Self {
            inner,
            hasher: openssl::sha::Sha256::new(),
            expected,
            path: path.to_string(),
        }
    }

    /// Consume any unread remainder and check the digest.
    pub(crate) fn verify(mut self) -> Result<()> {
        std::io::copy(&mut self, &mut std::io::sink())?;
        let computed = self.hasher.finish();
        if computed != self.expected {
            anyhow::bail!(
                "checksum mismatch for {}: computed {}, manifest has {}",
                self.path,
                hex::encode(computed),
                hex::encode(self.expected)
            );
        }
        Ok(())
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_hex(data: &[u8]) -> String {
        hex::encode(openssl::sha::sha256(data))
    }

    #[test]
    fn test_parse_manifest() {
        let text = format!(
            "{}  version\n{}  data/0000/rootfs.img\n",
            digest_hex(b"v"),
            digest_hex(b"image")
        );
        let m = Manifest::parse(text.as_bytes()).unwrap();
        assert_eq!(m.paths().count(), 2);
        assert_eq!(
            m.digest_for("version").unwrap(),
            openssl::sha::sha256(b"v")
        );
        assert!(m.digest_for("absent").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        // Single space separator
        assert!(Manifest::parse(format!("{} version\n", digest_hex(b"v")).as_bytes()).is_err());
        // Truncated digest
        assert!(Manifest::parse(b"abcd  version\n").is_err());
        // Non-hex digest
        let bad = "z".repeat(64);
        assert!(Manifest::parse(format!("{bad}  version\n").as_bytes()).is_err());
        // Missing path
        assert!(Manifest::parse(format!("{}  \n", digest_hex(b"v")).as_bytes()).is_err());
        // Empty manifest
        assert!(Manifest::parse(b"").is_err());
    }

    #[test]
    fn test_checksum_reader() {
        let data = b"streamed entry bytes";
        let good = openssl::sha::sha256(data);
        let mut r = ChecksumReader::new(&data[..], "entry", good);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        r.verify().unwrap();

        let mut wrong = good;
        wrong[0] ^= 0xff;
        let r = ChecksumReader::new(&data[..], "entry", wrong);
        // verify drains the unread stream itself
        let err = r.verify().unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
