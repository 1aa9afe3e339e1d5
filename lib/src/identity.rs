//! Device identity: the private key, request signing, and the identity
//! data sent with authentication requests.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;

use crate::config::AgentConfig;

/// Key size for generated device keys.
const GENERATED_KEY_BITS: u32 = 3072;

/// The device private key used to sign authentication requests.
#[derive(Debug)]
pub(crate) struct DeviceKey {
    pkey: PKey<Private>,
}

impl DeviceKey {
    /// Load the key from `path`, generating and persisting a new one if the
    /// file does not exist yet.
    #[context("Loading device key")]
    pub(crate) fn load_or_generate(path: &Utf8Path) -> Result<Self> {
        if let Some(scheme) = hsm_uri_scheme(path.as_str()) {
            // The safe openssl bindings expose no ENGINE interface.
            anyhow::bail!(
                "device key {path}: {scheme} key URIs are not supported; \
                 configure a PEM file path"
            );
        }
        let pem = match std::fs::read(path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No device key at {path}, generating one");
                return Self::generate_and_persist(path);
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let pkey = PKey::private_key_from_pem(&pem)
            .with_context(|| format!("Parsing device key {path}"))?;
        Ok(Self::from_pkey(pkey))
    }

    #[context("Generating device key")]
    fn generate_and_persist(path: &Utf8Path) -> Result<Self> {
        let rsa = Rsa::generate(GENERATED_KEY_BITS)?;
        let pkey = PKey::from_rsa(rsa)?;
        let pem = pkey.private_key_to_pem_pkcs8()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        }
        // The key must never be group or world readable
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Creating {path}"))?;
        f.write_all(&pem)?;
        f.sync_all()?;
        Ok(Self::from_pkey(pkey))
    }

    pub(crate) fn from_pkey(pkey: PKey<Private>) -> Self {
        Self { pkey }
    }

    /// Sign `data` with the device key (SHA-256 digest).
    pub(crate) fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    /// The public half in PEM form, as sent in authentication requests.
    pub(crate) fn public_key_pem(&self) -> Result<String> {
        let pem = self.pkey.public_key_to_pem()?;
        Ok(String::from_utf8(pem)?)
    }
}

fn hsm_uri_scheme(path: &str) -> Option<&'static str> {
    if path.starts_with("pkcs11:") {
        Some("pkcs11")
    } else if path.starts_with("engine:") {
        Some("engine")
    } else {
        None
    }
}

/// The identity attributes presented to the authentication service.
/// Serialization is canonical: attributes sort by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceIdentity {
    attributes: BTreeMap<String, String>,
}

impl DeviceIdentity {
    /// Load identity attributes per configuration, falling back to the
    /// machine id.
    #[context("Loading device identity")]
    pub(crate) fn load(config: &AgentConfig) -> Result<Self> {
        if let Some(path) = config.identity_file.as_ref() {
            let buf = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
            let attributes: BTreeMap<String, String> =
                serde_json::from_slice(&buf).with_context(|| format!("Parsing {path}"))?;
            if attributes.is_empty() {
                anyhow::bail!("identity file {path} has no attributes");
            }
            return Ok(Self { attributes });
        }
        let machine_id = std::fs::read_to_string("/etc/machine-id")
            .context("Reading /etc/machine-id (no IdentityFile configured)")?;
        Ok(Self::from_attributes(
            [("machine_id".to_string(), machine_id.trim().to_string())].into(),
        ))
    }

    pub(crate) fn from_attributes(attributes: BTreeMap<String, String>) -> Self {
        Self { attributes }
    }

    /// The canonical JSON form used both in the auth request body and as
    /// the signed payload.
    pub(crate) fn id_data(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.attributes)?)
    }

    pub(crate) fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::sign::Verifier;

    fn test_key() -> DeviceKey {
        // EC keys keep the test fast; signing goes through the same path
        let group =
            openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
        let ec = openssl::ec::EcKey::generate(&group).unwrap();
        DeviceKey::from_pkey(PKey::from_ec_key(ec).unwrap())
    }

    #[test]
    fn test_sign_verifies() {
        let key = test_key();
        let sig = key.sign(b"payload").unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &key.pkey).unwrap();
        verifier.update(b"payload").unwrap();
        assert!(verifier.verify(&sig).unwrap());
        let mut verifier = Verifier::new(MessageDigest::sha256(), &key.pkey).unwrap();
        verifier.update(b"tampered").unwrap();
        assert!(!verifier.verify(&sig).unwrap());
    }

    #[test]
    fn test_public_key_pem() {
        let pem = test_key().public_key_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_hsm_uris_rejected() {
        let err = DeviceKey::load_or_generate(Utf8Path::new("pkcs11:token=foo;object=bar"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("pkcs11"));
    }

    #[test]
    fn test_generate_and_reload() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("device.pem");
        let path = Utf8Path::from_path(&path).unwrap();
        let key = DeviceKey::load_or_generate(path).unwrap();
        let pem_first = key.public_key_pem().unwrap();
        // Second load reuses the persisted key
        let key = DeviceKey::load_or_generate(path).unwrap();
        assert_eq!(key.public_key_pem().unwrap(), pem_first);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_id_data_is_canonical() {
        let a = DeviceIdentity::from_attributes(
            [
                ("mac".to_string(), "aa:bb".to_string()),
                ("sku".to_string(), "x1".to_string()),
            ]
            .into(),
        );
        assert_eq!(a.id_data().unwrap(), r#"{"mac":"aa:bb","sku":"x1"}"#);
    }
}
