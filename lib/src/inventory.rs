//! Inventory attribute submission.
//!
//! The server-side inventory is patched periodically with the identity
//! attributes plus a few facts about the running system. Attribute
//! collection is deliberately minimal; richer collection belongs to
//! external tooling.

use anyhow::Context;
use serde::Serialize;

use crate::deployments::ApiError;
use crate::http::{ApiClient, ApiRequest, Reauthorizer};
use crate::identity::DeviceIdentity;
use crate::spec::CurrentUpdate;

pub(crate) const INVENTORY_PATH: &str = "/api/devices/v1/inventory/device/attributes";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct InventoryAttribute {
    pub(crate) name: String,
    pub(crate) value: String,
}

fn attr(name: &str, value: impl Into<String>) -> InventoryAttribute {
    InventoryAttribute {
        name: name.to_string(),
        value: value.into(),
    }
}

/// Assemble the attribute list for one submission.
pub(crate) fn collect(
    identity: &DeviceIdentity,
    current: &CurrentUpdate,
) -> Vec<InventoryAttribute> {
    let mut attrs: Vec<InventoryAttribute> = identity
        .attributes()
        .iter()
        .map(|(k, v)| attr(k, v.clone()))
        .collect();
    attrs.push(attr("device_type", current.device_type.clone()));
    if let Some(name) = current.artifact_name.as_deref() {
        attrs.push(attr("artifact_name", name));
    }
    attrs.push(attr("conveyd_version", env!("CARGO_PKG_VERSION")));
    if let Ok(kernel) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
        attrs.push(attr("kernel", kernel.trim()));
    }
    if let Ok(hostname) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        attrs.push(attr("hostname", hostname.trim()));
    }
    attrs
}

/// PATCH the attribute list to the inventory service.
pub(crate) async fn submit(
    api: &ApiClient,
    reauth: Option<&dyn Reauthorizer>,
    attributes: &[InventoryAttribute],
) -> Result<(), ApiError> {
    let body = serde_json::to_vec(attributes).context("Serializing inventory")?;
    let resp = api
        .dispatch(&ApiRequest::patch(INVENTORY_PATH, body), reauth)
        .await?;
    match resp.status().as_u16() {
        200 | 204 => Ok(()),
        401 => Err(ApiError::NotAuthorized),
        s => Err(ApiError::Protocol(format!("inventory submit returned {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testutil::{response, spawn};
    use crate::config::ServerEndpoint;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_collect_includes_base_attributes() {
        let identity = DeviceIdentity::from_attributes(
            [("mac".to_string(), "aa:bb".to_string())].into(),
        );
        let current = CurrentUpdate {
            artifact_name: Some("release-1".into()),
            device_type: "qemux86-64".into(),
            provides: Default::default(),
        };
        let attrs = collect(&identity, &current);
        let find = |n: &str| attrs.iter().find(|a| a.name == n).map(|a| a.value.clone());
        assert_eq!(find("mac").unwrap(), "aa:bb");
        assert_eq!(find("device_type").unwrap(), "qemux86-64");
        assert_eq!(find("artifact_name").unwrap(), "release-1");
        assert!(find("conveyd_version").is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_submit() {
        let server = spawn(vec![response(200, &[], b"")]);
        let api = ApiClient::with_client(
            reqwest::Client::new(),
            vec![ServerEndpoint {
                url: server.url.clone(),
                tenant_token: None,
            }],
            CancellationToken::new(),
        );
        let attrs = vec![InventoryAttribute {
            name: "device_type".into(),
            value: "qemux86-64".into(),
        }];
        submit(&api, None, &attrs).await.unwrap();
        let raw = server.request(0);
        assert!(raw.starts_with("PATCH /api/devices/v1/inventory/device/attributes"));
        assert!(raw.contains(r#""name":"device_type""#));
    }
}
