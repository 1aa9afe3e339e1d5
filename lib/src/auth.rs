//! The device authentication exchange.
//!
//! Trades the device identity (signed with the device key) for a bearer
//! token. The auth manager owns the token slot: the transport calls back
//! into it through [`Reauthorizer`] whenever a server answers 401.

use std::rc::Rc;

use anyhow::{Context, Result};
use base64::Engine;
use fn_error_context::context;
use futures_util::future::LocalBoxFuture;
use serde::Serialize;

use crate::config::ServerEndpoint;
use crate::http::Reauthorizer;
use crate::identity::{DeviceIdentity, DeviceKey};
use crate::store::{Store, AUTH_TOKEN_KEY};
use crate::tlserror::{TlsError, TlsTrustError};

pub(crate) const AUTH_REQUESTS_PATH: &str = "/api/devices/v1/authentication/auth_requests";
const SIGNATURE_HEADER: &str = "X-MEN-Signature";
const REQUEST_ID_HEADER: &str = "X-MEN-RequestID";

#[derive(Debug, thiserror::Error)]
pub(crate) enum AuthError {
    /// The server has not (yet) accepted this device
    #[error("device not authorized by {url}")]
    Unauthorized { url: String },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("{url}: unexpected status {status}{detail}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        detail: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct AuthRequestBody {
    id_data: String,
    tenant_token: String,
    pubkey: String,
}

pub(crate) struct AuthManager {
    client: reqwest::Client,
    key: DeviceKey,
    identity: DeviceIdentity,
    servers: Vec<ServerEndpoint>,
    store: Rc<Store>,
}

impl AuthManager {
    pub(crate) fn new(
        client: reqwest::Client,
        key: DeviceKey,
        identity: DeviceIdentity,
        servers: Vec<ServerEndpoint>,
        store: Rc<Store>,
    ) -> Self {
        Self {
            client,
            key,
            identity,
            servers,
            store,
        }
    }

    pub(crate) fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// A token left over from a previous run, if any.
    pub(crate) fn cached_token(&self) -> Result<Option<String>> {
        let Some(buf) = self.store.read(AUTH_TOKEN_KEY)? else {
            return Ok(None);
        };
        let token = String::from_utf8(buf).context("Stored token is not UTF-8")?;
        Ok((!token.is_empty()).then_some(token))
    }

    /// Perform the identity→token exchange against one server.
    pub(crate) async fn authenticate(
        &self,
        server: &ServerEndpoint,
    ) -> Result<String, AuthError> {
        let url = format!("{}{}", server.url, AUTH_REQUESTS_PATH);
        let tenant_token = server.tenant_token.clone().unwrap_or_default();
        let body = AuthRequestBody {
            id_data: self.identity.id_data().map_err(AuthError::Other)?,
            tenant_token: tenant_token.clone(),
            pubkey: self.key.public_key_pem().map_err(AuthError::Other)?,
        };
        // The signature must cover the exact bytes on the wire
        let body = serde_json::to_vec(&body)
            .context("Serializing auth request")
            .map_err(AuthError::Other)?;
        let signature = base64::engine::general_purpose::STANDARD
            .encode(self.key.sign(&body).map_err(AuthError::Other)?);

        let mut req = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body);
        if !tenant_token.is_empty() {
            req = req.bearer_auth(&tenant_token);
        }
        let resp = req.send().await.map_err(|e| classify_auth_error(&url, e))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::Unauthorized { url });
        }
        if status.is_success() {
            let token = resp
                .text()
                .await
                .context("Reading token")
                .map_err(AuthError::Other)?;
            if token.is_empty() {
                return Err(AuthError::UnexpectedStatus {
                    url,
                    status: status.as_u16(),
                    detail: " (empty token)".into(),
                });
            }
            return Ok(token);
        }
        let request_id = resp
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let server_error = resp
            .text()
            .await
            .ok()
            .and_then(|t| serde_json::from_str::<serde_json::Value>(&t).ok())
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from));
        let mut detail = String::new();
        if let Some(e) = server_error {
            detail.push_str(&format!(" ({e})"));
        }
        if let Some(id) = request_id {
            detail.push_str(&format!(" [request id {id}]"));
        }
        Err(AuthError::UnexpectedStatus {
            url,
            status: status.as_u16(),
            detail,
        })
    }

    /// Walk the ring until one server issues a token; persist it.
    #[context("Obtaining authorization")]
    pub(crate) async fn obtain_token(&self) -> Result<String> {
        let mut last: Option<AuthError> = None;
        for server in &self.servers {
            match self.authenticate(server).await {
                Ok(token) => {
                    self.store.write(AUTH_TOKEN_KEY, token.as_bytes())?;
                    tracing::info!("authorized by {}", server.url);
                    return Ok(token);
                }
                Err(e) => {
                    tracing::warn!("authentication with {} failed: {e}", server.url);
                    last = Some(e);
                }
            }
        }
        // SAFETY: configuration validation guarantees a nonempty ring
        Err(last.unwrap().into())
    }
}

fn classify_auth_error(url: &str, e: reqwest::Error) -> AuthError {
    if let Some(class) = TlsTrustError::classify(&e) {
        AuthError::Tls(TlsError {
            class,
            url: url.to_string(),
        })
    } else {
        AuthError::Other(anyhow::Error::new(e).context(format!("Requesting {url}")))
    }
}

impl Reauthorizer for AuthManager {
    fn reauthorize<'a>(&'a self, server_url: &'a str) -> LocalBoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let server = self
                .servers
                .iter()
                .find(|s| s.url == server_url)
                .cloned()
                .unwrap_or_else(|| ServerEndpoint {
                    url: server_url.to_string(),
                    tenant_token: None,
                });
            let token = self.authenticate(&server).await?;
            self.store.write(AUTH_TOKEN_KEY, token.as_bytes())?;
            Ok(token)
        })
    }
}
