//! The token-bearing, failover-capable HTTP request executor.
//!
//! Every device-facing API call goes through [`ApiClient::dispatch`]:
//! it attaches the bearer token, walks the configured server ring on
//! failure, performs a single reauthorization round-trip per server on
//! 401, and rewinds the ring cursor once a call succeeds so the next
//! call starts at the preferred server again. Request bodies are kept
//! as rebuildable byte buffers because each attempt consumes one.

use std::cell::{Cell, RefCell};
use std::time::Duration;

use anyhow::{Context, Result};
use fn_error_context::context;
use futures_util::future::LocalBoxFuture;
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, ServerEndpoint};
use crate::tlserror::{TlsError, TlsTrustError};

/// One outer deadline covering dial, handshake, request and the full
/// response body; sized for multi-GB downloads on slow links.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpError {
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("{url}: {detail}")]
    Network { url: String, detail: String },
    #[error("operation cancelled")]
    Cancelled,
}

/// Something that can obtain a fresh token after a 401; implemented by
/// the auth manager, which owns the device key and the token slot.
pub(crate) trait Reauthorizer {
    fn reauthorize<'a>(&'a self, server_url: &'a str) -> LocalBoxFuture<'a, Result<String>>;
}

#[derive(Debug, Clone)]
pub(crate) enum RequestBody {
    Empty,
    /// JSON payload; cloned for every attempt so retries see a fresh body
    Json(Vec<u8>),
}

#[derive(Debug, Clone)]
enum Target {
    /// Joined onto each ring server's base URL
    Path(String),
    /// Dispatched as-is (artifact source URIs may point anywhere)
    Absolute(String),
}

/// A request description that can be replayed across servers and retries.
#[derive(Debug, Clone)]
pub(crate) struct ApiRequest {
    method: Method,
    target: Target,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: RequestBody,
}

impl ApiRequest {
    pub(crate) fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, Target::Path(path.into()))
    }

    pub(crate) fn post(path: impl Into<String>, body: Vec<u8>) -> Self {
        let mut r = Self::new(Method::POST, Target::Path(path.into()));
        r.body = RequestBody::Json(body);
        r
    }

    pub(crate) fn put(path: impl Into<String>, body: Vec<u8>) -> Self {
        let mut r = Self::new(Method::PUT, Target::Path(path.into()));
        r.body = RequestBody::Json(body);
        r
    }

    pub(crate) fn patch(path: impl Into<String>, body: Vec<u8>) -> Self {
        let mut r = Self::new(Method::PATCH, Target::Path(path.into()));
        r.body = RequestBody::Json(body);
        r
    }

    pub(crate) fn get_absolute(url: impl Into<String>) -> Self {
        Self::new(Method::GET, Target::Absolute(url.into()))
    }

    fn new(method: Method, target: Target) -> Self {
        Self {
            method,
            target,
            headers: Vec::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    /// Replace a header if present, else add it. Used for `Range` updates
    /// across download resumptions.
    pub(crate) fn set_header(&mut self, name: &str, value: String) {
        if let Some(h) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            h.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    pub(crate) fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

pub(crate) struct ApiClient {
    client: reqwest::Client,
    servers: Vec<ServerEndpoint>,
    cursor: Cell<usize>,
    token: RefCell<String>,
    cancel: CancellationToken,
}

impl ApiClient {
    /// Build the client from configuration: trust store, mTLS material,
    /// proxies, keepalive and the outer deadline.
    #[context("Building HTTP client")]
    pub(crate) fn new(config: &AgentConfig, cancel: CancellationToken) -> Result<Self> {
        let client = build_client(config)?;
        Ok(Self::with_client(client, config.servers(), cancel))
    }

    pub(crate) fn with_client(
        client: reqwest::Client,
        servers: Vec<ServerEndpoint>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            servers,
            cursor: Cell::new(0),
            token: RefCell::new(String::new()),
            cancel,
        }
    }

    /// The underlying transport, shared with the auth client so both use
    /// the same trust configuration.
    pub(crate) fn raw_client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn token(&self) -> String {
        self.token.borrow().clone()
    }

    pub(crate) fn set_token(&self, token: &str) {
        *self.token.borrow_mut() = token.to_string();
    }

    /// Execute a request against the ring. Returns the first `< 400`
    /// response, or the last response/error once every server was tried.
    pub(crate) async fn dispatch(
        &self,
        req: &ApiRequest,
        reauth: Option<&dyn Reauthorizer>,
    ) -> Result<reqwest::Response, HttpError> {
        let n = self.servers.len();
        if n == 0 {
            return Err(HttpError::Network {
                url: String::new(),
                detail: "no deployment server configured".into(),
            });
        }
        let start = self.cursor.get() % n;
        let mut last: Option<Result<reqwest::Response, HttpError>> = None;
        for i in 0..n {
            let idx = (start + i) % n;
            self.cursor.set(idx);
            let server = &self.servers[idx];
            let url = self.target_url(server, req);
            match self.attempt(&url, req).await {
                Err(HttpError::Cancelled) => return Err(HttpError::Cancelled),
                Err(e) => {
                    tracing::warn!("request to {url} failed: {e}");
                    last = Some(Err(e));
                }
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                    let Some(reauth) = reauth else {
                        last = Some(Ok(resp));
                        continue;
                    };
                    match reauth.reauthorize(&server.url).await {
                        Ok(token) => {
                            self.set_token(&token);
                            // Retry the same server exactly once
                            match self.attempt(&url, req).await {
                                Err(HttpError::Cancelled) => return Err(HttpError::Cancelled),
                                Err(e) => last = Some(Err(e)),
                                Ok(retry) if retry.status().as_u16() < 400 => {
                                    self.cursor.set(start);
                                    return Ok(retry);
                                }
                                Ok(retry) => last = Some(Ok(retry)),
                            }
                        }
                        Err(e) => {
                            tracing::warn!("reauthorization with {} failed: {e:#}", server.url);
                            last = Some(Ok(resp));
                        }
                    }
                }
                Ok(resp) if resp.status().as_u16() >= 400 => {
                    tracing::warn!("request to {url} returned {}", resp.status());
                    last = Some(Ok(resp));
                }
                Ok(resp) => {
                    self.cursor.set(start);
                    return Ok(resp);
                }
            }
        }
        // SAFETY: the loop ran at least once
        last.unwrap()
    }

    fn target_url(&self, server: &ServerEndpoint, req: &ApiRequest) -> String {
        match &req.target {
            Target::Path(p) => format!("{}{}", server.url, p),
            Target::Absolute(u) => u.clone(),
        }
    }

    async fn attempt(
        &self,
        url: &str,
        req: &ApiRequest,
    ) -> Result<reqwest::Response, HttpError> {
        let mut b = self.client.request(req.method.clone(), url);
        if !req.query.is_empty() {
            b = b.query(&req.query);
        }
        let mut has_auth = false;
        for (k, v) in &req.headers {
            has_auth |= k.eq_ignore_ascii_case("authorization");
            b = b.header(k.as_str(), v.as_str());
        }
        if !has_auth {
            let token = self.token.borrow();
            if !token.is_empty() {
                b = b.bearer_auth(token.as_str());
            }
        }
        match &req.body {
            RequestBody::Empty => {}
            RequestBody::Json(bytes) => {
                b = b
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(bytes.clone());
            }
        }
        let send = b.send();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HttpError::Cancelled),
            r = send => r.map_err(|e| classify_send_error(url, e)),
        }
    }
}

/// Whether an error chain bottoms out in a cooperative cancellation.
pub(crate) fn error_is_cancelled(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|c| matches!(c.downcast_ref::<HttpError>(), Some(HttpError::Cancelled)))
}

fn classify_send_error(url: &str, e: reqwest::Error) -> HttpError {
    if let Some(class) = TlsTrustError::classify(&e) {
        HttpError::Tls(TlsError {
            class,
            url: url.to_string(),
        })
    } else {
        // Flatten the cause chain into one line; these errors cross task
        // boundaries where the concrete reqwest types are unwieldy
        let mut detail = e.to_string();
        let mut cur = std::error::Error::source(&e);
        while let Some(c) = cur {
            detail.push_str(": ");
            detail.push_str(&c.to_string());
            cur = c.source();
        }
        HttpError::Network {
            url: url.to_string(),
            detail,
        }
    }
}

#[context("Building HTTP client")]
fn build_client(config: &AgentConfig) -> Result<reqwest::Client> {
    let mut b = reqwest::Client::builder()
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE_INTERVAL);
    if let Some(path) = config.server_certificate.as_ref() {
        match std::fs::read(path) {
            Ok(pem) => {
                let certs = openssl::x509::X509::stack_from_pem(&pem)
                    .with_context(|| format!("Parsing {path}"))?;
                if certs.is_empty() {
                    tracing::error!(
                        "{path} contains no certificates; only the system trust store remains"
                    );
                }
                for cert in certs {
                    let der = cert.to_der()?;
                    b = b.add_root_certificate(reqwest::Certificate::from_der(&der)?);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The system store still applies, so this is not fatal
                tracing::warn!("pinned server certificate {path} does not exist");
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        }
    }
    if let Some(tls) = config.https_client.as_ref() {
        // validate() guarantees both halves are present together
        if let (Some(cert), Some(key)) = (tls.certificate.as_ref(), tls.key.as_ref()) {
            let cert_pem = std::fs::read(cert).with_context(|| format!("Reading {cert}"))?;
            let key_pem = std::fs::read(key).with_context(|| format!("Reading {key}"))?;
            let identity = reqwest::Identity::from_pkcs8_pem(&cert_pem, &key_pem)
                .context("Loading client TLS identity")?;
            b = b.identity(identity);
        }
    }
    if let Some(proxy) = config.http_proxy.as_deref() {
        b = b.proxy(configure_proxy(reqwest::Proxy::http(proxy)?, config));
    }
    if let Some(proxy) = config.https_proxy.as_deref() {
        b = b.proxy(configure_proxy(reqwest::Proxy::https(proxy)?, config));
    }
    Ok(b.build()?)
}

fn configure_proxy(proxy: reqwest::Proxy, config: &AgentConfig) -> reqwest::Proxy {
    match config.no_proxy.as_deref().and_then(reqwest::NoProxy::from_string) {
        Some(np) => proxy.no_proxy(Some(np)),
        None => proxy,
    }
}

/// Canned single-connection HTTP servers for transport tests.
#[cfg(test)]
pub(crate) mod testutil {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};

    pub(crate) struct TestServer {
        /// `http://127.0.0.1:<port>`
        pub(crate) url: String,
        /// Raw request text (head + body), one entry per connection
        pub(crate) requests: Arc<Mutex<Vec<String>>>,
    }

    impl TestServer {
        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn request(&self, i: usize) -> String {
            self.requests.lock().unwrap()[i].clone()
        }
    }

    /// Serve one canned response per accepted connection, then stop.
    pub(crate) fn spawn(responses: Vec<Vec<u8>>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        std::thread::spawn(move || {
            for response in responses {
                let Ok((mut sock, _)) = listener.accept() else {
                    return;
                };
                let req = read_request(&mut sock);
                recorded.lock().unwrap().push(req);
                let _ = sock.write_all(&response);
                let _ = sock.shutdown(std::net::Shutdown::Both);
            }
        });
        TestServer { url, requests }
    }

    /// Build a full `Connection: close` response with a correct length.
    pub(crate) fn response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
        let mut r = format!("HTTP/1.1 {status} X\r\nConnection: close\r\n");
        let mut has_len = false;
        for (k, v) in headers {
            has_len |= k.eq_ignore_ascii_case("content-length");
            r.push_str(&format!("{k}: {v}\r\n"));
        }
        if !has_len {
            r.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        r.push_str("\r\n");
        let mut r = r.into_bytes();
        r.extend_from_slice(body);
        r
    }

    fn read_request(sock: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        // Head first
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut chunk).unwrap_or(0);
            if n == 0 {
                return String::from_utf8_lossy(&buf).into_owned();
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let content_length = head
            .lines()
            .find_map(|l| {
                let (k, v) = l.split_once(':')?;
                k.eq_ignore_ascii_case("content-length")
                    .then(|| v.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        while buf.len() < head_end + content_length {
            let n = sock.read(&mut chunk).unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}
