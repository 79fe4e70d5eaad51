//! HTTP transport for reaching the local source proxy through the API server's
//! service proxy subresource.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use http::{Request, Response, Uri};
use http_body_util::BodyExt;
use kube::Client;
use metrics::counter;
use tracing::debug;

/// Response header the proxy uses to report the registry repository it pushes to.
pub const LOCAL_SOURCE_PROXY_REGISTRY_PATH: &str = "Lsp-Registry-Path";

pub const LSP_NAMESPACE: &str = "tap-local-source-system";
pub const LSP_SERVICE: &str = "local-source-proxy";
pub const LSP_SCHEME: &str = "http";
pub const LSP_PORT: u16 = 5001;

const NAMESPACED_API_PREFIX: &str = "/api/v1/namespaces/";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("local source proxy transport is not configured")]
    TransportNotConfigured,
    #[error("invalid query {query:?}: {reason}")]
    InvalidQuery { query: String, reason: &'static str },
    #[error("invalid proxy url: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error(transparent)]
    Http(#[from] http::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("reading response body: {0}")]
    Body(String),
}

/// A buffered HTTP round trip.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, ProxyError>;
}

/// Sends requests through the kube client, so they carry the kubeconfig credentials.
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl Transport for KubeTransport {
    async fn round_trip(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, ProxyError> {
        let resp = self.client.send(req.map(kube::client::Body::from)).await?;
        let (parts, body) = resp.into_parts();
        let bytes = body.collect().await.map_err(|e| ProxyError::Body(e.to_string()))?.to_bytes();
        Ok(Response::from_parts(parts, bytes.to_vec()))
    }
}

/// Rewrites every request onto a fixed base URL and forwards it to the inner transport.
///
/// The last `Lsp-Registry-Path` header seen on any response is kept as the
/// wrapper's repository; concurrent requests race on it, last write wins.
pub struct Wrapper {
    base: Uri,
    transport: Option<Arc<dyn Transport>>,
    repository: ArcSwapOption<String>,
}

impl Wrapper {
    pub fn new(base: Uri) -> Self {
        Self { base, transport: None, repository: ArcSwapOption::empty() }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn url(&self) -> &Uri { &self.base }

    pub fn repository(&self) -> Option<String> {
        self.repository.load_full().map(|r| r.as_ref().clone())
    }

    /// Compute the outgoing URI for an incoming request URI.
    pub fn rewrite(&self, incoming: &Uri) -> Result<Uri, ProxyError> {
        let query = normalize_query(incoming.query().unwrap_or(""))?;

        let mut path = if incoming.path().starts_with(NAMESPACED_API_PREFIX) {
            incoming.path().to_string()
        } else {
            join_paths(self.base.path(), incoming.path())
        };
        if path.ends_with("v2") || path.ends_with("uploads") {
            path.push('/');
        }

        let path_and_query = if query.is_empty() { path } else { format!("{path}?{query}") };
        let mut builder = Uri::builder();
        if let Some(scheme) = self.base.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = self.base.authority() {
            builder = builder.authority(authority.clone());
        }
        Ok(builder.path_and_query(path_and_query).build()?)
    }
}

#[async_trait::async_trait]
impl Transport for Wrapper {
    async fn round_trip(&self, mut req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, ProxyError> {
        let transport = self.transport.as_ref().ok_or(ProxyError::TransportNotConfigured)?;
        let uri = self.rewrite(req.uri())?;
        debug!(method = %req.method(), from = %req.uri(), to = %uri, "proxying request");
        *req.uri_mut() = uri;

        let resp = transport.round_trip(req).await?;
        counter!("apps_proxy_requests_total", 1u64, "status" => resp.status().as_u16().to_string());
        if let Some(repo) = resp.headers().get(LOCAL_SOURCE_PROXY_REGISTRY_PATH).and_then(|v| v.to_str().ok()) {
            debug!(repository = %repo, "local source proxy reported registry path");
            self.repository.store(Some(Arc::new(repo.to_string())));
        }
        Ok(resp)
    }
}

/// API server path of the local source proxy service, plus optional suffix segments.
pub fn local_source_proxy_path(suffixes: &[&str]) -> String {
    let mut path = format!("{NAMESPACED_API_PREFIX}{LSP_NAMESPACE}/services/{LSP_SCHEME}:{LSP_SERVICE}:{LSP_PORT}/proxy");
    for s in suffixes.iter().map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
        path.push('/');
        path.push_str(s);
    }
    path
}

/// Wrapper targeting the local source proxy through the cluster the client points at.
pub fn local_registry_transport(client: Client, suffixes: &[&str]) -> Result<Wrapper, ProxyError> {
    let base: Uri = local_source_proxy_path(suffixes).parse()?;
    Ok(Wrapper::new(base).with_transport(Arc::new(KubeTransport::new(client))))
}

/// Join and clean two slash-separated paths (`.`, `..`, empty segments and trailing slash removed).
pub(crate) fn join_paths(base: &str, suffix: &str) -> String {
    let joined = format!("{base}/{suffix}");
    let mut segments: Vec<&str> = Vec::new();
    for seg in joined.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// True when every `%` starts a two-digit hex escape.
pub(crate) fn has_valid_escapes(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
            if !valid {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

/// Parse and re-encode a query string: keys sorted, values in original order.
pub(crate) fn normalize_query(raw: &str) -> Result<String, ProxyError> {
    if raw.is_empty() {
        return Ok(String::new());
    }
    if raw.contains(';') {
        return Err(ProxyError::InvalidQuery { query: raw.to_string(), reason: "invalid semicolon separator" });
    }
    if !has_valid_escapes(raw) {
        return Err(ProxyError::InvalidQuery { query: raw.to_string(), reason: "invalid URL escape" });
    }
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &pairs {
        ser.append_pair(k, v);
    }
    Ok(ser.finish())
}
