//! Reverse proxy from the harness to the running app.
//!
//! Plain requests go through a pooled `reqwest` client. WebSocket upgrades
//! cannot, so [`tunnel`] dials the app directly and splices the two
//! connections together.

pub mod tunnel;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::response::Response;
use tracing::{error, warn};

use crate::render;
use tunnel::TlsTarget;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with backend failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("client connection cannot be taken over")]
    NotUpgradable,

    #[error("backend HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("backend request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Where the app is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    /// Mirrors the harness's own TLS setting.
    pub tls: bool,
}

impl Backend {
    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }

    /// `host:port`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}://{}{}", self.scheme(), self.authority(), path_and_query)
    }
}

/// `true` when the request asks to switch to the WebSocket protocol.
pub fn is_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
}

/// Forwards requests to one fixed [`Backend`].
#[derive(Debug, Clone)]
pub struct Proxy {
    backend: Backend,
    client: reqwest::Client,
    tls: Option<TlsTarget>,
}

impl Proxy {
    pub fn new(backend: Backend) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .danger_accept_invalid_certs(backend.tls)
            .build()
            .context("failed to build backend HTTP client")?;
        let tls = if backend.tls {
            Some(TlsTarget::for_host(&backend.host)?)
        } else {
            None
        };
        Ok(Self {
            backend,
            client,
            tls,
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Forward one request, choosing the tunnel for WebSocket upgrades.
    pub async fn forward(&self, req: Request<Body>) -> Response {
        if is_websocket(req.headers()) {
            return tunnel::proxy_websocket(req, &self.backend, self.tls.as_ref()).await;
        }
        match self.forward_http(req).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(backend = %self.backend.authority(), error = %e, "proxy error");
                render::plain_error(StatusCode::BAD_GATEWAY, "Error contacting backend server.")
            }
        }
    }

    async fn forward_http(&self, req: Request<Body>) -> Result<Response, ProxyError> {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            append_forwarded_for(&mut headers, *peer);
        }

        let upstream = self
            .client
            .request(parts.method, self.backend.url(path))
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut resp = Response::new(Body::from_stream(upstream.bytes_stream()));
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        Ok(resp)
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip,
    };
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.insert("x-forwarded-for", value);
        }
        Err(e) => warn!(error = %e, "dropping unrepresentable X-Forwarded-For"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_scheme_follows_tls() {
        let plain = Backend {
            host: "localhost".to_string(),
            port: 9001,
            tls: false,
        };
        assert_eq!(plain.url("/a?b=1"), "http://localhost:9001/a?b=1");

        let secure = Backend { tls: true, ..plain };
        assert_eq!(secure.url("/"), "https://localhost:9001/");
    }

    #[test]
    fn websocket_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket(&headers));
    }

    #[test]
    fn strips_standard_and_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn forwarded_for_is_appended() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.0.0.1:5555".parse().unwrap());
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1");
        append_forwarded_for(&mut headers, "10.0.0.2:5555".parse().unwrap());
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1, 10.0.0.2");
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let port = crate::config::free_port().unwrap();
        let proxy = Proxy::new(Backend {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
        })
        .unwrap();

        let resp = proxy
            .forward(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
