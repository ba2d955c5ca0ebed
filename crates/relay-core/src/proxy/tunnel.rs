//! WebSocket tunnel.
//!
//! The upgrade request is replayed on a fresh connection to the app. Once
//! the app answers `101 Switching Protocols`, both connections are taken
//! over and bytes are copied in each direction until either side closes.

use std::fmt;

use anyhow::Result;
use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode, Version, header};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

use super::{Backend, ProxyError};
use crate::{render, tls};

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// TLS settings for dialing an app that serves HTTPS.
#[derive(Clone)]
pub struct TlsTarget {
    connector: TlsConnector,
    name: ServerName<'static>,
}

impl TlsTarget {
    pub fn for_host(host: &str) -> Result<Self> {
        Ok(Self {
            connector: tls::insecure_connector()?,
            name: tls::server_name(host)?,
        })
    }
}

impl fmt::Debug for TlsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTarget").field("name", &self.name).finish()
    }
}

/// Tunnel one upgrade request to `backend`.
///
/// Any failure before the app has answered yields a 500; nothing is
/// retried.
pub async fn proxy_websocket(
    req: Request<Body>,
    backend: &Backend,
    tls: Option<&TlsTarget>,
) -> Response {
    match tunnel(req, backend, tls).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(backend = %backend.authority(), error = %e, "websocket proxy error");
            render::plain_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error contacting backend server.",
            )
        }
    }
}

async fn tunnel(
    mut req: Request<Body>,
    backend: &Backend,
    tls: Option<&TlsTarget>,
) -> Result<Response, ProxyError> {
    let stream = dial(backend, tls).await?;

    let client_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(ProxyError::NotUpgradable)?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "backend websocket connection closed");
        }
    });

    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut upstream = Request::new(body);
    *upstream.method_mut() = parts.method;
    *upstream.version_mut() = Version::HTTP_11;
    *upstream.uri_mut() = path.parse().unwrap_or_default();
    *upstream.headers_mut() = parts.headers;
    if !upstream.headers().contains_key(header::HOST) {
        if let Ok(host) = HeaderValue::from_str(&backend.authority()) {
            upstream.headers_mut().insert(header::HOST, host);
        }
    }

    let mut resp = sender.send_request(upstream).await?;
    if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Ok(resp.map(Body::new));
    }

    let backend_upgrade = hyper::upgrade::on(&mut resp);
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok((client, backend)) => splice(TokioIo::new(client), TokioIo::new(backend)).await,
            Err(e) => error!(error = %e, "websocket upgrade failed"),
        }
    });

    let (parts, _) = resp.into_parts();
    Ok(Response::from_parts(parts, Body::empty()))
}

async fn dial(backend: &Backend, tls: Option<&TlsTarget>) -> Result<Box<dyn Io>, ProxyError> {
    let addr = backend.authority();
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|source| ProxyError::Dial { addr, source })?;
    match tls {
        Some(target) => {
            let stream = target
                .connector
                .connect(target.name.clone(), tcp)
                .await
                .map_err(ProxyError::Tls)?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tcp)),
    }
}

/// Copy bytes both ways; the first direction to finish ends the tunnel.
async fn splice<C, B>(client: C, backend: B)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);
    tokio::select! {
        res = tokio::io::copy(&mut client_rd, &mut backend_wr) => {
            debug!(result = ?res, "websocket client side closed");
        }
        res = tokio::io::copy(&mut backend_rd, &mut client_wr) => {
            debug!(result = ?res, "websocket backend side closed");
        }
    }
}
