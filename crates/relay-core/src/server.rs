//! Developer-facing HTTP(S) listener.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::harness::Harness;
use crate::tls;

/// Every path goes through [`Harness::handle`].
pub fn router(harness: Arc<Harness>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(harness)
        .layer(TraceLayer::new_for_http())
}

async fn handle(State(harness): State<Arc<Harness>>, req: Request) -> Response {
    harness.handle(req).await
}

/// Bind the configured address and serve until `shutdown` fires.
///
/// Open connections are not drained.
pub async fn serve(harness: Arc<Harness>, shutdown: CancellationToken) -> Result<()> {
    let address = harness.config().listen_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    let acceptor = match &harness.config().tls {
        Some(config) => Some(tls::acceptor(config)?),
        None => None,
    };
    info!(address = %address, tls = acceptor.is_some(), "Listening on address");

    let app = router(harness);
    match acceptor {
        Some(acceptor) => serve_tls(listener, app, acceptor, shutdown).await,
        None => {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            );
            tokio::select! {
                res = server.into_future() => res.context("harness server failed"),
                () = shutdown.cancelled() => Ok(()),
            }
        }
    }
}

async fn serve_tls(
    listener: TcpListener,
    app: Router,
    acceptor: TlsAcceptor,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (tcp, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            () = shutdown.cancelled() => return Ok(()),
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = service_fn(move |mut req: hyper::Request<Incoming>| {
                req.extensions_mut().insert(ConnectInfo(peer));
                app.clone().oneshot(req.map(Body::new))
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}
