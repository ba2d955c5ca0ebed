//! Reverse proxy and WebSocket tunnel over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use relay_core::config::free_port;
use relay_core::proxy::{Backend, Proxy};

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });
    addr
}

/// Front end that sends everything through `proxy`.
async fn spawn_proxy(backend_port: u16) -> SocketAddr {
    let proxy = Arc::new(
        Proxy::new(Backend {
            host: "127.0.0.1".to_string(),
            port: backend_port,
            tls: false,
        })
        .unwrap(),
    );
    let app = Router::new().fallback(move |req: Request| {
        let proxy = Arc::clone(&proxy);
        async move { proxy.forward(req).await }
    });
    spawn(app).await
}

async fn inspect(method: Method, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    (
        [("x-app", "yes")],
        format!(
            "{method} xff={forwarded} host={host} body={}",
            String::from_utf8_lossy(&body)
        ),
    )
}

fn backend_app() -> Router {
    Router::new()
        .route("/inspect", get(inspect).post(inspect))
        .route(
            "/length",
            axum::routing::post(|body: Bytes| async move { body.len().to_string() }),
        )
        .route("/redirect", get(|| async { Redirect::to("/elsewhere") }))
        .route(
            "/teapot",
            get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }),
        )
}

// ===========================================================================
// Plain HTTP
// ===========================================================================

#[tokio::test]
async fn forwards_method_body_and_headers() {
    let backend = spawn(backend_app()).await;
    let front = spawn_proxy(backend.port()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{front}/inspect"))
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-app"], "yes");
    let body = resp.text().await.unwrap();
    assert!(body.starts_with("POST xff=127.0.0.1 "), "body: {body}");
    assert!(body.contains(&format!("host=127.0.0.1:{}", backend.port())), "body: {body}");
    assert!(body.ends_with("body=payload"), "body: {body}");
}

#[tokio::test]
async fn large_body_is_streamed_through() {
    let backend = spawn(backend_app()).await;
    let front = spawn_proxy(backend.port()).await;
    let payload = vec![b'x'; 1024 * 1024];

    let resp = reqwest::Client::new()
        .post(format!("http://{front}/length"))
        .body(payload)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), (1024 * 1024).to_string());
}

#[tokio::test]
async fn backend_status_is_preserved() {
    let backend = spawn(backend_app()).await;
    let front = spawn_proxy(backend.port()).await;

    let resp = reqwest::get(format!("http://{front}/teapot")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(resp.text().await.unwrap(), "short and stout");
}

#[tokio::test]
async fn redirects_are_passed_through() {
    let backend = spawn(backend_app()).await;
    let front = spawn_proxy(backend.port()).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let resp = client
        .get(format!("http://{front}/redirect"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(resp.headers()[header::LOCATION], "/elsewhere");
}

#[tokio::test]
async fn unreachable_backend_is_bad_gateway() {
    let front = spawn_proxy(free_port().unwrap()).await;

    let resp = reqwest::get(format!("http://{front}/")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert!(resp.text().await.unwrap().contains("Error contacting backend server"));
}

// ===========================================================================
// WebSocket tunnel
// ===========================================================================

/// Raw backend: answers any request with 101, then echoes bytes.
async fn spawn_echo_upgrade_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                let mut line = String::new();
                loop {
                    line.clear();
                    if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    if line == "\r\n" {
                        break;
                    }
                }
                let mut stream = stream.into_inner();
                stream
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\n\
                          Upgrade: websocket\r\n\
                          Connection: Upgrade\r\n\r\n",
                    )
                    .await
                    .unwrap();
                let (mut rd, mut wr) = stream.split();
                tokio::io::copy(&mut rd, &mut wr).await.ok();
            });
        }
    });
    port
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn websocket_bytes_flow_both_ways() {
    let backend_port = spawn_echo_upgrade_backend().await;
    let front = spawn_proxy(backend_port).await;

    let mut client = TcpStream::connect(front).await.unwrap();
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101"), "head: {head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: websocket"), "head: {head}");

    for msg in [&b"hello"[..], b"second frame", b"\x81\x05bytes"] {
        client.write_all(msg).await.unwrap();
        let mut echoed = vec![0u8; msg.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, msg);
    }
}

#[tokio::test]
async fn websocket_dial_failure_is_internal_error() {
    let front = spawn_proxy(free_port().unwrap()).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{front}/ws"))
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(resp.text().await.unwrap().contains("Error contacting backend server"));
}

#[tokio::test]
async fn non_upgrading_backend_answer_is_returned() {
    // A plain HTTP backend refuses the upgrade; its answer goes back as-is.
    let backend = spawn(backend_app()).await;
    let front = spawn_proxy(backend.port()).await;

    let mut client = TcpStream::connect(front).await.unwrap();
    client
        .write_all(
            b"GET /teapot HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 418"), "head: {head}");
}

#[tokio::test]
async fn oneshot_request_without_connection_is_internal_error() {
    let backend = spawn(backend_app()).await;
    let proxy = Proxy::new(Backend {
        host: "127.0.0.1".to_string(),
        port: backend.port(),
        tls: false,
    })
    .unwrap();

    let req = axum::http::Request::builder()
        .uri("/ws")
        .header(header::UPGRADE, "WebSocket")
        .body(Body::empty())
        .unwrap();
    let resp = proxy.forward(req).await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
