//! Integration tests for the reverse proxy: forwarding, the auth cookie
//! gate, upstream timeouts, and access counting against real in-process
//! backends.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use mirage_ecs::auth::{Auth, AUTH_COOKIE_NAME};
use mirage_ecs::config::{Config, ConfigParams, PortMap};
use mirage_ecs::pool::{BoxError, UpstreamBody};
use mirage_ecs::proxy::ReverseProxy;
use tokio::net::TcpListener;

/// Start a backend that answers 200 "OK" after an optional delay.
async fn spawn_backend(delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .status(200)
                            .body(Full::new(Bytes::from_static(b"OK")))
                            .unwrap(),
                    )
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });
    port
}

fn local_config(require_auth_cookie: bool, proxy_timeout: u64) -> Config {
    let mut cfg = Config::new(&ConfigParams {
        path: None,
        domain: "example.net".to_string(),
        default_port: 80,
        local_mode: true,
    })
    .unwrap();
    cfg.listen.http = vec![PortMap {
        name: "http".to_string(),
        listen: 80,
        target: 80,
        require_auth_cookie,
    }];
    cfg.network.proxy_timeout = proxy_timeout;
    cfg
}

fn test_auth() -> Arc<Auth> {
    Arc::new(Auth {
        cookie_secret: "proxy-test-secret".to_string(),
        ..Auth::default()
    })
}

fn proxy_request(host: &str, method: Method, cookie: Option<&str>) -> Request<UpstreamBody> {
    let mut builder = Request::builder()
        .method(method)
        .uri("/")
        .header(hyper::header::HOST, host);
    if let Some(value) = cookie {
        builder = builder.header(
            hyper::header::COOKIE,
            HeaderValue::from_str(&format!("{AUTH_COOKIE_NAME}={value}")).unwrap(),
        );
    }
    builder
        .body(
            Full::new(Bytes::new())
                .map_err(|never| -> BoxError { match never {} })
                .boxed(),
        )
        .unwrap()
}

async fn response_text(resp: mirage_ecs::proxy::ProxyResponse) -> (StatusCode, String) {
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

fn count_for(proxy: &ReverseProxy, subdomain: &str) -> i64 {
    proxy
        .collect_access_counts()
        .get(subdomain)
        .map(|buckets| buckets.values().sum())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_forward_roundtrip() {
    let backend = spawn_backend(Duration::ZERO).await;
    let proxy = ReverseProxy::new(&local_config(false, 0), None);
    proxy.add_subdomain("app", "127.0.0.1", backend);

    let (status, body) = response_text(
        proxy
            .serve_with_port(proxy_request("app.example.net", Method::GET, None), 80, None)
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert_eq!(count_for(&proxy, "app"), 1);
}

#[tokio::test]
async fn test_unknown_subdomain_is_404() {
    let proxy = ReverseProxy::new(&local_config(false, 0), None);
    let (status, _) = response_text(
        proxy
            .serve_with_port(proxy_request("ghost.example.net", Method::GET, None), 80, None)
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    let proxy = ReverseProxy::new(&local_config(false, 0), None);
    // Nothing listens here.
    proxy.add_subdomain("dead", "127.0.0.1", 59998);

    let (status, _) = response_text(
        proxy
            .serve_with_port(proxy_request("dead.example.net", Method::GET, None), 80, None)
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    // The failed request still counted.
    assert_eq!(count_for(&proxy, "dead"), 1);
}

#[tokio::test]
async fn test_upstream_timeout_is_504() {
    let backend = spawn_backend(Duration::from_millis(1500)).await;
    let proxy = ReverseProxy::new(&local_config(false, 1), None);
    proxy.add_subdomain("slow", "127.0.0.1", backend);

    let (status, body) = response_text(
        proxy
            .serve_with_port(proxy_request("slow.example.net", Method::GET, None), 80, None)
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body.contains("slow upstream timeout: "), "got: {body}");
}

#[tokio::test]
async fn test_cookie_gate() {
    let backend = spawn_backend(Duration::ZERO).await;
    let auth = test_auth();
    let proxy = ReverseProxy::new(&local_config(true, 0), Some(auth.clone()));
    proxy.add_subdomain("gated", "127.0.0.1", backend);

    // Without a cookie: forbidden, upstream never sees the request, but the
    // access is still counted.
    let (status, body) = response_text(
        proxy
            .serve_with_port(proxy_request("gated.example.net", Method::GET, None), 80, None)
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Forbidden");
    assert_eq!(count_for(&proxy, "gated"), 1);

    // A garbage cookie is rejected too.
    let (status, _) = response_text(
        proxy
            .serve_with_port(
                proxy_request("gated.example.net", Method::GET, Some("bogus")),
                80,
                None,
            )
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // With a valid cookie the upstream body comes back.
    let cookie = auth
        .new_auth_cookie(Duration::from_secs(60), ".example.net")
        .unwrap()
        .unwrap();
    let value = cookie
        .trim_start_matches(&format!("{AUTH_COOKIE_NAME}="))
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let (status, body) = response_text(
        proxy
            .serve_with_port(
                proxy_request("gated.example.net", Method::GET, Some(&value)),
                80,
                None,
            )
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");

    // Preflight requests pass the gate without a cookie.
    let (status, _) = response_text(
        proxy
            .serve_with_port(
                proxy_request("gated.example.net", Method::OPTIONS, None),
                80,
                None,
            )
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Three more requests were presented to the gate since the last drain.
    assert_eq!(count_for(&proxy, "gated"), 3);
}

#[tokio::test]
async fn test_wildcard_subdomain_forwards() {
    let backend = spawn_backend(Duration::ZERO).await;
    let proxy = ReverseProxy::new(&local_config(false, 0), None);
    proxy.add_subdomain("review-*", "127.0.0.1", backend);

    let (status, body) = response_text(
        proxy
            .serve_with_port(
                proxy_request("review-123.example.net", Method::GET, None),
                80,
                None,
            )
            .await,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");

    // Accesses are attributed to the registered wildcard key.
    assert_eq!(count_for(&proxy, "review-*"), 1);
}
