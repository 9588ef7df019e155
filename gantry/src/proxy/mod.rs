/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */
//! The reverse proxy in front of the application pool.
//!
//! Requests under the static URL prefix are answered from the asset directory, the optional
//! status path reports the pool's state, everything else is forwarded to the pool.

mod forward;

pub use forward::{ProxyError, ProxyResult, Upstream, strip_hop_by_hop};

use crate::{
    net::init_server_socket,
    pool::status::{PoolState, PoolStatus},
};
use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use gantry_common::ACCESS_LOG_TARGET;
use miette::{Context, IntoDiagnostic, Result};
use std::{
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    pin::Pin,
    time::{Duration, Instant},
};
use tokio::{
    select,
    sync::{oneshot, watch},
};
use tokio_graceful_shutdown::SubsystemHandle;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFiles {
    /// Mount point without trailing slash, e.g. `/static`
    pub url_prefix: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub upstream: SocketAddr,
    pub upstream_timeout: Duration,
    pub static_files: Option<StaticFiles>,
    pub tls: Option<TlsConfig>,
    pub status_path: Option<String>,
    pub graceful_timeout: Duration,
}

pub fn router(config: &ProxyConfig, status: watch::Receiver<PoolStatus>) -> Router {
    let mut app: Router<Upstream> = Router::new();

    if let Some(path) = &config.status_path {
        app = app.route(path, get(pool_status).with_state(status));
    }

    if let Some(static_files) = &config.static_files {
        app = app.nest_service(&static_files.url_prefix, ServeDir::new(&static_files.root));
    }

    app.fallback(forward::forward)
        .with_state(Upstream::new(config.upstream, config.upstream_timeout))
        .layer(middleware::from_fn(access_log))
        .layer(TraceLayer::new_for_http())
}

/// Serves the proxy until shutdown is requested, then drains in-flight requests for up to the
/// graceful timeout. The bound address is reported through `bound` once the socket listens.
#[instrument(skip_all, fields(port = config.port, upstream = %config.upstream), err)]
pub async fn run_proxy(
    subsys: SubsystemHandle,
    config: ProxyConfig,
    status: watch::Receiver<PoolStatus>,
    bound: oneshot::Sender<SocketAddr>,
) -> Result<()> {
    let listener = init_server_socket(SocketAddr::new(config.bind_address, config.port))?;
    let local_addr = listener.local_addr().into_diagnostic()?;
    let proto = if config.tls.is_some() { "https" } else { "http" };

    let app = router(&config, status).into_make_service_with_connect_info::<SocketAddr>();
    let handle = Handle::new();

    let mut serve: Pin<Box<dyn Future<Output = io::Result<()>> + Send>> = match &config.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .into_diagnostic()
                .wrap_err_with(|| {
                    format!(
                        "could not load TLS certificate {:?} / key {:?}",
                        tls.cert, tls.key
                    )
                })?;
            Box::pin(
                axum_server::from_tcp_rustls(listener, rustls)
                    .handle(handle.clone())
                    .serve(app),
            )
        }
        None => Box::pin(axum_server::from_tcp(listener).handle(handle.clone()).serve(app)),
    };

    if let Some(static_files) = &config.static_files {
        info!(
            "Serving static files from {:?} at {proto}://{local_addr}{}/",
            static_files.root, static_files.url_prefix
        );
    }
    if let Some(path) = &config.status_path {
        info!("Serving pool status at {proto}://{local_addr}{path}");
    }
    info!(
        "Reverse proxy listening at {proto}://{local_addr}, forwarding to http://{}",
        config.upstream
    );
    bound.send(local_addr).ok();

    select! {
        res = &mut serve => res.into_diagnostic()?,
        _ = subsys.on_shutdown_requested() => {
            info!("Stopping reverse proxy …");
            handle.graceful_shutdown(Some(config.graceful_timeout));
            serve.await.into_diagnostic()?;
        },
    }

    debug!("Reverse proxy subsystem completed.");

    Ok(())
}

async fn pool_status(State(status): State<watch::Receiver<PoolStatus>>) -> impl IntoResponse {
    let status = status.borrow().clone();
    let code = match status.state {
        PoolState::Running | PoolState::WorkerRecycling => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(status))
}

async fn access_log(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let version = request.version();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        target: ACCESS_LOG_TARGET,
        "{remote} \"{method} {uri} {version:?}\" {} {}ms",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );

    response
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::{body::Bytes, http::HeaderMap};
    use http_body_util::{BodyExt, Full};
    use hyper_util::{
        client::legacy::{Client, connect::HttpConnector},
        rt::TokioExecutor,
    };
    use hyper_util::rt::TokioIo;
    use rustls::pki_types::{CertificateDer, ServerName, pem::PemObject};
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
    use tokio_rustls::TlsConnector;

    async fn echo(request: Request) -> String {
        let (parts, body) = request.into_parts();
        let header = parts
            .headers
            .get("x-test")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = body
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        format!(
            "{} {} {} {}",
            parts.method,
            parts.uri,
            header,
            String::from_utf8_lossy(&body)
        )
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("could not bind");
        let addr = listener.local_addr().expect("no local address");
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        });
        addr
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("could not bind");
        listener.local_addr().expect("no local address")
    }

    fn config(upstream: SocketAddr) -> ProxyConfig {
        ProxyConfig {
            bind_address: "127.0.0.1".parse().expect("invalid address"),
            port: 0,
            upstream,
            upstream_timeout: Duration::from_secs(5),
            static_files: None,
            tls: None,
            status_path: None,
            graceful_timeout: Duration::from_secs(1),
        }
    }

    fn status(state: PoolState) -> watch::Receiver<PoolStatus> {
        let mut status = PoolStatus::new(2);
        status.state = state;
        watch::channel(status).1
    }

    async fn send(
        method: &str,
        addr: SocketAddr,
        path: &str,
        body: &'static str,
    ) -> (StatusCode, HeaderMap, String) {
        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let request = axum::http::Request::builder()
            .method(method)
            .uri(format!("http://{addr}{path}"))
            .header("x-test", "passed")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .expect("invalid request");
        let response = client.request(request).await.expect("request failed");
        let (parts, body) = response.into_parts();
        let body = body.collect().await.expect("no body").to_bytes();
        (
            parts.status,
            parts.headers,
            String::from_utf8_lossy(&body).into_owned(),
        )
    }

    #[tokio::test]
    async fn requests_are_forwarded_unmodified() {
        let upstream = serve(Router::new().fallback(echo)).await;
        let proxy = serve(router(&config(upstream), status(PoolState::Running))).await;

        let (code, _, body) = send("POST", proxy, "/orders/42?verbose=1", "payload").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "POST /orders/42?verbose=1 passed payload");
    }

    #[tokio::test]
    async fn unreachable_pool_yields_bad_gateway() {
        let upstream = closed_port().await;
        let proxy = serve(router(&config(upstream), status(PoolState::Running))).await;

        let (code, _, _) = send("GET", proxy, "/", "").await;

        assert_eq!(code, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn slow_pool_yields_gateway_timeout() {
        let upstream = serve(Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "too late"
        }))
        .await;
        let mut config = config(upstream);
        config.upstream_timeout = Duration::from_millis(300);
        let proxy = serve(router(&config, status(PoolState::Running))).await;

        let started = Instant::now();
        let (code, _, _) = send("GET", proxy, "/slow", "").await;

        assert_eq!(code, StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn static_files_are_served_without_the_pool() {
        let dir = tempfile::tempdir().expect("could not create temp dir");
        std::fs::write(dir.path().join("site.css"), "body { margin: 0 }")
            .expect("could not write asset");
        let upstream = closed_port().await;
        let mut config = config(upstream);
        config.static_files = Some(StaticFiles {
            url_prefix: "/static".to_owned(),
            root: dir.path().to_owned(),
        });
        let proxy = serve(router(&config, status(PoolState::Running))).await;

        let (code, _, body) = send("GET", proxy, "/static/site.css", "").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "body { margin: 0 }");

        let (code, _, _) = send("GET", proxy, "/static/missing.js", "").await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _, _) = send("GET", proxy, "/dynamic", "").await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn hop_by_hop_headers_of_the_pool_are_dropped() {
        let upstream = serve(Router::new().fallback(|| async {
            (
                [("keep-alive", "timeout=5"), ("x-app", "yes")],
                "with headers",
            )
        }))
        .await;
        let proxy = serve(router(&config(upstream), status(PoolState::Running))).await;

        let (code, headers, body) = send("GET", proxy, "/", "").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "with headers");
        assert!(headers.get("keep-alive").is_none());
        assert_eq!(
            headers.get("x-app").and_then(|v| v.to_str().ok()),
            Some("yes")
        );
    }

    #[tokio::test]
    async fn status_endpoint_reports_pool_state() {
        let upstream = closed_port().await;
        let mut config = config(upstream);
        config.status_path = Some("/_gantry/status".to_owned());

        let proxy = serve(router(&config, status(PoolState::Running))).await;
        let (code, _, body) = send("GET", proxy, "/_gantry/status", "").await;
        assert_eq!(code, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).expect("invalid json");
        assert_eq!(json["state"], "running");
        assert_eq!(json["configured"], 2);

        let proxy = serve(router(&config, status(PoolState::Starting))).await;
        let (code, _, _) = send("GET", proxy, "/_gantry/status", "").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    fn tls_config(upstream: SocketAddr, key: PathBuf) -> ProxyConfig {
        ProxyConfig {
            tls: Some(TlsConfig {
                cert: fixture("localhost.pem"),
                key,
            }),
            ..config(upstream)
        }
    }

    async fn get_over_tls(addr: SocketAddr, path: &str) -> (StatusCode, String) {
        let mut roots = rustls::RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(fixture("ca.pem")).expect("could not read CA") {
            roots.add(cert.expect("invalid CA")).expect("invalid CA");
        }
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let stream = TcpStream::connect(addr).await.expect("could not connect");
        let domain = ServerName::try_from("localhost").expect("invalid server name");
        let stream = TlsConnector::from(Arc::new(tls))
            .connect(domain, stream)
            .await
            .expect("TLS handshake failed");

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .expect("HTTP handshake failed");
        tokio::spawn(connection);

        let request = axum::http::Request::builder()
            .uri(path)
            .header("host", "localhost")
            .body(Full::new(Bytes::new()))
            .expect("invalid request");
        let response = sender.send_request(request).await.expect("request failed");
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("no body")
            .to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn proxy_terminates_tls() {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .ok();
        let upstream = serve(Router::new().fallback(|| async { "over tls" })).await;
        let config = tls_config(upstream, fixture("localhost.key"));
        let (bound_tx, bound_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        Toplevel::new(|s: SubsystemHandle| async move {
            s.start(SubsystemBuilder::new("proxy", move |s| {
                run_proxy(s, config, status(PoolState::Running), bound_tx)
            }));
            s.start(SubsystemBuilder::new(
                "client",
                move |s: SubsystemHandle| async move {
                    let addr = bound_rx.await.into_diagnostic()?;
                    done_tx.send(get_over_tls(addr, "/hello").await).ok();
                    s.request_shutdown();
                    Ok::<(), miette::Report>(())
                },
            ));
        })
        .handle_shutdown_requests(Duration::from_secs(5))
        .await
        .expect("shutdown failed");

        let (code, body) = done_rx.await.expect("client did not report");
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "over tls");
    }

    #[tokio::test]
    async fn unreadable_tls_key_keeps_the_port_closed() {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .ok();
        let config = tls_config(closed_port().await, fixture("missing.key"));
        let (bound_tx, bound_rx) = oneshot::channel();

        let result = Toplevel::new(|s: SubsystemHandle| async move {
            s.start(SubsystemBuilder::new("proxy", move |s| {
                run_proxy(s, config, status(PoolState::Running), bound_tx)
            }));
        })
        .handle_shutdown_requests(Duration::from_secs(5))
        .await;

        assert!(result.is_err());
        assert!(bound_rx.await.is_err());
    }
}
