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
use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        self, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version,
        header::{CONNECTION, HOST},
    },
    response::{IntoResponse, Response},
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use miette::Diagnostic;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, warn};

type UpstreamClient = Client<HttpConnector, Body>;

/// Headers that describe a single connection and must not be forwarded (RFC 9110, 7.6.1).
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug, Diagnostic)]
pub enum ProxyError {
    #[error("application pool at {0} is unreachable: {1}")]
    Unreachable(SocketAddr, String),
    #[error("application pool at {0} did not respond within {1:?}")]
    Timeout(SocketAddr, Duration),
    #[error("could not build upstream request: {0}")]
    InvalidRequest(#[from] http::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            ProxyError::Unreachable(..) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(..) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, status.to_string()).into_response()
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// The application pool as seen from the proxy.
#[derive(Clone)]
pub struct Upstream {
    client: UpstreamClient,
    addr: SocketAddr,
    authority: String,
    timeout: Duration,
}

impl Upstream {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(timeout));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            addr,
            authority: addr.to_string(),
            timeout,
        }
    }
}

/// Relays a request to the pool and the pool's response back to the client.
///
/// The timeout covers connecting and waiting for the response head. Bodies are streamed in both
/// directions.
pub async fn forward(
    State(upstream): State<Upstream>,
    request: Request,
) -> ProxyResult<Response> {
    let (mut parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    // HTTP/2 clients send the host as URI authority only
    let missing_host = !parts.headers.contains_key(HOST);
    if let Some(host) = parts
        .uri
        .authority()
        .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        .filter(|_| missing_host)
    {
        parts.headers.insert(HOST, host);
    }

    parts.uri = Uri::builder()
        .scheme("http")
        .authority(upstream.authority.as_str())
        .path_and_query(path_and_query)
        .build()?;
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);

    let request = Request::from_parts(parts, body);

    let response = match timeout(upstream.timeout, upstream.client.request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!("Error forwarding request to {}: {e}", upstream.addr);
            return Err(ProxyError::Unreachable(upstream.addr, e.to_string()));
        }
        Err(_) => {
            warn!(
                "Application pool did not respond within {:?}.",
                upstream.timeout
            );
            return Err(ProxyError::Timeout(upstream.addr, upstream.timeout));
        }
    };

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    Ok(Response::from_parts(parts, Body::new(body)))
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
