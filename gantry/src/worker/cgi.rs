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
//! CGI/1.1 (RFC 3875) bridge between an HTTP request and the application command.

use bytes::Bytes;
use gantry_common::command::CommandDefinition;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{
    Request, Response, StatusCode,
    body::Body,
    header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName, HeaderValue, LOCATION},
    http::request::Parts,
};
use miette::Diagnostic;
use std::{io, net::SocketAddr, process::Stdio};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
};

#[derive(Error, Debug, Diagnostic)]
pub enum CgiError {
    #[error("could not start application {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error talking to the application: {0}")]
    Io(#[from] io::Error),
    #[error("could not read request body: {0}")]
    Body(String),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("application exited with {0} without a response")]
    NoResponse(std::process::ExitStatus),
    #[error("application response has no header section")]
    MissingHeaders,
    #[error("malformed header line in application response: {0:?}")]
    MalformedHeader(String),
    #[error("invalid status in application response: {0:?}")]
    InvalidStatus(String),
}

impl CgiError {
    /// Status the worker answers with when a request fails.
    pub fn status(&self) -> StatusCode {
        match self {
            CgiError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type CgiResult<T> = Result<T, CgiError>;

/// Runs the application command once per request.
#[derive(Debug, Clone)]
pub struct CgiApplication {
    command: CommandDefinition,
    server_addr: SocketAddr,
    max_body_size: usize,
}

impl CgiApplication {
    pub fn new(command: CommandDefinition, server_addr: SocketAddr, max_body_size: usize) -> Self {
        Self {
            command,
            server_addr,
            max_body_size,
        }
    }

    pub async fn call<B>(
        &self,
        request: Request<B>,
        remote: SocketAddr,
    ) -> CgiResult<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        // the body is buffered before the application starts
        let body = Limited::new(body, self.max_body_size)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    CgiError::BodyTooLarge(self.max_body_size)
                } else {
                    CgiError::Body(e.to_string())
                }
            })?
            .to_bytes();

        let mut command = Command::from(&self.command);
        command
            .env_clear()
            .envs(inherited_env())
            .envs(self.command.env())
            .envs(meta_variables(&parts, body.len(), remote, self.server_addr))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());

        let mut child = command.spawn().map_err(|source| CgiError::Spawn {
            command: self.command.to_string(),
            source,
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("application stdin not captured"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("application stdout not captured"))?;

        let write = async move {
            stdin.write_all(&body).await?;
            stdin.shutdown().await?;
            Ok::<_, io::Error>(())
        };
        let read = async {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).await.map(|_| output)
        };
        let (written, output) = tokio::join!(write, read);

        // applications may answer without consuming the request body
        written.or_else(|e| match e.kind() {
            io::ErrorKind::BrokenPipe => Ok(()),
            _ => Err(e),
        })?;
        let output = output?;
        let status = child.wait().await?;

        if output.is_empty() && !status.success() {
            return Err(CgiError::NoResponse(status));
        }

        parse_response(&output)
    }
}

/// Environment of the worker that is passed on to the application. CGI applications get a clean
/// environment apart from these and the request meta-variables.
fn inherited_env() -> impl Iterator<Item = (String, String)> {
    std::env::vars().filter(|(key, _)| !key.starts_with("HTTP_") && !is_meta_variable(key))
}

fn is_meta_variable(key: &str) -> bool {
    matches!(
        key,
        "AUTH_TYPE"
            | "CONTENT_LENGTH"
            | "CONTENT_TYPE"
            | "GATEWAY_INTERFACE"
            | "PATH_INFO"
            | "PATH_TRANSLATED"
            | "QUERY_STRING"
            | "REMOTE_ADDR"
            | "REMOTE_HOST"
            | "REMOTE_IDENT"
            | "REMOTE_PORT"
            | "REMOTE_USER"
            | "REQUEST_METHOD"
            | "REQUEST_URI"
            | "SCRIPT_NAME"
            | "SERVER_NAME"
            | "SERVER_PORT"
            | "SERVER_PROTOCOL"
            | "SERVER_SOFTWARE"
    )
}

pub fn meta_variables(
    parts: &Parts,
    content_length: usize,
    remote: SocketAddr,
    server: SocketAddr,
) -> Vec<(String, String)> {
    let header = |name: &HeaderName| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };

    let server_name = header(&HOST)
        .map(|host| match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_owned(),
            _ => host,
        })
        .unwrap_or_else(|| server.ip().to_string());

    let mut vars = vec![
        ("GATEWAY_INTERFACE".to_owned(), "CGI/1.1".to_owned()),
        (
            "SERVER_SOFTWARE".to_owned(),
            format!("gantry-worker/{}", env!("CARGO_PKG_VERSION")),
        ),
        ("SERVER_PROTOCOL".to_owned(), format!("{:?}", parts.version)),
        ("SERVER_NAME".to_owned(), server_name),
        ("SERVER_PORT".to_owned(), server.port().to_string()),
        ("REQUEST_METHOD".to_owned(), parts.method.to_string()),
        ("REQUEST_URI".to_owned(), parts.uri.to_string()),
        ("SCRIPT_NAME".to_owned(), String::new()),
        ("PATH_INFO".to_owned(), parts.uri.path().to_owned()),
        (
            "QUERY_STRING".to_owned(),
            parts.uri.query().unwrap_or_default().to_owned(),
        ),
        ("REMOTE_ADDR".to_owned(), remote.ip().to_string()),
        ("REMOTE_PORT".to_owned(), remote.port().to_string()),
    ];

    if content_length > 0 || parts.headers.contains_key(CONTENT_LENGTH) {
        vars.push(("CONTENT_LENGTH".to_owned(), content_length.to_string()));
    }
    if let Some(content_type) = header(&CONTENT_TYPE) {
        vars.push(("CONTENT_TYPE".to_owned(), content_type));
    }

    for name in parts.headers.keys() {
        // Proxy is skipped so clients cannot set the application's HTTP_PROXY
        if *name == CONTENT_LENGTH || *name == CONTENT_TYPE || name.as_str() == "proxy" {
            continue;
        }
        let values: Vec<&str> = parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            continue;
        }
        let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        vars.push((key, values.join(", ")));
    }

    vars
}

/// Turns CGI output (header lines, blank line, body) into an HTTP response.
pub fn parse_response(output: &[u8]) -> CgiResult<Response<Full<Bytes>>> {
    let (head, body) = split_head(output).ok_or(CgiError::MissingHeaders)?;
    let head = std::str::from_utf8(head)
        .map_err(|_| CgiError::MalformedHeader(String::from_utf8_lossy(head).into_owned()))?;

    let mut response = Response::new(Full::new(Bytes::copy_from_slice(body)));
    let mut status = None;

    for line in head.lines().filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CgiError::MalformedHeader(line.to_owned()))?;
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or_default();
            let code = code
                .parse::<u16>()
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| CgiError::InvalidStatus(value.to_owned()))?;
            status = Some(code);
            continue;
        }

        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| CgiError::MalformedHeader(line.to_owned()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| CgiError::MalformedHeader(line.to_owned()))?;
        response.headers_mut().append(name, value);
    }

    *response.status_mut() = match status {
        Some(status) => status,
        None if response.headers().contains_key(LOCATION) => StatusCode::FOUND,
        None => StatusCode::OK,
    };

    Ok(response)
}

fn split_head(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(output, b"\r\n\r\n").map(|i| (i, 4));
    let lf = find(output, b"\n\n").map(|i| (i, 2));
    let (index, len) = [crlf, lf]
        .into_iter()
        .flatten()
        .min_by_key(|(index, _)| *index)?;
    Some((&output[..index], &output[index + len..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod test {
    use super::*;
    use hyper::Method;

    const MAX_BODY: usize = 1024;

    fn remote() -> SocketAddr {
        "10.0.0.7:51234".parse().expect("invalid address")
    }

    fn server() -> SocketAddr {
        "127.0.0.1:8000".parse().expect("invalid address")
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("no body")
            .to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn plain_response_defaults_to_ok() {
        let response = parse_response(b"Content-Type: text/plain\r\nX-App: yes\r\n\r\nhello")
            .expect("invalid response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type"),
            Some(&HeaderValue::from_static("text/plain"))
        );
        assert_eq!(
            response.headers().get("x-app"),
            Some(&HeaderValue::from_static("yes"))
        );
        assert_eq!(body(response).await, "hello");
    }

    #[test]
    fn status_header_sets_the_status() {
        let response = parse_response(b"Status: 404 Not Found\nContent-Type: text/html\n\n<h1>nope</h1>")
            .expect("invalid response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("status").is_none());
    }

    #[test]
    fn location_without_status_redirects() {
        let response =
            parse_response(b"Location: /login\r\n\r\n").expect("invalid response");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION),
            Some(&HeaderValue::from_static("/login"))
        );
    }

    #[tokio::test]
    async fn body_may_contain_blank_lines() {
        let response = parse_response(b"Content-Type: text/plain\n\nfirst\n\nsecond")
            .expect("invalid response");
        assert_eq!(body(response).await, "first\n\nsecond");
    }

    #[test]
    fn broken_output_is_rejected() {
        assert!(matches!(
            parse_response(b"just some text"),
            Err(CgiError::MissingHeaders)
        ));
        assert!(matches!(
            parse_response(b"no colon here\n\nbody"),
            Err(CgiError::MalformedHeader(_))
        ));
        assert!(matches!(
            parse_response(b"Status: teapot\n\n"),
            Err(CgiError::InvalidStatus(_))
        ));
    }

    #[test]
    fn request_is_described_by_meta_variables() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/orders/42?verbose=1")
            .header("host", "shop.example.com:8080")
            .header("content-type", "application/json")
            .header("x-request-id", "abc")
            .header("accept", "text/html")
            .header("accept", "application/json")
            .header("proxy", "http://evil.example.com")
            .body(())
            .expect("invalid request");
        let (parts, _) = request.into_parts();

        let vars = meta_variables(&parts, 17, remote(), server());
        let get = |key: &str| {
            vars.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(get("PATH_INFO"), Some("/orders/42"));
        assert_eq!(get("QUERY_STRING"), Some("verbose=1"));
        assert_eq!(get("CONTENT_LENGTH"), Some("17"));
        assert_eq!(get("CONTENT_TYPE"), Some("application/json"));
        assert_eq!(get("SERVER_NAME"), Some("shop.example.com"));
        assert_eq!(get("SERVER_PORT"), Some("8000"));
        assert_eq!(get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(get("REMOTE_ADDR"), Some("10.0.0.7"));
        assert_eq!(get("HTTP_X_REQUEST_ID"), Some("abc"));
        assert_eq!(get("HTTP_ACCEPT"), Some("text/html, application/json"));
        assert_eq!(get("HTTP_CONTENT_TYPE"), None);
        assert_eq!(get("HTTP_PROXY"), None);
    }

    #[tokio::test]
    async fn application_receives_request_and_produces_response() {
        let app = CgiApplication::new(
            CommandDefinition::new(
                "sh",
                vec![
                    "-c".into(),
                    r#"printf 'Content-Type: text/plain\r\n\r\n%s %s %s' "$REQUEST_METHOD" "$PATH_INFO" "$(cat)""#
                        .into(),
                ],
            ),
            server(),
            MAX_BODY,
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .body(Full::new(Bytes::from_static(b"payload")))
            .expect("invalid request");

        let response = app.call(request, remote()).await.expect("call failed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "POST /echo payload");
    }

    #[tokio::test]
    async fn application_without_output_is_an_error() {
        let app = CgiApplication::new(
            CommandDefinition::new("sh", vec!["-c".into(), "exit 2".into()]),
            server(),
            MAX_BODY,
        );
        let request = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .expect("invalid request");

        assert!(matches!(
            app.call(request, remote()).await,
            Err(CgiError::NoResponse(_))
        ));
    }

    #[tokio::test]
    async fn missing_application_is_a_spawn_error() {
        let app = CgiApplication::new(
            CommandDefinition::new("/nonexistent/gantry-test-app", vec![]),
            server(),
            MAX_BODY,
        );
        let request = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .expect("invalid request");

        assert!(matches!(
            app.call(request, remote()).await,
            Err(CgiError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_the_application_starts() {
        let app = CgiApplication::new(
            CommandDefinition::new("/nonexistent/gantry-test-app", vec![]),
            server(),
            MAX_BODY,
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(Full::new(Bytes::from(vec![b'x'; MAX_BODY + 1])))
            .expect("invalid request");

        let err = app
            .call(request, remote())
            .await
            .expect_err("oversized body accepted");

        assert!(matches!(err, CgiError::BodyTooLarge(MAX_BODY)));
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn other_failures_are_internal_errors() {
        assert_eq!(
            CgiError::MissingHeaders.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            CgiError::Body("reset".to_owned()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
