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
use miette::Diagnostic;
use opentelemetry_otlp::ExporterBuildError;
use std::{io, net::SocketAddr, path::PathBuf};
use thiserror::Error;
use tracing_subscriber::util::TryInitError;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("invalid log sink '{0}'")]
    #[diagnostic(help("use stdout, stderr, off or the path of a log file"))]
    InvalidLogSink(String),
    #[error("could not open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("TLS certificate and key must be configured together")]
    #[diagnostic(help("set both GANTRY_TLS_CERT and GANTRY_TLS_KEY or neither"))]
    IncompleteTls,
    #[error("pool address {0} collides with the proxy's exposed socket")]
    #[diagnostic(help("point GANTRY_WORKER_BIND at a different (loopback) port"))]
    AddressCollision(SocketAddr),
    #[error("no application command configured in {0:?}")]
    #[diagnostic(help(
        "add an `application` entry to the config file or set GANTRY_WORKER_EXECUTABLE"
    ))]
    MissingApplication(PathBuf),
    #[error("invalid static URL prefix '{0}'")]
    #[diagnostic(help("the prefix must start with '/' and must not be the root path"))]
    InvalidStaticUrl(String),
    #[error("invalid status path '{0}'")]
    #[diagnostic(help(
        "the status path must start with '/' and must not contain '{{', '}}', '*' or segments starting with ':'"
    ))]
    InvalidStatusPath(String),
    #[error("status path '{path}' lies under the static URL prefix '{prefix}'")]
    #[diagnostic(help("move GANTRY_STATUS_PATH out of GANTRY_STATIC_URL"))]
    StatusPathCollision { path: String, prefix: String },
    #[error("proxy timeout of {proxy}s exceeds the per-request timeout of {worker}s")]
    #[diagnostic(help(
        "workers are replaced after GANTRY_TIMEOUT, so GANTRY_PROXY_TIMEOUT must not be longer"
    ))]
    ProxyTimeoutTooLong { proxy: u64, worker: u64 },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug, Diagnostic)]
pub enum TelemetryError {
    #[error("Tracing init error: {0}")]
    TryInit(#[from] TryInitError),
    #[error("Tracing exporter error: {0}")]
    ExporterBuildError(#[from] ExporterBuildError),
    #[error("Logging config error: {0}")]
    Config(#[from] ConfigError),
}

pub type TelemetryResult<T> = std::result::Result<T, TelemetryError>;
