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
use crate::{
    pool::PoolConfig,
    proxy::{ProxyConfig, StaticFiles, TlsConfig},
    sequencer::StartupStep,
};
use clap::{Parser, Subcommand};
use gantry_common::{
    DEFAULT_MAX_BODY_SIZE, ENV_CONFIG_PATH, ENV_MAX_BODY_SIZE,
    command::CommandDefinition,
    error::ConfigError,
    logging::{self, LogSink, LoggingConfig},
};
use miette::{Context, IntoDiagnostic, Result};
use serde::Deserialize;
use std::{
    env,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    process,
    time::Duration,
};
use tokio::fs;
use tracing::{debug, info, level_filters::LevelFilter, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Container entrypoint: startup steps, reverse proxy and application worker pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the startup steps, then serve the reverse proxy and the application pool until terminated
    Start(Args),
}

#[derive(Debug, Parser)]
struct Args {
    /// Path to the YAML file listing the startup steps and the application command
    #[arg(short, long, env = ENV_CONFIG_PATH, default_value = "./gantry.yaml")]
    config_path: PathBuf,
    /// Port the reverse proxy exposes
    #[arg(short, long, env = "GANTRY_PORT")]
    port: u16,
    /// Address the reverse proxy binds to
    #[arg(long, env = "GANTRY_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,
    /// Number of application worker processes
    #[arg(short, long, env = "GANTRY_WORKERS", value_parser = clap::value_parser!(u16).range(1..))]
    workers: u16,
    /// Internal address all workers of the application pool listen on
    #[arg(long, env = "GANTRY_WORKER_BIND", default_value = "127.0.0.1:8000")]
    worker_bind: SocketAddr,
    /// Per-request timeout in seconds. Workers busy for longer are terminated and replaced
    #[arg(short, long, env = "GANTRY_TIMEOUT", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,
    /// Time in seconds the proxy waits for the pool to respond. Defaults to the per-request timeout
    #[arg(long, env = "GANTRY_PROXY_TIMEOUT", value_parser = clap::value_parser!(u64).range(1..))]
    proxy_timeout: Option<u64>,
    /// Largest request body in bytes a worker hands to the application
    #[arg(long, env = ENV_MAX_BODY_SIZE, default_value_t = DEFAULT_MAX_BODY_SIZE)]
    max_body_size: usize,
    /// Time in seconds in-flight requests and workers get to finish on shutdown
    #[arg(long, env = "GANTRY_GRACEFUL_TIMEOUT", default_value_t = 5)]
    graceful_timeout: u64,
    /// Log verbosity (error, warn, info, debug, trace or off)
    #[arg(long, env = "GANTRY_LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,
    /// Access log of the application pool (stdout, stderr, off or a file path)
    #[arg(long, env = "GANTRY_ACCESS_LOG", default_value = "stdout")]
    access_log: LogSink,
    /// Error log of the application pool (stdout, stderr, off or a file path)
    #[arg(long, env = "GANTRY_ERROR_LOG", default_value = "stderr")]
    error_log: LogSink,
    /// Access log of the reverse proxy (stdout, stderr, off or a file path)
    #[arg(long, env = "GANTRY_PROXY_ACCESS_LOG", default_value = "stdout")]
    proxy_access_log: LogSink,
    /// Error log of the reverse proxy and the orchestrator (stdout, stderr, off or a file path)
    #[arg(long, env = "GANTRY_PROXY_ERROR_LOG", default_value = "stderr")]
    proxy_error_log: LogSink,
    /// Directory of static assets served by the reverse proxy
    #[arg(long, env = "GANTRY_STATIC_ROOT")]
    static_root: Option<PathBuf>,
    /// URL prefix static assets are served under
    #[arg(long, env = "GANTRY_STATIC_URL", default_value = "/static/")]
    static_url: String,
    /// PEM certificate chain for TLS termination
    #[arg(long, env = "GANTRY_TLS_CERT")]
    tls_cert: Option<PathBuf>,
    /// PEM private key for TLS termination
    #[arg(long, env = "GANTRY_TLS_KEY")]
    tls_key: Option<PathBuf>,
    /// Path of the pool status endpoint, disabled if omitted
    #[arg(long, env = "GANTRY_STATUS_PATH")]
    status_path: Option<String>,
    /// Worker executable. If omitted, gantry-worker is looked up next to this executable, then in the PATH
    #[arg(long, env = "GANTRY_WORKER_EXECUTABLE")]
    worker_executable: Option<PathBuf>,
    /// Directory for worker heartbeat files
    #[arg(long, env = "GANTRY_HEARTBEAT_DIR")]
    heartbeat_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub steps: Vec<StartupStep>,
    pub application: Option<CommandDefinition>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub steps: Vec<StartupStep>,
    pub proxy: ProxyConfig,
    pub pool: PoolConfig,
    pub graceful_timeout: Duration,
}

pub async fn instrument_and_load_config() -> Result<Config> {
    let Cli {
        command: Command::Start(args),
    } = Cli::parse();

    logging::init(&LoggingConfig {
        service_name: "gantry",
        instance_name: format!("gantry-{}", process::id()),
        level: args.log_level,
        error_log: args.proxy_error_log.clone(),
        access_log: args.proxy_access_log.clone(),
    })
    .await?;

    let config_file = load_config_file(&args.config_path).await?;

    load_config(args, config_file)
}

pub(crate) async fn load_config_file(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let yaml = fs::read_to_string(&path)
        .await
        .into_diagnostic()
        .wrap_err_with(|| {
            format!(
                "could not read config file {}",
                path.as_ref().to_string_lossy()
            )
        })?;
    serde_yaml::from_str(&yaml)
        .into_diagnostic()
        .wrap_err_with(|| {
            format!(
                "could not parse config file {}",
                path.as_ref().to_string_lossy()
            )
        })
}

fn load_config(args: Args, config_file: ConfigFile) -> Result<Config> {
    info!("Loading gantry config …");

    let exposed = SocketAddr::new(args.bind_address, args.port);
    check_pool_address(exposed, args.worker_bind)?;

    if args.worker_executable.is_none() && config_file.application.is_none() {
        return Err(ConfigError::MissingApplication(args.config_path).into());
    }

    let tls = match (args.tls_cert, args.tls_key) {
        (Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
        (None, None) => None,
        _ => return Err(ConfigError::IncompleteTls.into()),
    };

    let static_files = match args.static_root {
        Some(root) => Some(StaticFiles {
            url_prefix: normalize_static_url(&args.static_url)?,
            root,
        }),
        None => None,
    };

    if let Some(path) = &args.status_path {
        check_status_path(path, static_files.as_ref().map(|s| s.url_prefix.as_str()))?;
    }

    let upstream_timeout = match args.proxy_timeout {
        Some(proxy) if proxy > args.timeout => {
            return Err(ConfigError::ProxyTimeoutTooLong {
                proxy,
                worker: args.timeout,
            }
            .into());
        }
        Some(proxy) => Duration::from_secs(proxy),
        None => Duration::from_secs(args.timeout),
    };

    for step in &config_file.steps {
        if step.required && !step.idempotent {
            warn!(
                "Required startup step '{}' is not marked idempotent; it runs again on every container restart.",
                step.name
            );
        }
    }

    let timeout = Duration::from_secs(args.timeout);
    let graceful_timeout = Duration::from_secs(args.graceful_timeout);

    let proxy = ProxyConfig {
        bind_address: args.bind_address,
        port: args.port,
        upstream: upstream_address(args.worker_bind),
        upstream_timeout,
        static_files,
        tls,
        status_path: args.status_path,
        graceful_timeout,
    };

    let pool = PoolConfig {
        bind: args.worker_bind,
        workers: args.workers as usize,
        timeout,
        graceful_timeout,
        max_body_size: args.max_body_size,
        log_level: args.log_level,
        access_log: args.access_log,
        error_log: args.error_log,
        worker_executable: resolve_worker_executable(args.worker_executable),
        config_path: args.config_path,
        heartbeat_dir: args
            .heartbeat_dir
            .unwrap_or_else(|| env::temp_dir().join(format!("gantry-{}", process::id()))),
    };

    let config = Config {
        steps: config_file.steps,
        proxy,
        pool,
        graceful_timeout,
    };

    debug!("Effective config: {config:?}");

    Ok(config)
}

fn check_pool_address(exposed: SocketAddr, pool: SocketAddr) -> Result<(), ConfigError> {
    let same_port = exposed.port() == pool.port();
    let overlapping_ip = exposed.ip() == pool.ip()
        || exposed.ip().is_unspecified()
        || pool.ip().is_unspecified();
    if same_port && overlapping_ip {
        return Err(ConfigError::AddressCollision(pool));
    }
    if !pool.ip().is_loopback() {
        warn!(
            "Application pool binds to non-loopback address {pool}; workers may be reachable without going through the proxy."
        );
    }
    Ok(())
}

/// Axum rejects nested routes with a trailing slash, so `/static/` is mounted as `/static`.
fn normalize_static_url(url: &str) -> Result<String, ConfigError> {
    let trimmed = url.trim().trim_end_matches('/');
    if !url.trim().starts_with('/') || trimmed.is_empty() {
        return Err(ConfigError::InvalidStaticUrl(url.to_owned()));
    }
    Ok(trimmed.to_owned())
}

/// The status route is registered next to the static mount and must be a literal axum path.
fn check_status_path(path: &str, static_prefix: Option<&str>) -> Result<(), ConfigError> {
    let literal = path.starts_with('/')
        && !path.contains(['{', '}', '*'])
        && !path.split('/').any(|segment| segment.starts_with(':'));
    if !literal {
        return Err(ConfigError::InvalidStatusPath(path.to_owned()));
    }
    if let Some(prefix) = static_prefix {
        let nested = path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        if nested {
            return Err(ConfigError::StatusPathCollision {
                path: path.to_owned(),
                prefix: prefix.to_owned(),
            });
        }
    }
    Ok(())
}

/// The address the proxy connects to. A wildcard bind is reached through loopback.
fn upstream_address(bind: SocketAddr) -> SocketAddr {
    match bind.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bind.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bind.port())
        }
        _ => bind,
    }
}

fn resolve_worker_executable(configured: Option<PathBuf>) -> PathBuf {
    if let Some(path) = configured {
        return path;
    }
    let sibling = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("gantry-worker")))
        .filter(|path| path.is_file());
    sibling.unwrap_or_else(|| PathBuf::from("gantry-worker"))
}
