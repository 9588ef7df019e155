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
//! A single application worker: accepts one connection at a time on the pool's shared address
//! and beats its heartbeat whenever it is idle.

mod cgi;

pub use cgi::{CgiApplication, CgiError, CgiResult, meta_variables, parse_response};

use crate::{config::load_config_file, net::init_shared_socket};
use bytes::Bytes;
use clap::Parser;
use gantry_common::{
    ACCESS_LOG_TARGET, DEFAULT_MAX_BODY_SIZE, ENV_ACCESS_LOG, ENV_CONFIG_PATH, ENV_ERROR_LOG, ENV_HEARTBEAT_FILE,
    ENV_LOG_LEVEL, ENV_MAX_BODY_SIZE, ENV_TIMEOUT, ENV_WORKER_BIND, ENV_WORKER_ID,
    command::CommandDefinition,
    error::ConfigError,
    heartbeat::{Heartbeat, beat_interval},
    logging::{self, LogSink, LoggingConfig},
};
use http_body_util::Full;
use hyper::{
    Method, Request, Response, Uri, body::Incoming, server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use miette::{Context, IntoDiagnostic, Result};
use std::{
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    process,
    time::{Duration, Instant},
};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{MissedTickBehavior, interval},
};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Application worker supervised by gantry", long_about = None)]
struct WorkerArgs {
    /// Index of this worker within the pool
    #[arg(long, env = ENV_WORKER_ID)]
    id: usize,
    /// Address shared by all workers of the pool
    #[arg(long, env = ENV_WORKER_BIND)]
    bind: SocketAddr,
    /// File to beat while idle
    #[arg(long, env = ENV_HEARTBEAT_FILE)]
    heartbeat_file: PathBuf,
    /// Per-request timeout in seconds
    #[arg(long, env = ENV_TIMEOUT, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,
    /// Largest request body in bytes passed to the application
    #[arg(long, env = ENV_MAX_BODY_SIZE, default_value_t = DEFAULT_MAX_BODY_SIZE)]
    max_body_size: usize,
    /// Path to the YAML file holding the application command
    #[arg(short, long, env = ENV_CONFIG_PATH, default_value = "./gantry.yaml")]
    config_path: PathBuf,
    /// Log verbosity (error, warn, info, debug, trace or off)
    #[arg(long, env = ENV_LOG_LEVEL, default_value = "info")]
    log_level: LevelFilter,
    /// Access log (stdout, stderr, off or a file path)
    #[arg(long, env = ENV_ACCESS_LOG, default_value = "stdout")]
    access_log: LogSink,
    /// Error log (stdout, stderr, off or a file path)
    #[arg(long, env = ENV_ERROR_LOG, default_value = "stderr")]
    error_log: LogSink,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: usize,
    pub bind: SocketAddr,
    pub heartbeat: Heartbeat,
    pub timeout: Duration,
    pub max_body_size: usize,
    pub application: CommandDefinition,
}

pub async fn instrument_and_load_worker_config() -> Result<WorkerConfig> {
    let args = WorkerArgs::parse();

    logging::init(&LoggingConfig {
        service_name: "gantry-worker",
        instance_name: format!("gantry-worker-{}", args.id),
        level: args.log_level,
        error_log: args.error_log.clone(),
        access_log: args.access_log.clone(),
    })
    .await?;

    let config_file = load_config_file(&args.config_path).await?;
    let application = config_file
        .application
        .ok_or_else(|| ConfigError::MissingApplication(args.config_path.clone()))?;

    Ok(WorkerConfig {
        id: args.id,
        bind: args.bind,
        heartbeat: Heartbeat::new(args.heartbeat_file),
        timeout: Duration::from_secs(args.timeout),
        max_body_size: args.max_body_size,
        application,
    })
}

pub async fn run_worker(subsys: SubsystemHandle, config: WorkerConfig) -> Result<()> {
    let listener = TcpListener::from_std(init_shared_socket(config.bind)?).into_diagnostic()?;
    let app = CgiApplication::new(
        config.application.clone(),
        config.bind,
        config.max_body_size,
    );

    let mut beat = interval(beat_interval(config.timeout));
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Worker {} (pid {}) listening on {}, running {} per request.",
        config.id,
        process::id(),
        config.bind,
        config.application
    );

    loop {
        select! {
            _ = beat.tick() => beat_heartbeat(&config.heartbeat).await?,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    // staleness is measured from the start of the request
                    beat_heartbeat(&config.heartbeat).await?;
                    select! {
                        _ = serve_connection(stream, remote, &app) => (),
                        _ = subsys.on_shutdown_requested() => break,
                    }
                    beat_heartbeat(&config.heartbeat).await?;
                    beat.reset();
                },
                Err(e) => warn!("Could not accept connection: {e}"),
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    info!("Worker {} stopped.", config.id);

    Ok(())
}

async fn beat_heartbeat(heartbeat: &Heartbeat) -> Result<()> {
    heartbeat
        .beat()
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("could not write heartbeat file {:?}", heartbeat.path()))
}

async fn serve_connection(stream: TcpStream, remote: SocketAddr, app: &CgiApplication) {
    let service = service_fn(|request| {
        let app = app.clone();
        async move { Ok::<_, Infallible>(handle(&app, request, remote).await) }
    });

    // The request runs to completion even if the proxy hangs up, so a hung request stalls the
    // heartbeat.
    if let Err(e) = http1::Builder::new()
        .keep_alive(false)
        .half_close(true)
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("Connection from {remote} ended with error: {e}");
    }
}

async fn handle(
    app: &CgiApplication,
    request: Request<Incoming>,
    remote: SocketAddr,
) -> Response<Full<Bytes>> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let version = request.version();
    let started = Instant::now();

    let response = match app.call(request, remote).await {
        Ok(response) => response,
        Err(e) => error_response(&method, &uri, &e),
    };

    info!(
        target: ACCESS_LOG_TARGET,
        "{remote} \"{method} {uri} {version:?}\" {} {}ms",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );

    response
}

fn error_response(method: &Method, uri: &Uri, e: &CgiError) -> Response<Full<Bytes>> {
    let status = e.status();
    if status.is_server_error() {
        error!("Error handling {method} {uri}: {e}");
    } else {
        warn!("Rejected {method} {uri}: {e}");
    }
    let mut response = Response::new(Full::new(Bytes::from(status.to_string())));
    *response.status_mut() = status;
    response
}
