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
    ACCESS_LOG_TARGET,
    error::{ConfigError, ConfigResult, TelemetryResult},
};
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_resource_detectors::{
    HostResourceDetector, OsResourceDetector, ProcessResourceDetector,
};
use opentelemetry_sdk::{Resource, propagation::TraceContextPropagator, trace::SdkTracerProvider};
use std::{
    env, fmt,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use supports_color::Stream;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::filter_fn,
    fmt::{self as tracing_fmt, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Where a stream of log lines goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    Stderr,
    Off,
    File(PathBuf),
}

impl FromStr for LogSink {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.trim() {
            "" => Err(ConfigError::InvalidLogSink(s.to_owned())),
            "stdout" | "-" => Ok(LogSink::Stdout),
            "stderr" => Ok(LogSink::Stderr),
            "off" | "none" => Ok(LogSink::Off),
            path => Ok(LogSink::File(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSink::Stdout => f.write_str("stdout"),
            LogSink::Stderr => f.write_str("stderr"),
            LogSink::Off => f.write_str("off"),
            LogSink::File(path) => write!(f, "{}", path.display()),
        }
    }
}

impl LogSink {
    /// Opens the sink. Returns `None` for [`LogSink::Off`], otherwise the writer and whether it
    /// is a terminal that understands ANSI colors.
    fn open(&self) -> ConfigResult<Option<(BoxMakeWriter, bool)>> {
        Ok(match self {
            LogSink::Stdout => Some((
                BoxMakeWriter::new(io::stdout),
                supports_color::on(Stream::Stdout).is_some(),
            )),
            LogSink::Stderr => Some((
                BoxMakeWriter::new(io::stderr),
                supports_color::on(Stream::Stderr).is_some(),
            )),
            LogSink::Off => None,
            LogSink::File(path) => {
                let file = open_log_file(path)?;
                Some((BoxMakeWriter::new(Arc::new(file)), false))
            }
        })
    }
}

fn open_log_file(path: &Path) -> ConfigResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ConfigError::LogFile {
            path: path.to_owned(),
            source,
        })
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub service_name: &'static str,
    pub instance_name: String,
    pub level: LevelFilter,
    pub error_log: LogSink,
    pub access_log: LogSink,
}

/// Installs the global tracing subscriber.
///
/// General events go to the error log sink, filtered by the configured level unless `GANTRY_LOG`
/// holds filter directives. Events with the [`ACCESS_LOG_TARGET`] target go to the access log
/// sink only. Spans are exported via OTLP if `GANTRY_OPENTELEMETRY_ENDPOINT` is set.
pub async fn init(config: &LoggingConfig) -> TelemetryResult<()> {
    let general = config.error_log.open()?.map(|(writer, ansi)| {
        tracing_fmt::Layer::new()
            .with_ansi(ansi)
            .with_writer(writer)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(config.level.into())
                    .with_env_var("GANTRY_LOG")
                    .from_env_lossy(),
            )
            .with_filter(filter_fn(|meta| meta.target() != ACCESS_LOG_TARGET))
    });

    let access = config.access_log.open()?.map(|(writer, ansi)| {
        tracing_fmt::Layer::new()
            .with_ansi(ansi)
            .with_target(false)
            .with_level(false)
            .with_writer(writer)
            .with_filter(filter_fn(|meta| meta.target() == ACCESS_LOG_TARGET))
    });

    let subscriber = tracing_subscriber::registry().with(general).with(access);

    let endpoint = env::var("GANTRY_OPENTELEMETRY_ENDPOINT").ok();

    if let Some(endpoint) = endpoint {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;

        let resource = Resource::builder()
            .with_service_name(config.service_name)
            .with_detectors(&[
                Box::new(HostResourceDetector::default()),
                Box::new(OsResourceDetector),
                Box::new(ProcessResourceDetector),
            ])
            .with_attributes(vec![KeyValue::new(
                "instance.name",
                config.instance_name.clone(),
            )])
            .build();

        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();

        let tracer = tracer_provider.tracer(config.instance_name.clone());

        global::set_tracer_provider(tracer_provider);

        let opentelemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var("GANTRY_TRACING")
                    .from_env_lossy(),
            );

        subscriber.with(opentelemetry).try_init()?;
        info!("Telemetry enabled.");
    } else {
        subscriber.try_init()?;
        info!("Telemetry disabled.");
    }

    Ok(())
}
