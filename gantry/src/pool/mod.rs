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
//! The application server pool: a fixed number of worker processes sharing one internal address.

mod slot;
pub mod status;

use gantry_common::{
    ENV_ACCESS_LOG, ENV_CONFIG_PATH, ENV_ERROR_LOG, ENV_HEARTBEAT_FILE, ENV_LOG_LEVEL,
    ENV_MAX_BODY_SIZE, ENV_TIMEOUT, ENV_WORKER_BIND, ENV_WORKER_ID, command::CommandDefinition,
    heartbeat::Heartbeat, logging::LogSink,
};
use miette::{Context, IntoDiagnostic, Result};
use slot::WorkerSlot;
use status::{PoolState, PoolStatus, SlotEvent};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tokio::{
    fs, select,
    sync::{mpsc, watch},
};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{debug, error, info, instrument, level_filters::LevelFilter};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub bind: SocketAddr,
    pub workers: usize,
    pub timeout: Duration,
    pub graceful_timeout: Duration,
    pub max_body_size: usize,
    pub log_level: LevelFilter,
    pub access_log: LogSink,
    pub error_log: LogSink,
    pub worker_executable: PathBuf,
    pub config_path: PathBuf,
    pub heartbeat_dir: PathBuf,
}

impl PoolConfig {
    fn heartbeat(&self, id: usize) -> Heartbeat {
        Heartbeat::new(self.heartbeat_dir.join(format!("worker-{id}")))
    }

    fn worker_command(&self, id: usize, heartbeat: &Heartbeat) -> CommandDefinition {
        CommandDefinition::new(self.worker_executable.to_string_lossy(), vec![])
            .with_env(ENV_WORKER_ID, id.to_string())
            .with_env(ENV_WORKER_BIND, self.bind.to_string())
            .with_env(
                ENV_HEARTBEAT_FILE,
                heartbeat.path().to_string_lossy().into_owned(),
            )
            .with_env(ENV_TIMEOUT, self.timeout.as_secs().to_string())
            .with_env(ENV_MAX_BODY_SIZE, self.max_body_size.to_string())
            .with_env(ENV_LOG_LEVEL, self.log_level.to_string())
            .with_env(ENV_ACCESS_LOG, self.access_log.to_string())
            .with_env(ENV_ERROR_LOG, self.error_log.to_string())
            .with_env(
                ENV_CONFIG_PATH,
                self.config_path.to_string_lossy().into_owned(),
            )
    }
}

/// Runs the pool until shutdown is requested and publishes its state through `status`.
#[instrument(skip_all, fields(workers = config.workers, bind = %config.bind), err)]
pub async fn run_pool(
    subsys: SubsystemHandle,
    config: PoolConfig,
    status: watch::Sender<PoolStatus>,
) -> Result<()> {
    fs::create_dir_all(&config.heartbeat_dir)
        .await
        .into_diagnostic()
        .wrap_err_with(|| {
            format!(
                "could not create heartbeat directory {:?}",
                config.heartbeat_dir
            )
        })?;

    info!(
        "Starting application pool with {} worker(s) on {} (timeout {:?}) …",
        config.workers, config.bind, config.timeout
    );
    status.send_modify(PoolStatus::starting);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let slots: Vec<_> = (0..config.workers)
        .map(|id| {
            let heartbeat = config.heartbeat(id);
            WorkerSlot::new(
                id,
                config.worker_command(id, &heartbeat),
                heartbeat,
                config.timeout,
                config.graceful_timeout,
                events_tx.clone(),
            )
            .start(&subsys)
        })
        .collect();
    drop(events_tx);

    loop {
        select! {
            recv = events_rx.recv() => if let Some(event) = recv {
                update(&status, &event);
            } else {
                break;
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    info!("Stopping application pool …");
    status.send_modify(PoolStatus::stopping);

    for slot in &slots {
        slot.initiate_shutdown();
    }
    for slot in slots {
        if let Err(e) = slot.join().await {
            error!("Error waiting for worker slot to stop: {e}");
        }
    }
    while let Ok(event) = events_rx.try_recv() {
        update(&status, &event);
    }

    status.send_modify(PoolStatus::stopped);
    if let Err(e) = fs::remove_dir_all(&config.heartbeat_dir).await {
        debug!("Could not remove heartbeat directory: {e}");
    }
    info!("Application pool stopped.");

    Ok(())
}

fn update(status: &watch::Sender<PoolStatus>, event: &SlotEvent) {
    let mut previous = None;
    status.send_modify(|s| {
        previous = Some(s.state);
        s.apply(event);
    });
    let current = status.borrow();
    if previous != Some(current.state) {
        match current.state {
            PoolState::Running => info!(
                "Application pool running with {}/{} worker(s).",
                current.running, current.configured
            ),
            state => debug!("Application pool state: {state:?}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(dir: &std::path::Path) -> PoolConfig {
        PoolConfig {
            bind: "127.0.0.1:8000".parse().expect("invalid address"),
            workers: 2,
            timeout: Duration::from_secs(30),
            graceful_timeout: Duration::from_secs(5),
            max_body_size: 1024,
            log_level: LevelFilter::DEBUG,
            access_log: LogSink::Stdout,
            error_log: LogSink::File(dir.join("error.log")),
            worker_executable: PathBuf::from("/usr/local/bin/gantry-worker"),
            config_path: dir.join("gantry.yaml"),
            heartbeat_dir: dir.join("heartbeats"),
        }
    }

    #[test]
    fn workers_receive_their_settings_through_the_environment() {
        let dir = tempfile::tempdir().expect("could not create temp dir");
        let config = config(dir.path());
        let heartbeat = config.heartbeat(1);
        let command = config.worker_command(1, &heartbeat);

        assert_eq!(command.command(), "/usr/local/bin/gantry-worker");
        assert_eq!(heartbeat.path(), dir.path().join("heartbeats").join("worker-1"));

        let env = command.env();
        for (key, value) in [
            (ENV_WORKER_ID, "1"),
            (ENV_WORKER_BIND, "127.0.0.1:8000"),
            (ENV_TIMEOUT, "30"),
            (ENV_MAX_BODY_SIZE, "1024"),
            (ENV_LOG_LEVEL, "debug"),
            (ENV_ACCESS_LOG, "stdout"),
        ] {
            assert_eq!(env.get(key).map(String::as_str), Some(value), "{key}");
        }
        assert_eq!(
            env.get(ENV_ERROR_LOG).map(PathBuf::from),
            Some(dir.path().join("error.log"))
        );
    }
}
