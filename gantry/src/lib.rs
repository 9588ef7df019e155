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
//! `gantry` is a container entrypoint. It runs the startup steps (database migrations, static
//! asset collection, administrative bootstrap), then serves a reverse proxy on the exposed port
//! in front of a supervised pool of application worker processes.

pub mod config;
pub mod net;
pub mod pool;
pub mod proxy;
pub mod sequencer;
pub mod worker;

use config::Config;
use miette::{Result, miette};
use pool::status::PoolStatus;
use tokio::sync::{oneshot, watch};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::info;

/// Runs the startup steps and, once all required steps succeeded, the reverse proxy and the
/// application pool until shutdown is requested. Nothing binds a port before the steps are done.
pub async fn run(subsys: SubsystemHandle, config: Config) -> Result<()> {
    let shutdown = subsys.create_cancellation_token();

    let report = sequencer::run_steps(&config.steps, &shutdown).await?;
    report.log_summary();

    let (status_tx, status_rx) = watch::channel(PoolStatus::new(config.pool.workers));
    let (bound_tx, bound_rx) = oneshot::channel();

    let proxy_config = config.proxy;
    subsys.start(SubsystemBuilder::new("proxy", move |s| {
        proxy::run_proxy(s, proxy_config, status_rx, bound_tx)
    }));

    let addr = bound_rx
        .await
        .map_err(|_| miette!("reverse proxy failed to start"))?;
    info!("Exposed port {} is open.", addr.port());

    let pool_config = config.pool;
    subsys.start(SubsystemBuilder::new("pool", move |s| {
        pool::run_pool(s, pool_config, status_tx)
    }));

    subsys.on_shutdown_requested().await;

    Ok(())
}
