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
use gantry::{config::instrument_and_load_config, run};
use miette::Result;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();
    dotenvy::dotenv().ok();

    let config = instrument_and_load_config().await?;
    // proxy drain and worker termination run concurrently, each bounded by the graceful timeout
    let shutdown_timeout = config.graceful_timeout * 2 + Duration::from_secs(1);

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("gantry", move |s| run(s, config)));
    })
    .catch_signals()
    .handle_shutdown_requests(shutdown_timeout)
    .await?;

    Ok(())
}
