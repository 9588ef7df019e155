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

//! Pieces shared by the `gantry` entrypoint and the `gantry-worker` processes it supervises.
//!
//! The worker contract lives here: the environment variables a supervisor hands to each worker
//! and the heartbeat file format workers use to prove they are not stuck in a request.

pub mod command;
pub mod error;
pub mod heartbeat;
pub mod logging;

/// Tracing target of access log events. The logging setup routes these to the access log sink.
pub const ACCESS_LOG_TARGET: &str = "gantry::access";

/// Largest request body handed to the application, 10 MiB.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

pub const ENV_CONFIG_PATH: &str = "GANTRY_CONFIG_PATH";
pub const ENV_WORKER_ID: &str = "GANTRY_WORKER_ID";
pub const ENV_WORKER_BIND: &str = "GANTRY_WORKER_BIND";
pub const ENV_HEARTBEAT_FILE: &str = "GANTRY_HEARTBEAT_FILE";
pub const ENV_TIMEOUT: &str = "GANTRY_TIMEOUT";
pub const ENV_MAX_BODY_SIZE: &str = "GANTRY_MAX_BODY_SIZE";
pub const ENV_LOG_LEVEL: &str = "GANTRY_LOG_LEVEL";
pub const ENV_ACCESS_LOG: &str = "GANTRY_ACCESS_LOG";
pub const ENV_ERROR_LOG: &str = "GANTRY_ERROR_LOG";
