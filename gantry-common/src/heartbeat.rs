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
use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::fs;

/// Liveness file shared between a worker and its supervisor.
///
/// While idle a worker rewrites the file every [`beat_interval`] with the current time in
/// milliseconds since the Unix epoch. It does not beat while a request is in flight, so a beat
/// older than the request timeout means the worker is stuck. The file is replaced by renaming a
/// temporary sibling, readers never see a partially written value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    path: PathBuf,
}

impl Heartbeat {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn beat(&self) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, now_millis().to_string()).await?;
        fs::rename(&tmp, &self.path).await
    }

    /// Time of the last beat, `None` if the worker has not beaten yet.
    pub async fn last_beat(&self) -> io::Result<Option<u64>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// How often workers beat and supervisors check, derived from the request timeout.
pub fn beat_interval(timeout: Duration) -> Duration {
    (timeout / 4).max(Duration::from_millis(50))
}

/// Whether a worker that was spawned at `spawned_at` and last beat at `last_beat` has been busy
/// for longer than `timeout` at `now`. Beats older than the spawn time belong to a previous
/// process and are ignored.
pub fn is_stale(spawned_at: u64, last_beat: Option<u64>, now: u64, timeout: Duration) -> bool {
    let reference = last_beat
        .filter(|beat| *beat >= spawned_at)
        .unwrap_or(spawned_at);
    now.saturating_sub(reference) > timeout.as_millis() as u64
}
