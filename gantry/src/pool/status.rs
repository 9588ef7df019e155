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
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolState {
    Stopped,
    Starting,
    Running,
    WorkerRecycling,
    Stopping,
}

/// What a worker slot reports to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    Spawned { id: usize, pid: u32 },
    Ready { id: usize },
    Recycling { id: usize },
    Crashed { id: usize },
    Stopped { id: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub state: PoolState,
    pub configured: usize,
    pub running: usize,
    pub recycled: u64,
    pub crashed: u64,
    #[serde(skip)]
    ready: BTreeSet<usize>,
    #[serde(skip)]
    recycling: BTreeSet<usize>,
}

impl PoolStatus {
    pub fn new(configured: usize) -> Self {
        Self {
            state: PoolState::Stopped,
            configured,
            running: 0,
            recycled: 0,
            crashed: 0,
            ready: BTreeSet::new(),
            recycling: BTreeSet::new(),
        }
    }

    pub fn starting(&mut self) {
        self.state = PoolState::Starting;
    }

    pub fn stopping(&mut self) {
        self.state = PoolState::Stopping;
    }

    pub fn stopped(&mut self) {
        self.state = PoolState::Stopped;
        self.ready.clear();
        self.recycling.clear();
        self.running = 0;
    }

    pub fn apply(&mut self, event: &SlotEvent) {
        match event {
            SlotEvent::Spawned { .. } => (),
            SlotEvent::Ready { id } => {
                self.ready.insert(*id);
                self.recycling.remove(id);
            }
            SlotEvent::Recycling { id } => {
                self.ready.remove(id);
                self.recycling.insert(*id);
                self.recycled += 1;
            }
            SlotEvent::Crashed { id } => {
                self.ready.remove(id);
                self.crashed += 1;
            }
            SlotEvent::Stopped { id } => {
                self.ready.remove(id);
                self.recycling.remove(id);
            }
        }

        self.running = self.ready.len();

        self.state = match self.state {
            PoolState::Stopping | PoolState::Stopped => self.state,
            _ if !self.recycling.is_empty() => PoolState::WorkerRecycling,
            PoolState::Starting if self.running < self.configured => PoolState::Starting,
            _ => PoolState::Running,
        };
    }
}
