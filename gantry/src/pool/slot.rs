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
use super::status::SlotEvent;
use gantry_common::{
    command::CommandDefinition,
    heartbeat::{Heartbeat, beat_interval, is_stale, now_millis},
};
use miette::{Context, IntoDiagnostic, Result, miette};
use std::{error::Error, time::Duration};
use tokio::{
    process::{Child, Command},
    select,
    sync::mpsc,
    time::{MissedTickBehavior, interval, sleep, timeout},
};
use tokio_graceful_shutdown::{NestedSubsystem, SubsystemBuilder, SubsystemHandle};
use tokio_process_terminate::TerminateExt;
use tracing::{Level, error, info, instrument, warn};

/// Consecutive crashes after which a slot gives up and shuts the container down.
const MAX_CRASHES: usize = 10;

struct WorkerProcess {
    child: Child,
    pid: u32,
    spawned_at: u64,
    ready: bool,
}

/// Keeps one worker process alive.
///
/// A worker that exits on its own is restarted after a back-off that grows with the number of
/// recent crashes. A worker whose heartbeat is older than the request timeout is terminated and
/// replaced right away.
pub struct WorkerSlot {
    id: usize,
    command: CommandDefinition,
    heartbeat: Heartbeat,
    timeout: Duration,
    graceful_timeout: Duration,
    events: mpsc::UnboundedSender<SlotEvent>,
    process: Option<WorkerProcess>,
    stopped: bool,
}

impl WorkerSlot {
    pub fn new(
        id: usize,
        command: CommandDefinition,
        heartbeat: Heartbeat,
        timeout: Duration,
        graceful_timeout: Duration,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Self {
        Self {
            id,
            command,
            heartbeat,
            timeout,
            graceful_timeout,
            events,
            process: None,
            stopped: false,
        }
    }

    pub fn start(
        self,
        subsys: &SubsystemHandle,
    ) -> NestedSubsystem<Box<dyn Error + Send + Sync + 'static>> {
        let name = format!("worker-{}", self.id);
        subsys.start(SubsystemBuilder::new(name.as_str(), move |s| self.run(s)))
    }

    async fn run(mut self, subsys: SubsystemHandle) -> Result<()> {
        let mut crash_counter = 0;
        let mut decay = interval(Duration::from_secs(10));
        let mut check = interval(beat_interval(self.timeout));
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut wait = None;

        while !self.stopped {
            if let Some(mut proc) = self.process.take() {
                select! {
                    exit_status = proc.child.wait() => {
                        let exit_status = exit_status
                            .into_diagnostic()
                            .wrap_err_with(|| format!("could not get exit status of worker {}", self.id))?;
                        match exit_status.code() {
                            Some(exit_code) => warn!("Worker {} (pid {}) exited with code {exit_code}.", self.id, proc.pid),
                            None => warn!("Worker {} (pid {}) was killed by a signal.", self.id, proc.pid),
                        }
                        self.emit(SlotEvent::Crashed { id: self.id });
                        crash_counter += 1;
                        if crash_counter >= MAX_CRASHES {
                            error!("Worker {} crashed {crash_counter} times in a row, giving up …", self.id);
                            subsys.request_shutdown();
                            return Err(miette!("worker {} keeps crashing", self.id));
                        }
                        let millis = delay(crash_counter);
                        info!("Restarting worker {} in {millis} ms …", self.id);
                        wait = Some(millis);
                    },
                    _ = check.tick() => self.check(proc).await?,
                    _ = decay.tick() => {
                        self.process = Some(proc);
                        crash_counter = crash_counter.saturating_sub(1);
                    },
                    _ = subsys.on_shutdown_requested() => {
                        self.process = Some(proc);
                        self.stop().await?;
                    },
                }
            } else if subsys.is_shutdown_requested() {
                self.stopped = true;
            } else if let Err(e) = self.spawn().await {
                subsys.request_shutdown();
                return Err(e);
            }

            if let Some(millis) = wait.take() {
                select! {
                    _ = sleep(Duration::from_millis(millis)) => (),
                    _ = subsys.on_shutdown_requested() => self.stop().await?,
                }
            }
        }

        self.heartbeat.clear().await.ok();
        self.emit(SlotEvent::Stopped { id: self.id });
        info!("Worker slot {} stopped.", self.id);

        Ok(())
    }

    #[instrument(skip(self), fields(id = self.id), err)]
    async fn spawn(&mut self) -> Result<()> {
        self.heartbeat
            .clear()
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("could not reset heartbeat of worker {}", self.id))?;

        info!("(Re-)starting worker {}: {} …", self.id, self.command);
        let spawned_at = now_millis();
        let mut command = Command::from(&self.command);
        let child = command
            .spawn()
            .into_diagnostic()
            .wrap_err_with(|| format!("could not start worker process {}", self.command))?;
        let pid = child.id().unwrap_or_default();

        self.process = Some(WorkerProcess {
            child,
            pid,
            spawned_at,
            ready: false,
        });
        self.emit(SlotEvent::Spawned { id: self.id, pid });

        Ok(())
    }

    #[instrument(level = Level::TRACE, skip(self, proc), fields(id = self.id, pid = proc.pid), err)]
    async fn check(&mut self, mut proc: WorkerProcess) -> Result<()> {
        let last_beat = match self.heartbeat.last_beat().await {
            Ok(last_beat) => last_beat,
            Err(e) => {
                warn!("Could not read heartbeat of worker {}: {e}", self.id);
                self.process = Some(proc);
                return Ok(());
            }
        };

        if !proc.ready && last_beat.is_some_and(|beat| beat >= proc.spawned_at) {
            proc.ready = true;
            info!(
                "Worker {} (pid {}) is accepting requests.",
                self.id, proc.pid
            );
            self.emit(SlotEvent::Ready { id: self.id });
        }

        if is_stale(proc.spawned_at, last_beat, now_millis(), self.timeout) {
            warn!(
                "Worker {} (pid {}) has been busy for more than {:?}, recycling it …",
                self.id, proc.pid, self.timeout
            );
            self.emit(SlotEvent::Recycling { id: self.id });
            terminate(&mut proc.child, self.id, self.graceful_timeout).await?;
        } else {
            self.process = Some(proc);
        }

        Ok(())
    }

    #[instrument(skip(self), fields(id = self.id), err)]
    async fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        if let Some(mut proc) = self.process.take() {
            terminate(&mut proc.child, self.id, self.graceful_timeout).await?;
        }
        Ok(())
    }

    fn emit(&self, event: SlotEvent) {
        self.events.send(event).ok();
    }
}

/// Sends SIGTERM and waits for the worker to exit. Kills it if it is still alive after `grace`.
#[instrument(skip(child), err)]
async fn terminate(child: &mut Child, id: usize, grace: Duration) -> Result<()> {
    info!("Terminating worker {id} …");
    match timeout(grace, child.terminate_wait()).await {
        Ok(exit_status) => match exit_status
            .into_diagnostic()
            .wrap_err_with(|| format!("error waiting for worker {id} to stop"))?
            .code()
        {
            Some(exit_code) => info!("Worker {id} terminated with exit code {exit_code}."),
            None => info!("Worker {id} terminated by signal."),
        },
        Err(_) => {
            warn!("Worker {id} did not stop within {grace:?}, killing it.");
            child
                .kill()
                .await
                .into_diagnostic()
                .wrap_err_with(|| format!("could not kill worker {id}"))?;
        }
    }
    Ok(())
}

fn delay(crash_counter: usize) -> u64 {
    (((crash_counter as f32).ln() * 500.0 + 1.0).round()) as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::oneshot;
    use tokio_graceful_shutdown::Toplevel;

    fn slot(
        command: CommandDefinition,
        dir: &std::path::Path,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> WorkerSlot {
        WorkerSlot::new(
            0,
            command,
            Heartbeat::new(dir.join("worker-0")),
            Duration::from_secs(1),
            Duration::from_secs(1),
            events,
        )
    }

    #[test]
    fn restart_delay_grows_with_crashes() {
        assert_eq!(delay(1), 1);
        assert!(delay(2) < delay(5));
        assert!(delay(9) < 2_000);
    }

    #[tokio::test]
    async fn silent_worker_is_recycled_and_replaced() {
        let dir = tempfile::tempdir().expect("could not create temp dir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = slot(
            CommandDefinition::new("sleep", vec!["30".into()]),
            dir.path(),
            tx,
        );
        let (done_tx, done_rx) = oneshot::channel();

        Toplevel::new(|s: SubsystemHandle| async move {
            slot.start(&s);
            s.start(SubsystemBuilder::new(
                "observer",
                move |s: SubsystemHandle| async move {
                    let mut events = Vec::new();
                    while let Ok(Some(event)) = timeout(Duration::from_secs(10), rx.recv()).await {
                        let replaced = matches!(event, SlotEvent::Spawned { .. })
                            && events
                                .iter()
                                .any(|e| matches!(e, SlotEvent::Recycling { .. }));
                        events.push(event);
                        if replaced {
                            break;
                        }
                    }
                    done_tx.send(events).ok();
                    s.request_shutdown();
                    Ok::<(), miette::Report>(())
                },
            ));
        })
        .handle_shutdown_requests(Duration::from_secs(5))
        .await
        .expect("shutdown failed");

        let events = done_rx.await.expect("observer did not report");
        assert_eq!(events.len(), 3, "unexpected events: {events:?}");
        assert!(matches!(events[0], SlotEvent::Spawned { id: 0, .. }));
        assert_eq!(events[1], SlotEvent::Recycling { id: 0 });
        assert!(matches!(events[2], SlotEvent::Spawned { id: 0, .. }));
    }

    #[tokio::test]
    async fn worker_that_keeps_crashing_shuts_everything_down() {
        let dir = tempfile::tempdir().expect("could not create temp dir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = slot(
            CommandDefinition::new("sh", vec!["-c".into(), "exit 1".into()]),
            dir.path(),
            tx,
        );

        let result = Toplevel::new(|s: SubsystemHandle| async move {
            slot.start(&s);
        })
        .handle_shutdown_requests(Duration::from_secs(5))
        .await;

        assert!(result.is_err());
        let mut crashes = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SlotEvent::Crashed { .. }) {
                crashes += 1;
            }
        }
        assert!(crashes >= MAX_CRASHES, "only {crashes} crashes reported");
    }
}
