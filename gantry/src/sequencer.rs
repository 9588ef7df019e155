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
use gantry_common::command::CommandDefinition;
use miette::Diagnostic;
use serde::Deserialize;
use std::{
    io,
    process::ExitStatus,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{process::Command, select};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// One command run once at container entry, before any service starts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupStep {
    pub name: String,
    #[serde(flatten)]
    pub command: CommandDefinition,
    /// A failing required step aborts startup. Other steps fail soft.
    #[serde(default = "required_by_default")]
    pub required: bool,
    /// Whether running the step again against already initialized state is a no-op.
    #[serde(default)]
    pub idempotent: bool,
}

fn required_by_default() -> bool {
    true
}

impl StartupStep {
    pub fn new(name: impl Into<String>, command: CommandDefinition) -> Self {
        Self {
            name: name.into(),
            command,
            required: true,
            idempotent: false,
        }
    }

    pub fn fail_soft(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum StartupError {
    #[error("required startup step '{step}' failed: {status}")]
    #[diagnostic(help("no service has been started; fix the step and restart the container"))]
    StepFailed { step: String, status: ExitStatus },
    #[error("required startup step '{step}' could not be started: {source}")]
    #[diagnostic(help("no service has been started; check the step's command"))]
    Spawn {
        step: String,
        #[source]
        source: io::Error,
    },
    #[error("error waiting for startup step '{step}': {source}")]
    Wait {
        step: String,
        #[source]
        source: io::Error,
    },
    #[error("startup was interrupted during step '{step}'")]
    Interrupted { step: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    FailedSoft(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub name: String,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub steps: Vec<StepReport>,
}

impl StartupReport {
    pub fn soft_failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::FailedSoft(_)))
            .count()
    }

    pub fn log_summary(&self) {
        for step in &self.steps {
            match &step.outcome {
                StepOutcome::Succeeded => {
                    info!("  {:<24} ok      ({:?})", step.name, step.elapsed)
                }
                StepOutcome::FailedSoft(e) => {
                    warn!("  {:<24} failed  ({:?}): {e}", step.name, step.elapsed)
                }
            }
        }
        info!(
            "Startup complete: {} step(s) run, {} failed soft.",
            self.steps.len(),
            self.soft_failures()
        );
    }
}

/// Runs the steps one after the other.
///
/// The first failing required step ends the sequence with an error, later steps do not run. A
/// cancelled `shutdown` token kills the running step and ends the sequence as interrupted.
pub async fn run_steps(
    steps: &[StartupStep],
    shutdown: &CancellationToken,
) -> Result<StartupReport, StartupError> {
    let mut report = StartupReport::default();

    for step in steps {
        info!("Running startup step '{}': {} …", step.name, step.command);
        let started = Instant::now();

        let outcome = match run_step(step, shutdown).await {
            Ok(()) => {
                info!("Startup step '{}' completed.", step.name);
                StepOutcome::Succeeded
            }
            Err(e @ StartupError::Interrupted { .. }) => {
                warn!("{e}");
                return Err(e);
            }
            Err(e) if step.required => {
                error!("{e}");
                return Err(e);
            }
            Err(e) => {
                warn!("Startup step '{}' failed, continuing: {e}", step.name);
                StepOutcome::FailedSoft(e.to_string())
            }
        };

        report.steps.push(StepReport {
            name: step.name.clone(),
            outcome,
            elapsed: started.elapsed(),
        });
    }

    Ok(report)
}

#[instrument(skip_all, fields(step = %step.name, required = step.required), err)]
async fn run_step(step: &StartupStep, shutdown: &CancellationToken) -> Result<(), StartupError> {
    if shutdown.is_cancelled() {
        return Err(StartupError::Interrupted {
            step: step.name.clone(),
        });
    }

    let mut child = Command::from(&step.command)
        .spawn()
        .map_err(|source| StartupError::Spawn {
            step: step.name.clone(),
            source,
        })?;

    select! {
        status = child.wait() => {
            let status = status.map_err(|source| StartupError::Wait {
                step: step.name.clone(),
                source,
            })?;
            if status.success() {
                Ok(())
            } else {
                Err(StartupError::StepFailed {
                    step: step.name.clone(),
                    status,
                })
            }
        },
        _ = shutdown.cancelled() => {
            child.kill().await.ok();
            Err(StartupError::Interrupted {
                step: step.name.clone(),
            })
        },
    }
}
