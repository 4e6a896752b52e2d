//! Step pipeline.
//!
//! Steps run strictly in declared order, one at a time, each at most once.
//! The first failure halts the pipeline and triggers the rollback engine; the
//! run then reports which step failed and why. A run that completes settles
//! the run state so that nothing (not even a late interrupt) can roll it back.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! Running(0) → StepDone(0) → Running(1) → ... → Running(n-1)
//!     ↓                                             ↓
//! Failed(i)                                     Completed
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cleanup::{self, CleanupReport};
use crate::config::Configuration;
use crate::error::{ProvisionError, Result};
use crate::run_state::RunState;
use crate::steps;
use crate::toolkit::Toolkit;

/// Everything a step may touch.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub config: &'a Configuration,
    pub state: &'a RunState,
    pub tools: &'a Toolkit,
}

/// A named, stateless unit of provisioning work.
pub trait Step: Send + Sync {
    /// Stable identifier (`create-database`)
    fn name(&self) -> &'static str;

    /// Human-readable heading for logs
    fn description(&self) -> &'static str;

    /// Perform the step. Effects must be recorded in the run state no later
    /// than they are performed.
    fn run(&self, ctx: &StepContext<'_>) -> Result<()>;
}

/// Progress of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    NotStarted,
    /// Step at this index is executing
    Running(usize),
    /// Step at this index succeeded; the next one has not started
    StepDone(usize),
    /// Every step succeeded (terminal)
    Completed,
    /// Step at this index failed (terminal)
    Failed(usize),
}

impl PipelineStage {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running(i) => write!(f, "running step {}", i + 1),
            Self::StepDone(i) => write!(f, "finished step {}", i + 1),
            Self::Completed => write!(f, "completed"),
            Self::Failed(i) => write!(f, "failed at step {}", i + 1),
        }
    }
}

/// Rejected tracker transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot start step {to} from {from} (steps run in order, once each)")]
    OutOfOrder { from: PipelineStage, to: usize },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: PipelineStage },

    #[error("Cannot {action} while {current}")]
    NotRunning {
        action: &'static str,
        current: PipelineStage,
    },
}

/// Validates that steps start in order and only once.
#[derive(Debug, Clone)]
pub struct PipelineTracker {
    current: PipelineStage,
    total: usize,
    /// (step index, duration) for every finished step
    history: Vec<(usize, Duration)>,
    started_at: Option<Instant>,
}

impl PipelineTracker {
    pub fn new(total: usize) -> Self {
        Self {
            current: PipelineStage::NotStarted,
            total,
            history: Vec::with_capacity(total),
            started_at: None,
        }
    }

    #[inline]
    pub fn current(&self) -> PipelineStage {
        self.current
    }

    pub fn history(&self) -> &[(usize, Duration)] {
        &self.history
    }

    /// Enter step `index`; it must be the next step in sequence.
    pub fn begin(&mut self, index: usize) -> std::result::Result<(), TransitionError> {
        let expected = match self.current {
            PipelineStage::NotStarted => 0,
            PipelineStage::StepDone(done) => done + 1,
            PipelineStage::Running(_) => {
                return Err(TransitionError::OutOfOrder {
                    from: self.current,
                    to: index,
                });
            }
            PipelineStage::Completed | PipelineStage::Failed(_) => {
                return Err(TransitionError::FromTerminalState { from: self.current });
            }
        };
        if index != expected || index >= self.total {
            return Err(TransitionError::OutOfOrder {
                from: self.current,
                to: index,
            });
        }
        self.current = PipelineStage::Running(index);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Mark the running step successful; completes the pipeline after the last.
    pub fn finish(&mut self) -> std::result::Result<Duration, TransitionError> {
        let PipelineStage::Running(index) = self.current else {
            return Err(TransitionError::NotRunning {
                action: "finish a step",
                current: self.current,
            });
        };
        let elapsed = self.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
        self.history.push((index, elapsed));
        self.current = if index + 1 == self.total {
            PipelineStage::Completed
        } else {
            PipelineStage::StepDone(index)
        };
        Ok(elapsed)
    }

    /// Mark the running step failed (terminal).
    pub fn fail(&mut self) -> std::result::Result<(), TransitionError> {
        let PipelineStage::Running(index) = self.current else {
            return Err(TransitionError::NotRunning {
                action: "fail a step",
                current: self.current,
            });
        };
        self.current = PipelineStage::Failed(index);
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        steps: usize,
        duration: Duration,
    },
    Failed {
        index: usize,
        step: &'static str,
        error: ProvisionError,
        /// `None` if the rollback had already been claimed elsewhere
        cleanup: Option<CleanupReport>,
    },
    Interrupted {
        step: Option<&'static str>,
        cleanup: Option<CleanupReport>,
    },
}

impl RunOutcome {
    /// 0 on success, 1 for any failure or interrupt
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { .. } => 0,
            Self::Failed { .. } | Self::Interrupted { .. } => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn cleanup(&self) -> Option<&CleanupReport> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { cleanup, .. } | Self::Interrupted { cleanup, .. } => cleanup.as_ref(),
        }
    }
}

/// Ordered list of steps.
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("steps", &self.names()).finish()
    }
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// The provisioning sequence, in declared order.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(steps::system::UpdateSystem),
            Box::new(steps::system::InstallNginx),
            Box::new(steps::database::InstallMysql),
            Box::new(steps::system::InstallPhp),
            Box::new(steps::database::CreateDatabase),
            Box::new(steps::content::DeployContent),
            Box::new(steps::web_server::ConfigureWebServer),
            Box::new(steps::tls::InstallTls),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, rolling back on the first failure.
    pub fn run(&self, config: &Configuration, state: &RunState, tools: &Toolkit) -> RunOutcome {
        let ctx = StepContext {
            config,
            state,
            tools,
        };
        let mut tracker = PipelineTracker::new(self.steps.len());
        let started = Instant::now();
        info!("Starting installation in {} mode", config.mode.banner());

        for (index, step) in self.steps.iter().enumerate() {
            if state.is_halted() {
                return Self::interrupted(Some(step.name()), config, state, tools);
            }
            if let Err(e) = tracker.begin(index) {
                error!("Pipeline state error: {}", e);
                return RunOutcome::Failed {
                    index,
                    step: step.name(),
                    error: ProvisionError::config(e.to_string()),
                    cleanup: cleanup::run_once(config, state, tools),
                };
            }
            info!("Step {}/{}: {}", index + 1, self.steps.len(), step.description());

            match step.run(&ctx) {
                Ok(()) => {
                    match tracker.finish() {
                        Ok(elapsed) => debug!(
                            step = step.name(),
                            duration_sec = format!("{:.2}", elapsed.as_secs_f64()),
                            "step completed"
                        ),
                        Err(e) => error!("Pipeline state error: {}", e),
                    }
                }
                Err(e) => {
                    if let Err(state_error) = tracker.fail() {
                        error!("Pipeline state error: {}", state_error);
                    }
                    if e.is_interrupted() || state.is_halted() {
                        return Self::interrupted(Some(step.name()), config, state, tools);
                    }
                    error!(
                        step = step.name(),
                        duration_sec = format!("{:.2}", started.elapsed().as_secs_f64()),
                        "Installation failed: {}",
                        e
                    );
                    let cleanup = cleanup::run_once(config, state, tools);
                    return RunOutcome::Failed {
                        index,
                        step: step.name(),
                        error: e,
                        cleanup,
                    };
                }
            }
        }

        if !state.settle() {
            return Self::interrupted(None, config, state, tools);
        }
        cleanup::remove_scratch(state, tools);
        let duration = started.elapsed();
        info!(
            total_duration_sec = format!("{:.2}", duration.as_secs_f64()),
            "All installation steps completed"
        );
        RunOutcome::Completed {
            steps: tracker.history().len(),
            duration,
        }
    }

    fn interrupted(
        step: Option<&'static str>,
        config: &Configuration,
        state: &RunState,
        tools: &Toolkit,
    ) -> RunOutcome {
        warn!("Run interrupted{}", step.map(|s| format!(" during {s}")).unwrap_or_default());
        RunOutcome::Interrupted {
            step,
            cleanup: cleanup::run_once(config, state, tools),
        }
    }
}
