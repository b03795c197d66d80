//! Sequential macro execution.
//!
//! A run walks a borrowed step slice in order. For each step the reference is
//! resolved, the parameters validated and the action executed; the first
//! failure ends the run. Cancellation is checked before every step.

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::RunSettings;
use crate::environment::Environment;
use crate::error::{ErrorKind, StepError, StepResult};
use crate::executor::{ActionExecutor, ExecutionOutcome};
use crate::macros::{ActionKind, MacroStep};
use crate::reference::ReferenceResolver;

/// Cooperative stop signal shared between a run and whoever may cancel it
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Where and why a run stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// 0-based position of the failing step
    pub step_index: usize,
    pub action: ActionKind,
    pub error_kind: ErrorKind,
    pub message: String,
    /// Best matcher score seen, for match failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_confidence: Option<f64>,
    /// Time spent waiting, for timeouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waited_ms: Option<u64>,
}

impl FailureInfo {
    pub fn new(step_index: usize, action: ActionKind, error: &StepError) -> Self {
        Self {
            step_index,
            action,
            error_kind: error.kind(),
            message: error.to_string(),
            best_confidence: error.best_confidence(),
            waited_ms: error.waited().map(duration_ms),
        }
    }
}

/// Observable state of the runner
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub status: RunStatus,
    /// Step being executed; the failing step once `Failed`, the step count once `Completed`
    pub current_index: usize,
    pub failure: Option<FailureInfo>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            current_index: 0,
            failure: None,
        }
    }
}

/// Progress events emitted during a run
#[derive(Debug, Clone, PartialEq)]
pub enum RunProgress {
    Started { total: usize },
    StepStarted { index: usize, action: ActionKind },
    StepSucceeded { index: usize, action: ActionKind, elapsed: Duration },
    StepFailed { index: usize, action: ActionKind, kind: ErrorKind },
    Finished { status: RunStatus, elapsed: Duration },
}

/// Record of one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: ActionKind,
    pub success: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of a complete run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub total_elapsed_ms: u64,
    /// Executed steps, ending with the failing one if the run failed
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Process exit code: 0 on success, `10 + kind ordinal` on failure
    pub fn exit_code(&self) -> i32 {
        match &self.failure {
            None if self.is_success() => 0,
            None => ErrorKind::ExecutionError.exit_code(),
            Some(failure) => failure.error_kind.exit_code(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Runs macros against an environment
#[derive(Debug)]
pub struct MacroRunner {
    executor: ActionExecutor,
    resolver: ReferenceResolver,
    cancel: CancelToken,
    state: RunState,
}

impl MacroRunner {
    pub fn new(settings: RunSettings, resolver: ReferenceResolver) -> Self {
        Self {
            executor: ActionExecutor::new(settings),
            resolver,
            cancel: CancelToken::new(),
            state: RunState::default(),
        }
    }

    /// Share an existing cancel token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    /// Frame captured by the last executed step, if it captured one
    pub fn last_frame(&self) -> Option<&RgbImage> {
        self.executor.last_frame()
    }

    pub fn run(&mut self, steps: &[MacroStep], env: &mut Environment) -> RunReport {
        self.run_with_progress(steps, env, |_, _| {})
    }

    /// Run `steps` from the first, reporting progress to `on_progress`.
    ///
    /// A cancellation requested before or during the run ends this run; the
    /// token is cleared when the run finishes, so the next run starts fresh.
    pub fn run_with_progress<F>(
        &mut self,
        steps: &[MacroStep],
        env: &mut Environment,
        mut on_progress: F,
    ) -> RunReport
    where
        F: FnMut(&RunProgress, &RunState),
    {
        let started_at = Utc::now();
        let started = Instant::now();
        self.state = RunState {
            status: RunStatus::Running,
            current_index: 0,
            failure: None,
        };
        self.executor.reset();

        if let Some(title) = self.executor.settings().focus_window.clone() {
            if !env.focus.focus(&title) {
                warn!(window = %title, "could not focus target window; continuing");
            }
        }

        info!(steps = steps.len(), "run started");
        on_progress(&RunProgress::Started { total: steps.len() }, &self.state);

        let mut records = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            self.state.current_index = index;

            let step_start = Instant::now();
            let result = if self.cancel.is_cancelled() {
                Err(StepError::Cancelled)
            } else {
                on_progress(
                    &RunProgress::StepStarted {
                        index,
                        action: step.action,
                    },
                    &self.state,
                );
                self.run_step(index, step, env)
            };
            let elapsed = step_start.elapsed();

            match result {
                Ok(outcome) => {
                    debug!(step = index, action = %step.action, elapsed_ms = duration_ms(elapsed), "step succeeded");
                    records.push(StepRecord {
                        index,
                        action: step.action,
                        success: true,
                        elapsed_ms: duration_ms(elapsed),
                        detail: outcome.detail(),
                    });
                    on_progress(
                        &RunProgress::StepSucceeded {
                            index,
                            action: step.action,
                            elapsed,
                        },
                        &self.state,
                    );
                }
                Err(error) => {
                    let failure = FailureInfo::new(index, step.action, &error);
                    warn!(step = index, action = %step.action, kind = %failure.error_kind, "{}", failure.message);
                    records.push(StepRecord {
                        index,
                        action: step.action,
                        success: false,
                        elapsed_ms: duration_ms(elapsed),
                        detail: Some(failure.message.clone()),
                    });
                    self.state.status = RunStatus::Failed;
                    self.state.failure = Some(failure);
                    on_progress(
                        &RunProgress::StepFailed {
                            index,
                            action: step.action,
                            kind: error.kind(),
                        },
                        &self.state,
                    );
                    break;
                }
            }
        }

        if self.state.status == RunStatus::Running {
            self.state.status = RunStatus::Completed;
            self.state.current_index = steps.len();
        }

        self.cancel.reset();
        let total = started.elapsed();
        info!(status = ?self.state.status, elapsed_ms = duration_ms(total), "run finished");
        on_progress(
            &RunProgress::Finished {
                status: self.state.status,
                elapsed: total,
            },
            &self.state,
        );

        RunReport {
            status: self.state.status,
            started_at,
            total_elapsed_ms: duration_ms(total),
            steps: records,
            failure: self.state.failure.clone(),
        }
    }

    /// Resolve, validate and execute a single step
    fn run_step(&mut self, index: usize, step: &MacroStep, env: &mut Environment) -> StepResult<ExecutionOutcome> {
        let resolved = step
            .reference
            .as_ref()
            .map(|reference| self.resolver.resolve(reference))
            .transpose()?;
        self.executor.validate(step)?;
        debug!(step = index, action = %step.action, "executing");
        self.executor
            .execute(step, resolved.as_ref(), env, &self.cancel)
    }
}
