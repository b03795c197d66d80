//! Action execution.
//!
//! Every [`ActionKind`] has one entry in a fixed dispatch table, indexed by
//! the kind's discriminant. An entry pairs a `validate` function (parameters
//! and reference kind only, no effects) with an `execute` function that
//! performs the step against an [`Environment`].

mod actions;

use image::RgbImage;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::RunSettings;
use crate::environment::Environment;
use crate::error::StepResult;
use crate::macros::{ActionKind, MacroStep, Parameters, ReferenceKind};
use crate::reference::ResolvedReference;
use crate::runner::CancelToken;
use crate::screen::{MatchResult, Point};

/// What a successful step produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Done,
    Opened { target: String },
    Waited { seconds: f64 },
    Matched { result: MatchResult },
    Pointer { at: Point },
    Copied { text: String },
    Script { value: Value },
    ElementClicked { query: String },
}

impl ExecutionOutcome {
    /// Short human-readable summary for reports
    pub fn detail(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Done => None,
            ExecutionOutcome::Opened { target } => Some(format!("opened {}", target)),
            ExecutionOutcome::Waited { seconds } => Some(format!("waited {:.3}s", seconds)),
            ExecutionOutcome::Matched { result } => Some(format!(
                "matched at ({}, {}) confidence {:.3}",
                result.center.x, result.center.y, result.confidence
            )),
            ExecutionOutcome::Pointer { at } => Some(format!("point ({}, {})", at.x, at.y)),
            ExecutionOutcome::Copied { text } => Some(format!("clipboard: {:?}", text)),
            ExecutionOutcome::Script { value } => Some(format!("script returned {}", value)),
            ExecutionOutcome::ElementClicked { query } => Some(format!("clicked {}", query)),
        }
    }
}

/// State carried from one step to the next within a run
#[derive(Debug, Default)]
struct Threaded {
    /// Last located or loaded point
    anchor: Option<Point>,
    /// Last frame captured by the current step
    last_frame: Option<RgbImage>,
}

/// Everything an action sees while it executes
pub(crate) struct StepContext<'a> {
    params: &'a Parameters,
    reference: Option<&'a ResolvedReference>,
    env: &'a mut Environment,
    settings: &'a RunSettings,
    cancel: &'a CancelToken,
    threaded: &'a mut Threaded,
}

type Validate = fn(&Parameters, Option<ReferenceKind>) -> StepResult<()>;
type Execute = fn(&mut StepContext<'_>) -> StepResult<ExecutionOutcome>;

struct ActionEntry {
    kind: ActionKind,
    validate: Validate,
    execute: Execute,
}

/// Dispatch table, in `ActionKind` discriminant order
static DISPATCH: [ActionEntry; ActionKind::COUNT] = [
    ActionEntry {
        kind: ActionKind::OpenTarget,
        validate: actions::validate_open_target,
        execute: actions::open_target,
    },
    ActionEntry {
        kind: ActionKind::ClickReference,
        validate: actions::validate_click_reference,
        execute: actions::click_reference,
    },
    ActionEntry {
        kind: ActionKind::TypeText,
        validate: actions::validate_type_text,
        execute: actions::type_text,
    },
    ActionEntry {
        kind: ActionKind::PressKey,
        validate: actions::validate_press_key,
        execute: actions::press_key,
    },
    ActionEntry {
        kind: ActionKind::Wait,
        validate: actions::validate_wait,
        execute: actions::wait,
    },
    ActionEntry {
        kind: ActionKind::MoveMouse,
        validate: actions::validate_pointer,
        execute: actions::move_mouse,
    },
    ActionEntry {
        kind: ActionKind::Click,
        validate: actions::validate_pointer,
        execute: actions::click,
    },
    ActionEntry {
        kind: ActionKind::RightClick,
        validate: actions::validate_pointer,
        execute: actions::right_click,
    },
    ActionEntry {
        kind: ActionKind::DoubleClick,
        validate: actions::validate_pointer,
        execute: actions::double_click,
    },
    ActionEntry {
        kind: ActionKind::CopyText,
        validate: actions::validate_clipboard,
        execute: actions::copy_text,
    },
    ActionEntry {
        kind: ActionKind::PasteText,
        validate: actions::validate_clipboard,
        execute: actions::paste_text,
    },
    ActionEntry {
        kind: ActionKind::WaitForReference,
        validate: actions::validate_wait_for_reference,
        execute: actions::wait_for_reference,
    },
    ActionEntry {
        kind: ActionKind::RunScript,
        validate: actions::validate_run_script,
        execute: actions::run_script,
    },
    ActionEntry {
        kind: ActionKind::SelectorClick,
        validate: actions::validate_selector_click,
        execute: actions::selector_click,
    },
    ActionEntry {
        kind: ActionKind::PathClick,
        validate: actions::validate_path_click,
        execute: actions::path_click,
    },
    ActionEntry {
        kind: ActionKind::LoadReferencePoint,
        validate: actions::validate_load_reference_point,
        execute: actions::load_reference_point,
    },
];

fn entry(kind: ActionKind) -> &'static ActionEntry {
    &DISPATCH[kind.index()]
}

/// Check a step's parameters and reference kind without touching the environment
pub fn validate_step(step: &MacroStep) -> StepResult<()> {
    let reference = step.reference.as_ref().map(|r| r.kind);
    (entry(step.action).validate)(&step.parameters, reference)
}

/// Executes steps one at a time, threading the anchor point between them
#[derive(Debug)]
pub struct ActionExecutor {
    settings: RunSettings,
    threaded: Threaded,
}

impl ActionExecutor {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings,
            threaded: Threaded::default(),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Forget all state carried between steps
    pub fn reset(&mut self) {
        self.threaded = Threaded::default();
    }

    /// Point the next pointer action falls back to
    pub fn anchor(&self) -> Option<Point> {
        self.threaded.anchor
    }

    /// Frame captured by the most recent step, if it captured one
    pub fn last_frame(&self) -> Option<&RgbImage> {
        self.threaded.last_frame.as_ref()
    }

    pub fn validate(&self, step: &MacroStep) -> StepResult<()> {
        validate_step(step)
    }

    /// Perform one step. `reference` is the step's resolved reference, if it declared one.
    pub fn execute(
        &mut self,
        step: &MacroStep,
        reference: Option<&ResolvedReference>,
        env: &mut Environment,
        cancel: &CancelToken,
    ) -> StepResult<ExecutionOutcome> {
        self.threaded.last_frame = None;
        let entry = entry(step.action);
        debug!(action = %entry.kind, "dispatching");

        let mut ctx = StepContext {
            params: &step.parameters,
            reference,
            env,
            settings: &self.settings,
            cancel,
            threaded: &mut self.threaded,
        };
        (entry.execute)(&mut ctx)
    }
}

#[cfg(test)]
mod tests;
