//! macroflow - record-and-replay desktop/web automation macros.
//!
//! This crate provides:
//! - A persisted macro model: ordered steps, each an action plus an optional reference
//! - Reference resolution for images, videos, text/markup snippets and coordinates
//! - Template matching of reference images against screen captures
//! - A fail-fast runner with cancellation, progress events and run reports
//! - Headless collaborators (recording input, static page) for tests and dry runs
//!
//! # Example
//!
//! ```rust,no_run
//! use macroflow::{EffectLog, Environment, MacroRunner, MacroStore, ReferenceResolver, RunSettings};
//! use macroflow::screen::ImageFileScreen;
//!
//! let store = MacroStore::new("macro_config.json");
//! let steps = store.load().unwrap();
//!
//! let log = EffectLog::new();
//! let mut env = Environment::headless(ImageFileScreen::open("screen.png").unwrap(), &log);
//! let mut runner = MacroRunner::new(
//!     RunSettings::default(),
//!     ReferenceResolver::with_base_dir(store.base_dir()),
//! );
//! let report = runner.run(steps.steps(), &mut env);
//! println!("{:?} after {} ms", report.status, report.total_elapsed_ms);
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod macros;
pub mod poll;
pub mod reference;
pub mod runner;
pub mod screen;
pub mod session;

// Re-export configuration
pub use config::{Config, RunSettings};

// Re-export errors
pub use error::{ErrorKind, MacroError, MacroResult, StepError, StepResult};

// Re-export the macro model and store
pub use macros::{
    ActionKind, DEFAULT_MACRO_FILE, Macro, MacroStep, MacroStore, Parameters, Reference, ReferenceKind,
};

// Re-export reference resolution
pub use reference::{ReferenceResolver, ResolvedReference};

// Re-export execution
pub use environment::{
    DriverError, Effect, EffectLog, ElementQuery, Environment, FocusHelper, InputDriver, MouseButton, NoFocus,
    PageDriver, RecordingInput, StaticPage,
};
pub use executor::{ActionExecutor, ExecutionOutcome, validate_step};
pub use runner::{
    CancelToken, FailureInfo, MacroRunner, RunProgress, RunReport, RunState, RunStatus, StepRecord,
};

// Re-export screen types
pub use screen::{MatchResult, MockFramebuffer, Point, Region, ScreenSource, Template};

// Re-export session management
pub use session::Session;
