//! External collaborators a run drives.
//!
//! Every physical effect goes through one of three traits: [`InputDriver`]
//! for mouse and keyboard, [`PageDriver`] for the browser page, and
//! [`FocusHelper`] for bringing the target window forward. The headless
//! implementations record each effect into a shared [`EffectLog`].

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::screen::{Point, ScreenSource};

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError(message.into())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// How a page element is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementQuery {
    Css(String),
    XPath(String),
}

impl ElementQuery {
    pub fn as_str(&self) -> &str {
        match self {
            ElementQuery::Css(q) | ElementQuery::XPath(q) => q,
        }
    }
}

impl fmt::Display for ElementQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementQuery::Css(q) => write!(f, "css:{}", q),
            ElementQuery::XPath(q) => write!(f, "xpath:{}", q),
        }
    }
}

/// Mouse and keyboard injection
pub trait InputDriver {
    fn move_mouse(&mut self, to: Point) -> DriverResult<()>;

    /// Click at `at`, or at the current cursor position when `None`
    fn click(&mut self, at: Option<Point>, button: MouseButton, count: u32) -> DriverResult<()>;

    fn type_text(&mut self, text: &str) -> DriverResult<()>;

    /// Press a key or chord such as `enter` or `ctrl+c`
    fn press_key(&mut self, key: &str) -> DriverResult<()>;

    /// Copy the current selection and return the copied text
    fn copy_selection(&mut self) -> DriverResult<String>;

    fn set_clipboard(&mut self, text: &str) -> DriverResult<()>;

    fn paste(&mut self) -> DriverResult<()>;
}

/// Browser page automation
pub trait PageDriver {
    fn open(&mut self, target: &Url) -> DriverResult<()>;

    /// Evaluate a script in the page. `Err` carries the script's own error message.
    fn run_script(&mut self, source: &str) -> DriverResult<Value>;

    fn find_element(&mut self, query: &ElementQuery) -> DriverResult<bool>;

    fn click_element(&mut self, query: &ElementQuery) -> DriverResult<()>;

    /// Whether the page currently contains the given text or markup
    fn contains(&mut self, needle: &str) -> DriverResult<bool>;
}

/// Brings the automated application to the foreground
pub trait FocusHelper {
    fn focus(&mut self, title: &str) -> bool;
}

/// One effect performed (or simulated) against the environment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    MoveMouse { to: Point },
    Click { at: Point, button: MouseButton, count: u32 },
    TypeText { text: String },
    PressKey { key: String },
    CopySelection { text: String },
    SetClipboard { text: String },
    Paste { text: String },
    Open { target: String },
    RunScript { source: String },
    ClickElement { query: String },
    Focus { title: String },
}

/// Shared, append-only record of effects
#[derive(Debug, Clone, Default)]
pub struct EffectLog {
    entries: Arc<Mutex<Vec<Effect>>>,
}

impl EffectLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, effect: Effect) {
        debug!(?effect, "effect");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(effect);
    }

    /// Copy of all effects recorded so far
    pub fn snapshot(&self) -> Vec<Effect> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Headless collaborators
// ============================================================================

/// Input driver that tracks a virtual cursor and clipboard
#[derive(Debug, Clone)]
pub struct RecordingInput {
    log: EffectLog,
    cursor: Point,
    clipboard: String,
    selection: String,
}

impl RecordingInput {
    pub fn new(log: EffectLog) -> Self {
        Self {
            log,
            cursor: Point::new(0, 0),
            clipboard: String::new(),
            selection: String::new(),
        }
    }

    /// Text that `copy_selection` will return
    pub fn with_selection(mut self, text: impl Into<String>) -> Self {
        self.selection = text.into();
        self
    }

    pub fn cursor(&self) -> Point {
        self.cursor
    }

    pub fn clipboard(&self) -> &str {
        &self.clipboard
    }
}

impl InputDriver for RecordingInput {
    fn move_mouse(&mut self, to: Point) -> DriverResult<()> {
        self.cursor = to;
        self.log.push(Effect::MoveMouse { to });
        Ok(())
    }

    fn click(&mut self, at: Option<Point>, button: MouseButton, count: u32) -> DriverResult<()> {
        if let Some(point) = at {
            self.cursor = point;
        }
        self.log.push(Effect::Click {
            at: self.cursor,
            button,
            count,
        });
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> DriverResult<()> {
        self.log.push(Effect::TypeText {
            text: text.to_string(),
        });
        Ok(())
    }

    fn press_key(&mut self, key: &str) -> DriverResult<()> {
        self.log.push(Effect::PressKey {
            key: key.to_string(),
        });
        Ok(())
    }

    fn copy_selection(&mut self) -> DriverResult<String> {
        self.clipboard = self.selection.clone();
        self.log.push(Effect::CopySelection {
            text: self.clipboard.clone(),
        });
        Ok(self.clipboard.clone())
    }

    fn set_clipboard(&mut self, text: &str) -> DriverResult<()> {
        self.clipboard = text.to_string();
        self.log.push(Effect::SetClipboard {
            text: text.to_string(),
        });
        Ok(())
    }

    fn paste(&mut self) -> DriverResult<()> {
        self.log.push(Effect::Paste {
            text: self.clipboard.clone(),
        });
        Ok(())
    }
}

/// Page driver backed by a fixed HTML source.
///
/// Element lookups are plain substring tests against the source. Opening a
/// `file://` URL replaces the source with the file's contents.
#[derive(Debug, Clone)]
pub struct StaticPage {
    log: EffectLog,
    source: String,
    current: Option<Url>,
}

impl StaticPage {
    pub fn new(log: EffectLog) -> Self {
        Self {
            log,
            source: String::new(),
            current: None,
        }
    }

    pub fn with_source(mut self, html: impl Into<String>) -> Self {
        self.source = html.into();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn current_url(&self) -> Option<&Url> {
        self.current.as_ref()
    }
}

impl PageDriver for StaticPage {
    fn open(&mut self, target: &Url) -> DriverResult<()> {
        if target.scheme() == "file" {
            let path = target
                .to_file_path()
                .map_err(|_| DriverError::new(format!("not a local file: {}", target)))?;
            self.source = fs::read_to_string(&path)
                .map_err(|e| DriverError::new(format!("failed to open {}: {}", path.display(), e)))?;
        }
        self.current = Some(target.clone());
        self.log.push(Effect::Open {
            target: target.to_string(),
        });
        Ok(())
    }

    fn run_script(&mut self, source: &str) -> DriverResult<Value> {
        self.log.push(Effect::RunScript {
            source: source.to_string(),
        });
        Ok(Value::Null)
    }

    fn find_element(&mut self, query: &ElementQuery) -> DriverResult<bool> {
        Ok(self.source.contains(query.as_str()))
    }

    fn click_element(&mut self, query: &ElementQuery) -> DriverResult<()> {
        if !self.source.contains(query.as_str()) {
            return Err(DriverError::new(format!("no element matches {}", query)));
        }
        self.log.push(Effect::ClickElement {
            query: query.to_string(),
        });
        Ok(())
    }

    fn contains(&mut self, needle: &str) -> DriverResult<bool> {
        Ok(self.source.contains(needle))
    }
}

/// Focus helper for environments without windows. Records the request and reports failure.
#[derive(Debug, Clone)]
pub struct NoFocus {
    log: EffectLog,
}

impl NoFocus {
    pub fn new(log: EffectLog) -> Self {
        Self { log }
    }
}

impl FocusHelper for NoFocus {
    fn focus(&mut self, title: &str) -> bool {
        self.log.push(Effect::Focus {
            title: title.to_string(),
        });
        false
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Everything a run acts on: one screen plus the three collaborator seams
pub struct Environment {
    pub screen: Box<dyn ScreenSource>,
    pub input: Box<dyn InputDriver>,
    pub page: Box<dyn PageDriver>,
    pub focus: Box<dyn FocusHelper>,
}

impl Environment {
    pub fn new(
        screen: Box<dyn ScreenSource>,
        input: Box<dyn InputDriver>,
        page: Box<dyn PageDriver>,
        focus: Box<dyn FocusHelper>,
    ) -> Self {
        Self {
            screen,
            input,
            page,
            focus,
        }
    }

    /// Headless environment over `screen`; all effects land in `log`
    pub fn headless(screen: impl ScreenSource + 'static, log: &EffectLog) -> Self {
        Self::new(
            Box::new(screen),
            Box::new(RecordingInput::new(log.clone())),
            Box::new(StaticPage::new(log.clone())),
            Box::new(NoFocus::new(log.clone())),
        )
    }

    pub fn with_input(mut self, input: impl InputDriver + 'static) -> Self {
        self.input = Box::new(input);
        self
    }

    pub fn with_page(mut self, page: impl PageDriver + 'static) -> Self {
        self.page = Box::new(page);
        self
    }

    pub fn with_focus(mut self, focus: impl FocusHelper + 'static) -> Self {
        self.focus = Box::new(focus);
        self
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("screen", &self.screen.source_type())
            .finish_non_exhaustive()
    }
}
