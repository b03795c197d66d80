use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{StepError, StepResult};
use crate::screen::Region;

/// The closed set of actions a step can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    OpenTarget,
    ClickReference,
    TypeText,
    PressKey,
    Wait,
    MoveMouse,
    Click,
    RightClick,
    DoubleClick,
    CopyText,
    PasteText,
    WaitForReference,
    RunScript,
    SelectorClick,
    PathClick,
    LoadReferencePoint,
}

/// Canonical name and editor label for every action, in dispatch order
const ACTION_NAMES: [(ActionKind, &str, &str); 16] = [
    (ActionKind::OpenTarget, "OpenTarget", "Open Website"),
    (ActionKind::ClickReference, "ClickReference", "Click Reference Image"),
    (ActionKind::TypeText, "TypeText", "Type Text"),
    (ActionKind::PressKey, "PressKey", "Press Key"),
    (ActionKind::Wait, "Wait", "Wait"),
    (ActionKind::MoveMouse, "MoveMouse", "Mouse Move"),
    (ActionKind::Click, "Click", "Click"),
    (ActionKind::RightClick, "RightClick", "Right Click"),
    (ActionKind::DoubleClick, "DoubleClick", "Double Click"),
    (ActionKind::CopyText, "CopyText", "Copy Text"),
    (ActionKind::PasteText, "PasteText", "Paste Text"),
    (ActionKind::WaitForReference, "WaitForReference", "Wait for Image"),
    (ActionKind::RunScript, "RunScript", "Custom JavaScript"),
    (ActionKind::SelectorClick, "SelectorClick", "CSS Selector Click"),
    (ActionKind::PathClick, "PathClick", "XPath Click"),
    (ActionKind::LoadReferencePoint, "LoadReferencePoint", "Load Reference Point"),
];

impl ActionKind {
    pub const COUNT: usize = ACTION_NAMES.len();

    /// Every action kind, in dispatch-table order
    pub fn all() -> impl Iterator<Item = ActionKind> {
        ACTION_NAMES.iter().map(|(kind, _, _)| *kind)
    }

    /// Position of this kind in the dispatch table
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        ACTION_NAMES[self.index()].1
    }

    /// Label used by the macro editor
    pub fn label(self) -> &'static str {
        ACTION_NAMES[self.index()].2
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error for an action name outside the closed set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action `{}`", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for ActionKind {
    type Err = UnknownAction;

    /// Accepts canonical names and editor labels, case-sensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ACTION_NAMES
            .iter()
            .find(|(_, name, label)| *name == s || *label == s)
            .map(|(kind, _, _)| *kind)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

impl Serialize for ActionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActionKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// How a reference's `path` is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    /// Template image for screen matching
    Image,

    /// Recording kept for review; never decoded here
    Video,

    /// CSS selector or HTML fragment
    #[serde(rename = "CSS/HTML", alias = "MarkupSnippet")]
    MarkupSnippet,

    /// Raw text
    Text,

    /// Coordinate record (one point or a list)
    #[serde(rename = "Coordinates", alias = "Coordinate")]
    Coordinate,
}

impl ReferenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceKind::Image => "Image",
            ReferenceKind::Video => "Video",
            ReferenceKind::MarkupSnippet => "CSS/HTML",
            ReferenceKind::Text => "Text",
            ReferenceKind::Coordinate => "Coordinates",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A typed pointer to a captured artifact. Immutable once attached to a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub path: String,
}

impl Reference {
    pub fn new(kind: ReferenceKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Action-specific parameters, validated when the step executes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Optional string parameter; present-but-not-a-string is invalid
    pub fn str(&self, key: &str) -> StepResult<Option<&str>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(StepError::invalid(key, format!("expected a string, got {}", other))),
        }
    }

    /// Required string parameter. An empty string is a valid value.
    pub fn required_str(&self, key: &str) -> StepResult<&str> {
        self.str(key)?
            .ok_or_else(|| StepError::invalid(key, "is required"))
    }

    /// Optional number; numeric strings are accepted
    pub fn f64(&self, key: &str) -> StepResult<Option<f64>> {
        let value = match self.0.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match value {
            Some(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(StepError::invalid(key, "expected a number")),
        }
    }

    /// Optional integer
    pub fn i64(&self, key: &str) -> StepResult<Option<i64>> {
        match self.f64(key)? {
            None => Ok(None),
            Some(v) if v.fract() == 0.0 => Ok(Some(v as i64)),
            Some(_) => Err(StepError::invalid(key, "expected an integer")),
        }
    }

    /// Optional non-negative number of seconds
    pub fn seconds(&self, key: &str) -> StepResult<Option<Duration>> {
        match self.f64(key)? {
            None => Ok(None),
            Some(v) if v < 0.0 => Err(StepError::invalid(key, "must not be negative")),
            Some(v) => Duration::try_from_secs_f64(v)
                .map(Some)
                .map_err(|_| StepError::invalid(key, "is too large")),
        }
    }

    /// Optional confidence threshold in `[0, 1]`
    pub fn confidence(&self, key: &str) -> StepResult<Option<f64>> {
        match self.f64(key)? {
            Some(v) if !(0.0..=1.0).contains(&v) => {
                Err(StepError::invalid(key, "must be between 0 and 1"))
            }
            other => Ok(other),
        }
    }

    /// Optional search region `{x, y, width, height}`
    pub fn region(&self, key: &str) -> StepResult<Option<Region>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| StepError::invalid(key, e.to_string())),
        }
    }
}

/// One action plus its optional reference binding and parameters
#[derive(Debug, Clone, PartialEq)]
pub struct MacroStep {
    pub action: ActionKind,
    pub reference: Option<Reference>,
    pub parameters: Parameters,
}

impl MacroStep {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            reference: None,
            parameters: Parameters::new(),
        }
    }

    pub fn with_reference(mut self, kind: ReferenceKind, path: impl Into<String>) -> Self {
        self.reference = Some(Reference::new(kind, path));
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key, value);
        self
    }
}

/// An ordered sequence of steps. Position is the only identity a step has.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Macro {
    steps: Vec<MacroStep>,
}

impl Macro {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<MacroStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[MacroStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn push(&mut self, step: MacroStep) {
        self.steps.push(step);
    }

    pub fn remove(&mut self, index: usize) -> Option<MacroStep> {
        (index < self.steps.len()).then(|| self.steps.remove(index))
    }

    /// Swap the step at `index` with its predecessor. Returns false at the top edge.
    pub fn move_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.steps.len() {
            return false;
        }
        self.steps.swap(index, index - 1);
        true
    }

    /// Swap the step at `index` with its successor. Returns false at the bottom edge.
    pub fn move_down(&mut self, index: usize) -> bool {
        if index + 1 >= self.steps.len() {
            return false;
        }
        self.steps.swap(index, index + 1);
        true
    }
}

impl From<Vec<MacroStep>> for Macro {
    fn from(steps: Vec<MacroStep>) -> Self {
        Self::from_steps(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_action_names_and_labels_parse() {
        for kind in ActionKind::all() {
            assert_eq!(kind.as_str().parse::<ActionKind>(), Ok(kind));
            assert_eq!(kind.label().parse::<ActionKind>(), Ok(kind));
        }
        assert_eq!("Wait for Image".parse::<ActionKind>(), Ok(ActionKind::WaitForReference));
        assert!("Teleport".parse::<ActionKind>().is_err());
        assert_eq!(ActionKind::all().count(), ActionKind::COUNT);
    }

    #[test]
    fn test_dispatch_order_matches_discriminants() {
        for (position, kind) in ActionKind::all().enumerate() {
            assert_eq!(kind.index(), position);
        }
    }

    #[test]
    fn test_reference_wire_names() {
        let reference = Reference::new(ReferenceKind::MarkupSnippet, "sel.txt");
        assert_eq!(
            serde_json::to_value(&reference).unwrap(),
            json!({"type": "CSS/HTML", "path": "sel.txt"})
        );
        let coords: Reference = serde_json::from_value(json!({"type": "Coordinates", "path": "p.json"})).unwrap();
        assert_eq!(coords.kind, ReferenceKind::Coordinate);
    }

    #[test]
    fn test_parameter_accessors() {
        let step = MacroStep::new(ActionKind::Wait)
            .with_param("seconds", 1.5)
            .with_param("text", "")
            .with_param("count", "3")
            .with_param("bad", json!([1]));
        let p = &step.parameters;

        assert_eq!(p.seconds("seconds").unwrap(), Some(Duration::from_millis(1500)));
        assert_eq!(p.required_str("text").unwrap(), "");
        assert_eq!(p.i64("count").unwrap(), Some(3));
        assert_eq!(p.f64("missing").unwrap(), None);
        assert!(p.f64("bad").is_err());
        assert!(p.required_str("missing").is_err());
        assert!(p.str("seconds").is_err());
    }

    #[test]
    fn test_negative_seconds_rejected() {
        let p = MacroStep::new(ActionKind::Wait).with_param("seconds", -1).parameters;
        let err = p.seconds("seconds").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_region_parameter() {
        let p = MacroStep::new(ActionKind::WaitForReference)
            .with_param("region", json!({"x": 1, "y": 2, "width": 3, "height": 4}))
            .parameters;
        assert_eq!(p.region("region").unwrap(), Some(Region::new(1, 2, 3, 4)));
    }

    #[test]
    fn test_move_up_swaps_adjacent_only() {
        let a = MacroStep::new(ActionKind::OpenTarget);
        let b = MacroStep::new(ActionKind::Wait);
        let c = MacroStep::new(ActionKind::Click);
        let mut m = Macro::from_steps(vec![a.clone(), b.clone(), c.clone()]);

        assert!(m.move_up(1));
        assert_eq!(m.steps(), &[b.clone(), a.clone(), c.clone()]);
        assert_eq!(m.len(), 3);

        assert!(!m.move_up(0));
        assert!(!m.move_down(2));
        assert!(m.move_down(0));
        assert_eq!(m.steps(), &[a, b, c]);
    }

    #[test]
    fn test_remove_by_position() {
        let mut m = Macro::new();
        m.push(MacroStep::new(ActionKind::TypeText));
        m.push(MacroStep::new(ActionKind::PressKey));
        assert_eq!(m.remove(5), None);
        assert_eq!(m.remove(0).map(|s| s.action), Some(ActionKind::TypeText));
        assert_eq!(m.len(), 1);
    }
}
