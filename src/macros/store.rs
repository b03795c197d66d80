//! Macro persistence.
//!
//! A macro file is a JSON array; array order is execution order:
//!
//! ```json
//! [
//!     { "action": "ClickReference",
//!       "params": { "reference": { "type": "Image", "path": "ref_images/ok.png" },
//!                   "confidence": 0.9 } }
//! ]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::types::{ActionKind, Macro, MacroStep, Parameters, Reference};
use crate::error::{MacroError, MacroResult};

/// File name the editor saves to by default
pub const DEFAULT_MACRO_FILE: &str = "macro_config.json";

const REFERENCE_KEY: &str = "reference";

/// On-disk shape of one step
#[derive(Debug, Serialize, Deserialize)]
struct StepRecord {
    action: String,
    #[serde(default)]
    params: Map<String, Value>,
}

/// Storage for one macro file
#[derive(Debug, Clone)]
pub struct MacroStore {
    path: PathBuf,
}

impl MacroStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the macro file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative reference paths are resolved against
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn load(&self) -> MacroResult<Macro> {
        let content = fs::read_to_string(&self.path)?;
        let parsed = from_json_str(&content)?;
        debug!(path = %self.path.display(), steps = parsed.len(), "macro loaded");
        Ok(parsed)
    }

    pub fn save(&self, steps: &Macro) -> MacroResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, to_json_string(steps)?)?;
        debug!(path = %self.path.display(), steps = steps.len(), "macro saved");
        Ok(())
    }
}

impl Default for MacroStore {
    fn default() -> Self {
        Self::new(DEFAULT_MACRO_FILE)
    }
}

/// Parse a macro document. Unknown actions are rejected, never skipped.
pub fn from_json_str(content: &str) -> MacroResult<Macro> {
    let records: Vec<StepRecord> = serde_json::from_str(content)?;
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| step_from_record(index, record))
        .collect::<MacroResult<Vec<_>>>()
        .map(Macro::from_steps)
}

/// Serialize a macro as a pretty-printed document with 4-space indentation
pub fn to_json_string(steps: &Macro) -> MacroResult<String> {
    let records: Vec<StepRecord> = steps.steps().iter().map(step_to_record).collect::<MacroResult<_>>()?;
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    records.serialize(&mut serializer)?;
    String::from_utf8(out).map_err(|e| MacroError::Io(std::io::Error::other(e)))
}

fn step_from_record(index: usize, record: StepRecord) -> MacroResult<MacroStep> {
    let action: ActionKind = record
        .action
        .parse()
        .map_err(|_| MacroError::UnknownAction {
            index,
            name: record.action.clone(),
        })?;

    let mut params = record.params;
    let reference = match params.remove(REFERENCE_KEY) {
        None | Some(Value::Null) => None,
        Some(value) => {
            let reference: Reference = serde_json::from_value(value)
                .map_err(|e| MacroError::InvalidReference {
                    index,
                    reason: e.to_string(),
                })?;
            Some(reference)
        }
    };

    Ok(MacroStep {
        action,
        reference,
        parameters: Parameters::from_map(params),
    })
}

fn step_to_record(step: &MacroStep) -> MacroResult<StepRecord> {
    let mut params = step.parameters.as_map().clone();
    if let Some(reference) = &step.reference {
        params.insert(REFERENCE_KEY.to_string(), serde_json::to_value(reference)?);
    }
    Ok(StepRecord {
        action: step.action.as_str().to_string(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::types::ReferenceKind;
    use pretty_assertions::assert_eq;

    fn sample() -> Macro {
        Macro::from_steps(vec![
            MacroStep::new(ActionKind::OpenTarget).with_param("url", "https://example.com"),
            MacroStep::new(ActionKind::ClickReference)
                .with_reference(ReferenceKind::Image, "ref_images/login.png")
                .with_param("confidence", 0.85),
            MacroStep::new(ActionKind::TypeText).with_param("text", "hello"),
            MacroStep::new(ActionKind::SelectorClick)
                .with_reference(ReferenceKind::MarkupSnippet, "selectors/submit.txt"),
            MacroStep::new(ActionKind::Wait).with_param("seconds", 0.5),
        ])
    }

    #[test]
    fn test_save_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = MacroStore::new(dir.path().join("nested").join("macro.json"));
        let original = sample();

        store.save(&original).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, original);
    }

    #[test]
    fn test_reference_lives_inside_params() {
        let text = to_json_string(&sample()).unwrap();
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc[1]["action"], "ClickReference");
        assert_eq!(doc[1]["params"]["reference"]["type"], "Image");
        assert_eq!(doc[3]["params"]["reference"]["type"], "CSS/HTML");
        assert!(text.contains("\n    {"), "expected 4-space indentation");
    }

    #[test]
    fn test_editor_labels_load() {
        let doc = r#"[
            {"action": "Click Reference Image",
             "params": {"reference": {"type": "Image", "path": "a.png"}, "confidence": 0.9}},
            {"action": "Type Text", "params": {"text": "x"}},
            {"action": "Wait", "params": {"seconds": 1.0}}
        ]"#;
        let loaded = from_json_str(doc).unwrap();
        let actions: Vec<ActionKind> = loaded.steps().iter().map(|s| s.action).collect();
        assert_eq!(actions, vec![ActionKind::ClickReference, ActionKind::TypeText, ActionKind::Wait]);
        assert_eq!(loaded.steps()[0].reference, Some(Reference::new(ReferenceKind::Image, "a.png")));
        assert!(!loaded.steps()[0].parameters.contains("reference"));
    }

    #[test]
    fn test_unknown_action_rejected_with_index() {
        let doc = r#"[{"action": "Wait", "params": {}}, {"action": "Fly", "params": {}}]"#;
        match from_json_str(doc) {
            Err(MacroError::UnknownAction { index, name }) => {
                assert_eq!(index, 1);
                assert_eq!(name, "Fly");
            }
            other => panic!("expected UnknownAction, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_reference_rejected() {
        let doc = r#"[{"action": "ClickReference", "params": {"reference": {"type": "Hologram", "path": "x"}}}]"#;
        assert!(matches!(from_json_str(doc), Err(MacroError::InvalidReference { index: 0, .. })));
    }

    #[test]
    fn test_missing_params_defaults_to_empty() {
        let loaded = from_json_str(r#"[{"action": "PressKey"}]"#).unwrap();
        assert!(loaded.steps()[0].parameters.is_empty());
    }

    #[test]
    fn test_not_an_array() {
        assert!(matches!(from_json_str(r#"{"action": "Wait"}"#), Err(MacroError::Parse(_))));
    }
}
