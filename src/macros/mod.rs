pub mod store;
pub mod types;

pub use store::{DEFAULT_MACRO_FILE, MacroStore, from_json_str, to_json_string};
pub use types::{ActionKind, Macro, MacroStep, Parameters, Reference, ReferenceKind, UnknownAction};
