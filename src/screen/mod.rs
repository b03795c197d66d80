pub mod backend;
pub mod matcher;
pub mod types;

pub use backend::{CaptureResult, ImageFileScreen, MockFramebuffer, ScreenSource};
#[cfg(feature = "live-screen")]
pub use backend::LiveScreen;
pub use matcher::{DEFAULT_CONFIDENCE, Template, best_match, locate};
pub use types::{MatchResult, Point, Region, ScreenError, ScreenResult};
