//! Session management for run artifacts.
//!
//! Each CLI run gets its own directory holding:
//! - `report.json`, the serialized [`RunReport`]
//! - `failure_step_<k>.png`, the last frame captured by a failing step
//!
//! Session directories are removed on drop unless explicitly preserved.

use image::RgbImage;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config;
use crate::runner::RunReport;

/// File name of the run report inside a session
pub const REPORT_FILE: &str = "report.json";

/// A run session with organized file management
#[derive(Debug)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    /// Whether to keep files after session ends
    pub keep: bool,
    /// Macro file this session runs, if any
    pub macro_path: Option<PathBuf>,
}

impl Session {
    /// Create a new session with a unique ID under the configured base directory
    pub fn new() -> Self {
        Self::in_base(config::session_base_dir(), generate_session_id())
    }

    /// Create a session named after `name` (typically the macro file stem)
    pub fn with_name(name: &str) -> Self {
        let id = format!("{}_{}", sanitize_name(name), generate_timestamp_suffix());
        Self::in_base(config::session_base_dir(), id)
    }

    /// Create a session in a specific directory. User-specified directories are kept.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(generate_session_id);

        Self {
            id,
            dir,
            keep: true,
            macro_path: None,
        }
    }

    fn in_base(base: PathBuf, id: String) -> Self {
        Self {
            dir: base.join(&id),
            id,
            keep: false,
            macro_path: None,
        }
    }

    /// Set whether to keep files after session ends
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn for_macro(mut self, path: impl Into<PathBuf>) -> Self {
        self.macro_path = Some(path.into());
        self
    }

    /// Initialize the session directory
    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let metadata = serde_json::json!({
            "id": self.id,
            "created": chrono::Utc::now().to_rfc3339(),
            "macro": self.macro_path.as_ref().map(|p| p.display().to_string()),
        });

        let metadata_path = self.dir.join(".session.json");
        fs::write(metadata_path, serde_json::to_string_pretty(&metadata)?)?;

        Ok(())
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    /// Get path for the frame captured by failing step `index`
    pub fn failure_capture_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("failure_step_{}.png", index))
    }

    pub fn save_report(&self, report: &RunReport) -> io::Result<PathBuf> {
        let path = self.report_path();
        fs::write(&path, serde_json::to_string_pretty(report)?)?;
        Ok(path)
    }

    pub fn save_failure_capture(&self, index: usize, frame: &RgbImage) -> io::Result<PathBuf> {
        let path = self.failure_capture_path(index);
        frame.save(&path).map_err(io::Error::other)?;
        Ok(path)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Clean up the session directory
    pub fn cleanup(&self) -> io::Result<()> {
        if self.dir.exists() && !self.keep {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

/// Generate a unique session ID
fn generate_session_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    format!("session_{}_{}", timestamp, pid)
}

/// Generate a timestamp suffix
fn generate_timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Sanitize a name for use in filenames
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
