//! Reference resolution.
//!
//! Turns a `{type, path}` descriptor into a typed value the executor can use.
//! Image and video references are only checked for existence here; template
//! pixels are decoded by the matcher when needed.

use serde::Deserialize;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{StepError, StepResult};
use crate::macros::{Reference, ReferenceKind};
use crate::screen::Point;

/// A reference loaded into memory
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedReference {
    /// Template image, decoded lazily by the matcher
    Image { path: PathBuf },
    /// Video file, for external playback only
    Video { path: PathBuf },
    /// CSS selector, XPath or HTML fragment
    Markup(String),
    Text(String),
    /// One or more recorded points, in file order
    Coordinates(Vec<Point>),
}

impl ResolvedReference {
    pub fn kind(&self) -> ReferenceKind {
        match self {
            ResolvedReference::Image { .. } => ReferenceKind::Image,
            ResolvedReference::Video { .. } => ReferenceKind::Video,
            ResolvedReference::Markup(_) => ReferenceKind::MarkupSnippet,
            ResolvedReference::Text(_) => ReferenceKind::Text,
            ResolvedReference::Coordinates(_) => ReferenceKind::Coordinate,
        }
    }

    /// Snippet or text content, for actions that accept either
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResolvedReference::Markup(s) | ResolvedReference::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn first_point(&self) -> Option<Point> {
        match self {
            ResolvedReference::Coordinates(points) => points.first().copied(),
            _ => None,
        }
    }
}

/// Resolves references, interpreting relative paths against an optional base directory
#[derive(Debug, Clone, Default)]
pub struct ReferenceResolver {
    base_dir: Option<PathBuf>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    /// Path a reference points at after applying the base directory
    pub fn locate(&self, reference: &Reference) -> PathBuf {
        let path = Path::new(&reference.path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn resolve(&self, reference: &Reference) -> StepResult<ResolvedReference> {
        if reference.path.trim().is_empty() {
            return Err(StepError::ReferenceNotFound {
                path: PathBuf::new(),
            });
        }
        let path = self.locate(reference);
        if !path.is_file() {
            return Err(StepError::ReferenceNotFound { path });
        }

        let resolved = match reference.kind {
            ReferenceKind::Image => ResolvedReference::Image { path },
            ReferenceKind::Video => ResolvedReference::Video { path },
            ReferenceKind::MarkupSnippet => ResolvedReference::Markup(read_text(&path)?),
            ReferenceKind::Text => ResolvedReference::Text(read_text(&path)?),
            ReferenceKind::Coordinate => {
                let content = read_text(&path)?;
                ResolvedReference::Coordinates(parse_coordinates(&content).map_err(|reason| {
                    StepError::ReferenceLoadError {
                        path: path.clone(),
                        reason,
                    }
                })?)
            }
        };
        debug!(kind = %reference.kind, path = %reference.path, "reference resolved");
        Ok(resolved)
    }
}

fn read_text(path: &Path) -> StepResult<String> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        IoErrorKind::NotFound => StepError::ReferenceNotFound {
            path: path.to_path_buf(),
        },
        _ => StepError::ReferenceLoadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PointRecord {
    Object { x: i32, y: i32 },
    Pair([i32; 2]),
}

impl From<PointRecord> for Point {
    fn from(record: PointRecord) -> Self {
        match record {
            PointRecord::Object { x, y } => Point::new(x, y),
            PointRecord::Pair([x, y]) => Point::new(x, y),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CoordinateRecord {
    One(PointRecord),
    Many(Vec<PointRecord>),
}

/// Parse a coordinate record: `{"x":1,"y":2}`, `[1,2]`, or a non-empty list of either
pub fn parse_coordinates(content: &str) -> Result<Vec<Point>, String> {
    let record: CoordinateRecord = serde_json::from_str(content)
        .map_err(|_| "expected {\"x\": int, \"y\": int}, [x, y], or a list of points".to_string())?;
    let points: Vec<Point> = match record {
        CoordinateRecord::One(point) => vec![point.into()],
        CoordinateRecord::Many(points) => points.into_iter().map(Point::from).collect(),
    };
    if points.is_empty() {
        return Err("coordinate list is empty".to_string());
    }
    Ok(points)
}
