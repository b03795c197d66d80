//! One validate/execute pair per action kind.

use image::RgbImage;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::{ExecutionOutcome, StepContext};
use crate::environment::{ElementQuery, MouseButton};
use crate::error::{StepError, StepResult};
use crate::macros::{Parameters, ReferenceKind};
use crate::poll::{Attempt, Poll, PollOutcome};
use crate::reference::ResolvedReference;
use crate::screen::{MatchResult, Point, Region, Template, locate};

// ============================================================================
// Shared helpers
// ============================================================================

const TEXT_KINDS: &[ReferenceKind] = &[ReferenceKind::Text, ReferenceKind::MarkupSnippet];

/// Reference must be present and of one of `allowed`
fn require_reference(
    reference: Option<ReferenceKind>,
    allowed: &[ReferenceKind],
    expected: &str,
) -> StepResult<()> {
    match reference {
        None => Err(StepError::MissingReference {
            expected: expected.to_string(),
        }),
        Some(kind) => accept_reference(Some(kind), allowed),
    }
}

/// Reference, if present, must be of one of `allowed`
fn accept_reference(reference: Option<ReferenceKind>, allowed: &[ReferenceKind]) -> StepResult<()> {
    match reference {
        Some(kind) if !allowed.contains(&kind) => Err(StepError::invalid(
            "reference",
            format!("{} reference is not usable here", kind),
        )),
        _ => Ok(()),
    }
}

fn missing(expected: &str) -> StepError {
    StepError::MissingReference {
        expected: expected.to_string(),
    }
}

fn driver_failure(what: &str, err: impl std::fmt::Display) -> StepError {
    StepError::execution(format!("{} failed: {}", what, err))
}

/// Capture a frame and keep it as the step's last frame
fn capture_frame<'c>(ctx: &'c mut StepContext<'_>) -> StepResult<&'c RgbImage> {
    let capture = ctx
        .env
        .screen
        .capture()
        .map_err(|e| driver_failure("screen capture", e))?;
    Ok(ctx.threaded.last_frame.insert(capture.image))
}

/// One capture-and-match attempt
fn match_once(
    ctx: &mut StepContext<'_>,
    template: &Template,
    region: Option<Region>,
    threshold: f64,
) -> StepResult<Attempt<MatchResult>> {
    let frame = capture_frame(ctx)?;
    match locate(template, frame, region, threshold) {
        Ok(found) => Ok(Attempt::Found(found)),
        Err(StepError::MatchNotFound { best, .. }) => Ok(Attempt::Missed { score: best }),
        Err(e) => Err(e),
    }
}

fn confidence_threshold(ctx: &StepContext<'_>) -> StepResult<f64> {
    Ok(ctx.params.confidence("confidence")?.unwrap_or(ctx.settings.confidence))
}

/// Interval parameter; must be positive when given
fn interval(params: &Parameters) -> StepResult<Option<Duration>> {
    match params.seconds("interval")? {
        Some(d) if d.is_zero() => Err(StepError::invalid("interval", "must be positive")),
        other => Ok(other),
    }
}

/// Explicit `x`/`y` pair; one without the other is invalid
fn explicit_point(params: &Parameters) -> StepResult<Option<Point>> {
    let coord = |key: &str| -> StepResult<Option<i32>> {
        params
            .i64(key)?
            .map(|v| i32::try_from(v).map_err(|_| StepError::invalid(key, "out of range")))
            .transpose()
    };
    match (coord("x")?, coord("y")?) {
        (Some(x), Some(y)) => Ok(Some(Point::new(x, y))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(StepError::invalid("y", "is required when x is given")),
        (None, Some(_)) => Err(StepError::invalid("x", "is required when y is given")),
    }
}

/// Text from a parameter, else from a Text or Markup reference
fn text_source(ctx: &StepContext<'_>, key: &str) -> StepResult<Option<String>> {
    if let Some(text) = ctx.params.str(key)? {
        return Ok(Some(text.to_string()));
    }
    Ok(ctx.reference.and_then(ResolvedReference::as_text).map(str::to_string))
}

// ============================================================================
// OpenTarget
// ============================================================================

/// Parse a target locator: an http(s)/file URL, or a path to an existing local file
pub(crate) fn parse_target(target: &str) -> StepResult<Url> {
    let target = target.trim();
    if target.is_empty() {
        return Err(StepError::invalid("url", "is empty"));
    }
    match Url::parse(target) {
        Ok(url) => match url.scheme() {
            "http" | "https" if url.host().is_some() => Ok(url),
            "file" => Ok(url),
            "http" | "https" => Err(StepError::invalid("url", format!("`{}` has no host", target))),
            scheme => Err(StepError::invalid(
                "url",
                format!("unsupported scheme `{}` in `{}`", scheme, target),
            )),
        },
        Err(_) => {
            let path = Path::new(target);
            if !path.is_file() {
                return Err(StepError::invalid(
                    "url",
                    format!("`{}` is neither a URL nor an existing file", target),
                ));
            }
            std::path::absolute(path)
                .ok()
                .and_then(|abs| Url::from_file_path(abs).ok())
                .ok_or_else(|| StepError::invalid("url", format!("cannot address `{}`", target)))
        }
    }
}

fn target_param(params: &Parameters) -> StepResult<&str> {
    match params.str("url")? {
        Some(url) => Ok(url),
        None => params
            .str("target")?
            .ok_or_else(|| StepError::invalid("url", "is required")),
    }
}

pub(super) fn validate_open_target(params: &Parameters, _: Option<ReferenceKind>) -> StepResult<()> {
    parse_target(target_param(params)?).map(|_| ())
}

pub(super) fn open_target(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let url = parse_target(target_param(ctx.params)?)?;
    info!(url = %url, "opening target");
    ctx.env
        .page
        .open(&url)
        .map_err(|e| driver_failure("open", e))?;
    Ok(ExecutionOutcome::Opened {
        target: url.to_string(),
    })
}

// ============================================================================
// ClickReference
// ============================================================================

pub(super) fn validate_click_reference(
    params: &Parameters,
    reference: Option<ReferenceKind>,
) -> StepResult<()> {
    params.confidence("confidence")?;
    params.seconds("timeout")?;
    params.region("region")?;
    require_reference(
        reference,
        &[ReferenceKind::Image, ReferenceKind::Coordinate],
        "an Image",
    )
}

pub(super) fn click_reference(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let reference = ctx.reference;
    let target = match reference {
        None => return Err(missing("an Image")),
        Some(ResolvedReference::Coordinates(points)) => {
            let point = points.first().copied().ok_or_else(|| missing("a Coordinates"))?;
            ctx.env
                .input
                .click(Some(point), MouseButton::Left, 1)
                .map_err(|e| driver_failure("click", e))?;
            ctx.threaded.anchor = Some(point);
            return Ok(ExecutionOutcome::Pointer { at: point });
        }
        Some(ResolvedReference::Image { path }) => path.clone(),
        Some(other) => {
            return Err(StepError::invalid(
                "reference",
                format!("{} reference is not usable here", other.kind()),
            ));
        }
    };

    let template = Template::load(&target)?;
    let threshold = confidence_threshold(ctx)?;
    let region = ctx.params.region("region")?;
    let timeout = ctx.params.seconds("timeout")?.unwrap_or(Duration::ZERO);

    let found = if timeout.is_zero() {
        locate(&template, capture_frame(ctx)?, region, threshold)?
    } else {
        let cancel = ctx.cancel;
        let poll = Poll::new(timeout, ctx.settings.poll_interval);
        match poll.run(cancel, || match_once(ctx, &template, region, threshold))? {
            PollOutcome::Found(found) => found,
            PollOutcome::TimedOut { elapsed, best } => {
                return Err(StepError::MatchTimeout { elapsed, best });
            }
        }
    };

    ctx.env
        .input
        .click(Some(found.center), MouseButton::Left, 1)
        .map_err(|e| driver_failure("click", e))?;
    ctx.threaded.anchor = Some(found.center);
    debug!(x = found.center.x, y = found.center.y, confidence = found.confidence, "clicked reference");
    Ok(ExecutionOutcome::Matched { result: found })
}

// ============================================================================
// Keyboard
// ============================================================================

pub(super) fn validate_type_text(params: &Parameters, _: Option<ReferenceKind>) -> StepResult<()> {
    params.required_str("text").map(|_| ())
}

pub(super) fn type_text(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let text = ctx.params.required_str("text")?;
    ctx.env
        .input
        .type_text(text)
        .map_err(|e| driver_failure("typing", e))?;
    Ok(ExecutionOutcome::Done)
}

fn key_param(params: &Parameters) -> StepResult<&str> {
    let key = params.required_str("key")?.trim();
    if key.is_empty() {
        return Err(StepError::invalid("key", "must not be empty"));
    }
    Ok(key)
}

pub(super) fn validate_press_key(params: &Parameters, _: Option<ReferenceKind>) -> StepResult<()> {
    key_param(params).map(|_| ())
}

pub(super) fn press_key(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let key = key_param(ctx.params)?;
    ctx.env
        .input
        .press_key(key)
        .map_err(|e| driver_failure("key press", e))?;
    Ok(ExecutionOutcome::Done)
}

// ============================================================================
// Wait
// ============================================================================

fn wait_param(params: &Parameters) -> StepResult<Duration> {
    params
        .seconds("seconds")?
        .ok_or_else(|| StepError::invalid("seconds", "is required"))
}

pub(super) fn validate_wait(params: &Parameters, _: Option<ReferenceKind>) -> StepResult<()> {
    wait_param(params).map(|_| ())
}

pub(super) fn wait(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let duration = wait_param(ctx.params)?;
    thread::sleep(duration);
    Ok(ExecutionOutcome::Waited {
        seconds: duration.as_secs_f64(),
    })
}

// ============================================================================
// Pointer actions
// ============================================================================

pub(super) fn validate_pointer(params: &Parameters, reference: Option<ReferenceKind>) -> StepResult<()> {
    explicit_point(params)?;
    params.confidence("confidence")?;
    params.region("region")?;
    accept_reference(reference, &[ReferenceKind::Coordinate, ReferenceKind::Image])
}

/// Where a pointer action aims: explicit x/y, then the reference, then the anchor
fn pointer_target(ctx: &mut StepContext<'_>) -> StepResult<Option<Point>> {
    if let Some(point) = explicit_point(ctx.params)? {
        return Ok(Some(point));
    }
    let reference = ctx.reference;
    match reference {
        Some(ResolvedReference::Coordinates(points)) => Ok(points.first().copied()),
        Some(ResolvedReference::Image { path }) => {
            let template = Template::load(path)?;
            let threshold = confidence_threshold(ctx)?;
            let region = ctx.params.region("region")?;
            let found = locate(&template, capture_frame(ctx)?, region, threshold)?;
            Ok(Some(found.center))
        }
        Some(other) => Err(StepError::invalid(
            "reference",
            format!("{} reference is not usable here", other.kind()),
        )),
        None => Ok(ctx.threaded.anchor),
    }
}

fn pointer_click(ctx: &mut StepContext<'_>, button: MouseButton, count: u32) -> StepResult<ExecutionOutcome> {
    let target = pointer_target(ctx)?;
    ctx.env
        .input
        .click(target, button, count)
        .map_err(|e| driver_failure("click", e))?;
    match target {
        Some(at) => {
            ctx.threaded.anchor = Some(at);
            Ok(ExecutionOutcome::Pointer { at })
        }
        None => Ok(ExecutionOutcome::Done),
    }
}

pub(super) fn move_mouse(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let at = pointer_target(ctx)?.ok_or_else(|| {
        StepError::invalid("x", "needs x/y, a reference, or a previously located point")
    })?;
    ctx.env
        .input
        .move_mouse(at)
        .map_err(|e| driver_failure("mouse move", e))?;
    ctx.threaded.anchor = Some(at);
    Ok(ExecutionOutcome::Pointer { at })
}

pub(super) fn click(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    pointer_click(ctx, MouseButton::Left, 1)
}

pub(super) fn right_click(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    pointer_click(ctx, MouseButton::Right, 1)
}

pub(super) fn double_click(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    pointer_click(ctx, MouseButton::Left, 2)
}

// ============================================================================
// Clipboard
// ============================================================================

pub(super) fn validate_clipboard(params: &Parameters, reference: Option<ReferenceKind>) -> StepResult<()> {
    params.str("text")?;
    accept_reference(reference, TEXT_KINDS)
}

pub(super) fn copy_text(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let text = match text_source(ctx, "text")? {
        Some(text) => {
            ctx.env
                .input
                .set_clipboard(&text)
                .map_err(|e| driver_failure("clipboard write", e))?;
            text
        }
        None => ctx
            .env
            .input
            .copy_selection()
            .map_err(|e| driver_failure("copy", e))?,
    };
    Ok(ExecutionOutcome::Copied { text })
}

pub(super) fn paste_text(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    if let Some(text) = text_source(ctx, "text")? {
        ctx.env
            .input
            .set_clipboard(&text)
            .map_err(|e| driver_failure("clipboard write", e))?;
    }
    ctx.env
        .input
        .paste()
        .map_err(|e| driver_failure("paste", e))?;
    Ok(ExecutionOutcome::Done)
}

// ============================================================================
// WaitForReference
// ============================================================================

pub(super) fn validate_wait_for_reference(
    params: &Parameters,
    reference: Option<ReferenceKind>,
) -> StepResult<()> {
    params.seconds("timeout")?;
    interval(params)?;
    params.confidence("confidence")?;
    params.region("region")?;
    require_reference(
        reference,
        &[
            ReferenceKind::Image,
            ReferenceKind::MarkupSnippet,
            ReferenceKind::Text,
            ReferenceKind::Coordinate,
        ],
        "an Image, Text, CSS/HTML or Coordinates",
    )
}

pub(super) fn wait_for_reference(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let timeout = ctx.params.seconds("timeout")?.unwrap_or(ctx.settings.wait_timeout);
    let poll = Poll::new(timeout, interval(ctx.params)?.unwrap_or(ctx.settings.poll_interval));
    let cancel = ctx.cancel;
    let reference = ctx.reference;

    match reference {
        None => Err(missing("an Image, Text, CSS/HTML or Coordinates")),
        Some(ResolvedReference::Video { .. }) => Err(StepError::invalid(
            "reference",
            "a Video reference cannot be waited for",
        )),
        Some(ResolvedReference::Coordinates(points)) => {
            let at = points.first().copied().ok_or_else(|| missing("a Coordinates"))?;
            ctx.threaded.anchor = Some(at);
            Ok(ExecutionOutcome::Pointer { at })
        }
        Some(ResolvedReference::Image { path }) => {
            let template = Template::load(path)?;
            let threshold = confidence_threshold(ctx)?;
            let region = ctx.params.region("region")?;
            debug!(timeout_ms = timeout.as_millis() as u64, threshold, "waiting for image");
            match poll.run(cancel, || match_once(ctx, &template, region, threshold))? {
                PollOutcome::Found(result) => {
                    ctx.threaded.anchor = Some(result.center);
                    Ok(ExecutionOutcome::Matched { result })
                }
                PollOutcome::TimedOut { elapsed, best } => Err(StepError::MatchTimeout { elapsed, best }),
            }
        }
        Some(ResolvedReference::Markup(needle)) | Some(ResolvedReference::Text(needle)) => {
            let needle = needle.trim();
            let outcome = poll.run(cancel, || {
                let present = ctx
                    .env
                    .page
                    .contains(needle)
                    .map_err(|e| driver_failure("page lookup", e))?;
                Ok(if present {
                    Attempt::Found(())
                } else {
                    Attempt::Missed { score: None }
                })
            })?;
            match outcome {
                PollOutcome::Found(()) => Ok(ExecutionOutcome::Done),
                PollOutcome::TimedOut { elapsed, best } => Err(StepError::MatchTimeout { elapsed, best }),
            }
        }
    }
}

// ============================================================================
// RunScript
// ============================================================================

pub(super) fn validate_run_script(params: &Parameters, reference: Option<ReferenceKind>) -> StepResult<()> {
    let script = params.str("script")?;
    accept_reference(reference, TEXT_KINDS)?;
    if script.is_none() && reference.is_none() {
        return Err(StepError::invalid("script", "is required"));
    }
    Ok(())
}

pub(super) fn run_script(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let source = text_source(ctx, "script")?
        .ok_or_else(|| StepError::invalid("script", "is required"))?;
    let value = ctx
        .env
        .page
        .run_script(&source)
        .map_err(|e| StepError::ScriptError { message: e.0 })?;
    Ok(ExecutionOutcome::Script { value })
}

// ============================================================================
// SelectorClick / PathClick
// ============================================================================

fn validate_query(key: &str, params: &Parameters, reference: Option<ReferenceKind>) -> StepResult<()> {
    params.seconds("timeout")?;
    let query = params.str(key)?;
    match (query, reference) {
        (Some(q), _) if q.trim().is_empty() => Err(StepError::invalid(key, "must not be empty")),
        (Some(_), reference) => accept_reference(reference, TEXT_KINDS),
        (None, reference) => require_reference(reference, TEXT_KINDS, "a CSS/HTML or Text"),
    }
}

pub(super) fn validate_selector_click(params: &Parameters, reference: Option<ReferenceKind>) -> StepResult<()> {
    validate_query("selector", params, reference)
}

pub(super) fn validate_path_click(params: &Parameters, reference: Option<ReferenceKind>) -> StepResult<()> {
    validate_query("xpath", params, reference)
}

fn element_click(
    ctx: &mut StepContext<'_>,
    key: &str,
    make: fn(String) -> ElementQuery,
) -> StepResult<ExecutionOutcome> {
    let query = match text_source(ctx, key)? {
        Some(q) if !q.trim().is_empty() => make(q.trim().to_string()),
        Some(_) => return Err(StepError::invalid(key, "must not be empty")),
        None => return Err(missing("a CSS/HTML or Text")),
    };
    let timeout = ctx.params.seconds("timeout")?.unwrap_or(ctx.settings.element_timeout);
    let poll = Poll::new(timeout, ctx.settings.poll_interval);
    let cancel = ctx.cancel;

    let outcome = poll.run(cancel, || {
        let found = ctx
            .env
            .page
            .find_element(&query)
            .map_err(|e| driver_failure("element lookup", e))?;
        Ok(if found {
            Attempt::Found(())
        } else {
            Attempt::Missed { score: None }
        })
    })?;
    if let PollOutcome::TimedOut { .. } = outcome {
        return Err(StepError::ElementNotFound {
            query: query.to_string(),
            timeout,
        });
    }

    ctx.env
        .page
        .click_element(&query)
        .map_err(|e| driver_failure("element click", e))?;
    Ok(ExecutionOutcome::ElementClicked {
        query: query.to_string(),
    })
}

pub(super) fn selector_click(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    element_click(ctx, "selector", ElementQuery::Css)
}

pub(super) fn path_click(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    element_click(ctx, "xpath", ElementQuery::XPath)
}

// ============================================================================
// LoadReferencePoint
// ============================================================================

fn point_index(params: &Parameters) -> StepResult<usize> {
    match params.i64("index")? {
        None => Ok(0),
        Some(i) => usize::try_from(i).map_err(|_| StepError::invalid("index", "must not be negative")),
    }
}

pub(super) fn validate_load_reference_point(
    params: &Parameters,
    reference: Option<ReferenceKind>,
) -> StepResult<()> {
    point_index(params)?;
    require_reference(reference, &[ReferenceKind::Coordinate], "a Coordinates")
}

pub(super) fn load_reference_point(ctx: &mut StepContext<'_>) -> StepResult<ExecutionOutcome> {
    let index = point_index(ctx.params)?;
    let reference = ctx.reference;
    let points = match reference {
        Some(ResolvedReference::Coordinates(points)) => points,
        Some(other) => {
            return Err(StepError::invalid(
                "reference",
                format!("{} reference is not usable here", other.kind()),
            ));
        }
        None => return Err(missing("a Coordinates")),
    };
    let at = *points.get(index).ok_or_else(|| {
        StepError::invalid("index", format!("{} is out of range for {} points", index, points.len()))
    })?;
    ctx.threaded.anchor = Some(at);
    Ok(ExecutionOutcome::Pointer { at })
}
