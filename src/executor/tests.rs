use super::*;
use crate::config::Config;
use crate::environment::{DriverError, DriverResult, Effect, EffectLog, ElementQuery, MouseButton, PageDriver, StaticPage};
use crate::error::{ErrorKind, StepError};
use crate::screen::{MockFramebuffer, Region};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use url::Url;

const BUTTON: Region = Region {
    x: 20,
    y: 16,
    width: 16,
    height: 12,
};

/// 64x48 black screen with a red button labelled "A"
fn button_screen() -> MockFramebuffer {
    let mut fb = MockFramebuffer::new(64, 48);
    fb.draw_rect(BUTTON.x, BUTTON.y, BUTTON.width, BUTTON.height, [200, 40, 40]);
    fb.draw_text(24, 18, "A", [255, 255, 255], [200, 40, 40]);
    fb
}

fn save_button_template(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("button.png");
    button_screen()
        .crop(BUTTON.x, BUTTON.y, BUTTON.width, BUTTON.height)
        .save_png(&path)
        .unwrap();
    path
}

struct Harness {
    log: EffectLog,
    env: Environment,
    executor: ActionExecutor,
    cancel: CancelToken,
}

impl Harness {
    fn new(screen: MockFramebuffer) -> Self {
        let log = EffectLog::new();
        let settings = RunSettings::from_config(&Config::defaults())
            .poll_interval(Duration::from_millis(10))
            .element_timeout(Duration::from_millis(50));
        Self {
            env: Environment::headless(screen, &log),
            log,
            executor: ActionExecutor::new(settings),
            cancel: CancelToken::new(),
        }
    }

    fn with_page(mut self, page: impl PageDriver + 'static) -> Self {
        self.env = self.env.with_page(page);
        self
    }

    fn run(&mut self, step: &MacroStep, reference: Option<&ResolvedReference>) -> StepResult<ExecutionOutcome> {
        self.executor.execute(step, reference, &mut self.env, &self.cancel)
    }
}

/// Page whose scripts always throw
struct ThrowingPage;

impl PageDriver for ThrowingPage {
    fn open(&mut self, _: &Url) -> DriverResult<()> {
        Ok(())
    }

    fn run_script(&mut self, _: &str) -> DriverResult<serde_json::Value> {
        Err(DriverError::new("ReferenceError: foo is not defined"))
    }

    fn find_element(&mut self, _: &ElementQuery) -> DriverResult<bool> {
        Ok(false)
    }

    fn click_element(&mut self, _: &ElementQuery) -> DriverResult<()> {
        Err(DriverError::new("no element"))
    }

    fn contains(&mut self, _: &str) -> DriverResult<bool> {
        Ok(false)
    }
}

#[test]
fn test_dispatch_table_matches_action_order() {
    for kind in ActionKind::all() {
        assert_eq!(entry(kind).kind, kind);
    }
}

#[test]
fn test_click_reference_clicks_match_center() {
    let dir = tempfile::tempdir().unwrap();
    let template = save_button_template(dir.path());
    let mut h = Harness::new(button_screen());
    let step = MacroStep::new(ActionKind::ClickReference).with_param("confidence", 0.9);

    let outcome = h.run(&step, Some(&ResolvedReference::Image { path: template })).unwrap();

    let center = BUTTON.center();
    match outcome {
        ExecutionOutcome::Matched { result } => {
            assert_eq!(result.region, BUTTON);
            assert!(result.confidence > 0.999);
        }
        other => panic!("expected a match, got {:?}", other),
    }
    assert_eq!(
        h.log.snapshot(),
        vec![Effect::Click {
            at: center,
            button: MouseButton::Left,
            count: 1
        }]
    );
    assert_eq!(h.executor.anchor(), Some(center));
}

#[test]
fn test_click_reference_without_reference() {
    let mut h = Harness::new(button_screen());
    let err = h.run(&MacroStep::new(ActionKind::ClickReference), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingReference);
    assert!(h.log.is_empty());
}

#[test]
fn test_click_reference_reports_best_score_on_miss() {
    let dir = tempfile::tempdir().unwrap();
    let template = save_button_template(dir.path());
    let mut h = Harness::new(MockFramebuffer::new(64, 48));

    let err = h
        .run(
            &MacroStep::new(ActionKind::ClickReference),
            Some(&ResolvedReference::Image { path: template }),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MatchNotFound);
    assert_eq!(err.best_confidence(), Some(0.0));
    assert!(h.executor.last_frame().is_some());
    assert!(h.log.is_empty());
}

#[test]
fn test_type_text_accepts_empty_string() {
    let mut h = Harness::new(button_screen());
    h.run(&MacroStep::new(ActionKind::TypeText).with_param("text", ""), None)
        .unwrap();
    assert_eq!(h.log.snapshot(), vec![Effect::TypeText { text: String::new() }]);

    let err = h.run(&MacroStep::new(ActionKind::TypeText), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_wait_validates_seconds() {
    let mut h = Harness::new(button_screen());
    for bad in [json!(-0.5), json!("soon"), json!(null)] {
        let step = MacroStep::new(ActionKind::Wait).with_param("seconds", bad);
        assert_eq!(h.run(&step, None).unwrap_err().kind(), ErrorKind::InvalidParameter);
    }

    let start = Instant::now();
    let outcome = h
        .run(&MacroStep::new(ActionKind::Wait).with_param("seconds", "0.05"), None)
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(matches!(outcome, ExecutionOutcome::Waited { seconds } if (seconds - 0.05).abs() < 1e-9));
}

#[test]
fn test_pointer_actions_thread_the_anchor() {
    let mut h = Harness::new(button_screen());

    let err = h.run(&MacroStep::new(ActionKind::MoveMouse), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let points = ResolvedReference::Coordinates(vec![Point::new(1, 2), Point::new(30, 40)]);
    h.run(
        &MacroStep::new(ActionKind::LoadReferencePoint).with_param("index", 1),
        Some(&points),
    )
    .unwrap();
    assert_eq!(h.executor.anchor(), Some(Point::new(30, 40)));

    h.run(&MacroStep::new(ActionKind::DoubleClick), None).unwrap();
    h.run(
        &MacroStep::new(ActionKind::RightClick).with_param("x", 5).with_param("y", 6),
        None,
    )
    .unwrap();

    assert_eq!(
        h.log.snapshot(),
        vec![
            Effect::Click {
                at: Point::new(30, 40),
                button: MouseButton::Left,
                count: 2
            },
            Effect::Click {
                at: Point::new(5, 6),
                button: MouseButton::Right,
                count: 1
            },
        ]
    );
    assert_eq!(h.executor.anchor(), Some(Point::new(5, 6)));
}

#[test]
fn test_click_without_target_uses_cursor() {
    let mut h = Harness::new(button_screen());
    let outcome = h.run(&MacroStep::new(ActionKind::Click), None).unwrap();
    assert_eq!(outcome, ExecutionOutcome::Done);
    assert!(matches!(h.log.snapshot()[0], Effect::Click { count: 1, .. }));
}

#[test]
fn test_half_a_coordinate_pair_is_invalid() {
    let step = MacroStep::new(ActionKind::Click).with_param("x", 10);
    assert_eq!(validate_step(&step).unwrap_err(), StepError::invalid("y", "is required when x is given"));
}

#[test]
fn test_load_reference_point_out_of_range() {
    let mut h = Harness::new(button_screen());
    let points = ResolvedReference::Coordinates(vec![Point::new(1, 2)]);
    let err = h
        .run(
            &MacroStep::new(ActionKind::LoadReferencePoint).with_param("index", 3),
            Some(&points),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_copy_and_paste_text() {
    let mut h = Harness::new(button_screen());
    let snippet = ResolvedReference::Text("from file".to_string());

    let copied = h.run(&MacroStep::new(ActionKind::CopyText), Some(&snippet)).unwrap();
    assert_eq!(copied, ExecutionOutcome::Copied { text: "from file".into() });
    h.run(&MacroStep::new(ActionKind::PasteText), None).unwrap();

    assert_eq!(
        h.log.snapshot(),
        vec![
            Effect::SetClipboard { text: "from file".into() },
            Effect::Paste { text: "from file".into() },
        ]
    );
}

#[test]
fn test_wait_for_reference_kinds() {
    let mut h = Harness::new(button_screen())
        .with_page(StaticPage::new(EffectLog::new()).with_source("<h1>Welcome back</h1>"));
    let step = MacroStep::new(ActionKind::WaitForReference).with_param("timeout", 0.05);

    let video = ResolvedReference::Video { path: PathBuf::from("clip.mp4") };
    assert_eq!(h.run(&step, Some(&video)).unwrap_err().kind(), ErrorKind::InvalidParameter);

    let coords = ResolvedReference::Coordinates(vec![Point::new(9, 9)]);
    assert_eq!(
        h.run(&step, Some(&coords)).unwrap(),
        ExecutionOutcome::Pointer { at: Point::new(9, 9) }
    );

    let present = ResolvedReference::Text("Welcome back".into());
    assert_eq!(h.run(&step, Some(&present)).unwrap(), ExecutionOutcome::Done);

    let absent = ResolvedReference::Markup("<form id=\"login\">".into());
    assert_eq!(h.run(&step, Some(&absent)).unwrap_err().kind(), ErrorKind::MatchTimeout);
}

#[test]
fn test_wait_for_reference_finds_image() {
    let dir = tempfile::tempdir().unwrap();
    let template = save_button_template(dir.path());
    let mut h = Harness::new(button_screen());
    let step = MacroStep::new(ActionKind::WaitForReference)
        .with_param("timeout", 1)
        .with_param("region", json!({"x": 10, "y": 10, "width": 40, "height": 30}));

    let outcome = h.run(&step, Some(&ResolvedReference::Image { path: template })).unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Matched { result } if result.region == BUTTON));
    assert_eq!(h.executor.anchor(), Some(BUTTON.center()));
    assert!(h.log.is_empty());
}

#[test]
fn test_wait_for_reference_timeout_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let template = save_button_template(dir.path());
    let mut h = Harness::new(MockFramebuffer::new(64, 48));
    let timeout = Duration::from_millis(200);
    let interval = Duration::from_millis(50);
    let step = MacroStep::new(ActionKind::WaitForReference)
        .with_param("timeout", 0.2)
        .with_param("interval", 0.05);

    let start = Instant::now();
    let err = h
        .run(&step, Some(&ResolvedReference::Image { path: template }))
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.kind(), ErrorKind::MatchTimeout);
    assert!(elapsed >= timeout, "took {:?}", elapsed);
    assert!(elapsed < timeout + interval, "took {:?}", elapsed);
    assert_eq!(err.best_confidence(), Some(0.0));
}

#[test]
fn test_wait_for_reference_timeout_bounds_on_full_hd_screen() {
    let mut screen = MockFramebuffer::new(1920, 1080);
    for cy in 0..68u32 {
        for cx in 0..120u32 {
            let h = cx.wrapping_mul(2_654_435_761) ^ cy.wrapping_mul(40_503);
            screen.draw_rect(cx * 16, cy * 16, 16, 16, [h as u8, (h >> 8) as u8, (h >> 16) as u8]);
        }
    }
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("submit.png");
    let mut button = MockFramebuffer::with_color(100, 40, [40, 90, 200]);
    button.draw_text(26, 16, "Submit", [255, 255, 255], [40, 90, 200]);
    button.save_png(&template).unwrap();

    let mut h = Harness::new(screen);
    let timeout = Duration::from_millis(600);
    let interval = Duration::from_millis(100);
    let step = MacroStep::new(ActionKind::WaitForReference)
        .with_param("timeout", 0.6)
        .with_param("interval", 0.1);

    let start = Instant::now();
    let err = h
        .run(&step, Some(&ResolvedReference::Image { path: template }))
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.kind(), ErrorKind::MatchTimeout);
    assert!(elapsed >= timeout, "took {:?}", elapsed);
    assert!(elapsed < timeout + interval, "took {:?}", elapsed);
    assert!(h.executor.last_frame().is_some());
}

#[test]
fn test_oversized_durations_are_invalid_parameters() {
    let steps = [
        MacroStep::new(ActionKind::Wait).with_param("seconds", 1e20),
        MacroStep::new(ActionKind::WaitForReference)
            .with_reference(ReferenceKind::Image, "button.png")
            .with_param("timeout", 1e300),
        MacroStep::new(ActionKind::WaitForReference)
            .with_reference(ReferenceKind::Image, "button.png")
            .with_param("interval", 1e300),
        MacroStep::new(ActionKind::SelectorClick)
            .with_param("selector", "#go")
            .with_param("timeout", 1e20),
    ];
    for step in &steps {
        let err = validate_step(step).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter, "{:?}", step.action);
    }

    let mut h = Harness::new(button_screen());
    let err = h.run(&steps[0], None).unwrap_err();
    assert_eq!(err, StepError::invalid("seconds", "is too large"));

    let log = EffectLog::new();
    let mut env = Environment::headless(MockFramebuffer::new(8, 8), &log);
    let mut runner = crate::runner::MacroRunner::new(
        RunSettings::from_config(&Config::defaults()),
        crate::reference::ReferenceResolver::new(),
    );
    let report = runner.run(&steps[..1], &mut env);
    let failure = report.failure.unwrap();
    assert_eq!(failure.error_kind, ErrorKind::InvalidParameter);
    assert_eq!(failure.step_index, 0);
}

#[test]
fn test_run_script_failure_carries_message() {
    let mut h = Harness::new(button_screen()).with_page(ThrowingPage);
    let step = MacroStep::new(ActionKind::RunScript).with_param("script", "foo()");
    match h.run(&step, None) {
        Err(StepError::ScriptError { message }) => assert!(message.contains("foo is not defined")),
        other => panic!("expected ScriptError, got {:?}", other),
    }
}

#[test]
fn test_run_script_from_reference() {
    let mut h = Harness::new(button_screen());
    let script = ResolvedReference::Markup("document.title".into());
    let outcome = h.run(&MacroStep::new(ActionKind::RunScript), Some(&script)).unwrap();
    assert_eq!(outcome, ExecutionOutcome::Script { value: serde_json::Value::Null });
    assert_eq!(
        h.log.snapshot(),
        vec![Effect::RunScript { source: "document.title".into() }]
    );
}

#[test]
fn test_selector_and_path_clicks() {
    let mut h = Harness::new(button_screen())
        .with_page(StaticPage::new(EffectLog::new()).with_source("<button class=\"go\">Go</button>"));

    let found = h
        .run(&MacroStep::new(ActionKind::SelectorClick).with_param("selector", "class=\"go\""), None)
        .unwrap();
    assert_eq!(
        found,
        ExecutionOutcome::ElementClicked {
            query: "css:class=\"go\"".into()
        }
    );

    let start = Instant::now();
    let err = h
        .run(&MacroStep::new(ActionKind::PathClick).with_param("xpath", "//a[@id='x']"), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ElementNotFound);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_open_target_locators() {
    let mut h = Harness::new(button_screen());
    let err = h
        .run(&MacroStep::new(ActionKind::OpenTarget).with_param("url", "not a url"), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(
        validate_step(&MacroStep::new(ActionKind::OpenTarget).with_param("url", "ftp://host/x"))
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidParameter
    );

    let outcome = h
        .run(&MacroStep::new(ActionKind::OpenTarget).with_param("target", "https://example.com/login"), None)
        .unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Opened {
            target: "https://example.com/login".into()
        }
    );
}

#[test]
fn test_validation_checks_reference_kinds() {
    let needs_ref = MacroStep::new(ActionKind::WaitForReference);
    assert_eq!(validate_step(&needs_ref).unwrap_err().kind(), ErrorKind::MissingReference);

    let wrong = MacroStep::new(ActionKind::LoadReferencePoint).with_reference(ReferenceKind::Image, "a.png");
    assert_eq!(validate_step(&wrong).unwrap_err().kind(), ErrorKind::InvalidParameter);

    let selector = MacroStep::new(ActionKind::SelectorClick).with_param("selector", "#go");
    assert!(validate_step(&selector).is_ok());

    let from_file = MacroStep::new(ActionKind::PathClick).with_reference(ReferenceKind::MarkupSnippet, "q.txt");
    assert!(validate_step(&from_file).is_ok());
}
