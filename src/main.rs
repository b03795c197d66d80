use clap::{Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use macroflow::config::{self, DEFAULT_MOCK_HEIGHT, DEFAULT_MOCK_WIDTH};
use macroflow::screen::{ImageFileScreen, MockFramebuffer, Region, ScreenSource, Template, best_match};
use macroflow::{
    DEFAULT_MACRO_FILE, EffectLog, Environment, ErrorKind, MacroStore, MacroRunner, NoFocus, RecordingInput,
    ReferenceResolver, RunProgress, RunReport, RunSettings, Session, StaticPage, validate_step,
};

/// macroflow - replay recorded automation macros
#[derive(Parser, Debug)]
#[command(
    name = "macroflow",
    version,
    about = "Replay recorded desktop/web automation macros with image-based targeting",
    after_help = "ENVIRONMENT VARIABLES:\n\
        MACROFLOW_CONFIDENCE            Default match threshold (0-1)\n\
        MACROFLOW_POLL_INTERVAL_MS      Polling interval for wait actions (ms)\n\
        MACROFLOW_WAIT_TIMEOUT_SECS     Default WaitForReference timeout\n\
        MACROFLOW_ELEMENT_TIMEOUT_SECS  Default selector/XPath element timeout\n\
        MACROFLOW_REFERENCE_DIR         Base directory for relative reference paths\n\
        MACROFLOW_SESSION_DIR           Base directory for run sessions\n\
        MACROFLOW_LOG                   Log filter (falls back to RUST_LOG)\n\
        \n\
        EXIT CODES:\n\
        0   run completed\n\
        1   I/O failure outside the run\n\
        2   malformed input (macro file or arguments)\n\
        10+ run failed; 10 + error kind (ReferenceNotFound=10 ... ExecutionError=19)"
)]
struct Args {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a macro file from its first step
    Run {
        /// Macro file to run
        #[arg(default_value = DEFAULT_MACRO_FILE)]
        macro_file: PathBuf,

        /// Screenshot file used as the screen (re-read on every capture)
        #[arg(long)]
        screen: Option<PathBuf>,

        /// HTML file used as the page for selector, XPath and script actions
        #[arg(long)]
        page: Option<PathBuf>,

        /// Base directory for relative reference paths (default: the macro file's directory)
        #[arg(long, env = "MACROFLOW_REFERENCE_DIR")]
        reference_dir: Option<PathBuf>,

        /// Default match threshold (0-1)
        #[arg(short, long)]
        confidence: Option<f64>,

        /// Polling interval for wait actions (ms)
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Default WaitForReference timeout (seconds)
        #[arg(long)]
        wait_timeout: Option<f64>,

        /// Cancel the run after this many seconds (checked between steps)
        #[arg(long)]
        max_duration: Option<f64>,

        /// Window title to focus before the first step
        #[arg(long)]
        focus: Option<String>,

        /// Output directory for the report and failure capture (kept)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep the session directory after completion
        #[arg(long, short = 'k')]
        keep: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a macro and validate every step without running it
    Check {
        /// Macro file to check
        #[arg(default_value = DEFAULT_MACRO_FILE)]
        macro_file: PathBuf,

        /// Base directory for relative reference paths (default: the macro file's directory)
        #[arg(long, env = "MACROFLOW_REFERENCE_DIR")]
        reference_dir: Option<PathBuf>,
    },

    /// Locate a template image in a screenshot
    Locate {
        /// Template image
        #[arg(short, long)]
        template: PathBuf,

        /// Screenshot to search
        #[arg(short, long)]
        screen: PathBuf,

        /// Match threshold (0-1)
        #[arg(short, long)]
        confidence: Option<f64>,

        /// Search region as x,y,width,height
        #[arg(long)]
        region: Option<String>,
    },

    /// Create a mock screenshot (and optionally a matching template) for testing
    Mock {
        /// Width in pixels
        #[arg(short = 'W', long, default_value_t = DEFAULT_MOCK_WIDTH)]
        width: u32,

        /// Height in pixels
        #[arg(short = 'H', long, default_value_t = DEFAULT_MOCK_HEIGHT)]
        height: u32,

        /// Output file path
        #[arg(short, long, default_value = "./mock_screen.png")]
        output: PathBuf,

        /// Fill color as hex (e.g., "ff0000" for red)
        #[arg(short, long, default_value = "000000")]
        color: String,

        /// Also write the drawn button as a template image
        #[arg(long)]
        template: Option<PathBuf>,
    },
}

/// Failure outside a run, mapped to exit codes 1 and 2
enum CliError {
    /// Malformed input: bad macro file or argument values
    Input(String),
    Other(Box<dyn Error>),
}

impl<E: Error + 'static> From<E> for CliError {
    fn from(err: E) -> Self {
        CliError::Other(Box::new(err))
    }
}

type CliResult<T> = Result<T, CliError>;

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let result = match args.command {
        Some(command) => execute(command),
        None => {
            println!("macroflow - replay recorded automation macros");
            println!();
            println!("Usage: macroflow <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run     Run a macro file from its first step");
            println!("  check   Validate a macro without running it");
            println!("  locate  Locate a template image in a screenshot");
            println!("  mock    Create a mock screenshot for testing");
            println!();
            println!("Run with --help for more information.");
            Ok(0)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(CliError::Input(message)) => {
            eprintln!("error: {}", message);
            ExitCode::from(2)
        }
        Err(CliError::Other(err)) => {
            eprintln!("error: {}", err);
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        config::log_filter()
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(config::DEFAULT_LOG_FILTER))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn execute(command: Commands) -> CliResult<u8> {
    match command {
        Commands::Run {
            macro_file,
            screen,
            page,
            reference_dir,
            confidence,
            poll_interval_ms,
            wait_timeout,
            max_duration,
            focus,
            output,
            keep,
            json,
        } => {
            let store = MacroStore::new(&macro_file);
            let steps = store
                .load()
                .map_err(|e| CliError::Input(format!("{}: {}", macro_file.display(), e)))?;

            let mut settings = RunSettings::default();
            if let Some(c) = confidence {
                settings = settings.confidence(check_confidence(c)?);
            }
            if let Some(ms) = poll_interval_ms {
                if ms == 0 {
                    return Err(CliError::Input("--poll-interval-ms must be positive".into()));
                }
                settings = settings.poll_interval(Duration::from_millis(ms));
            }
            if let Some(secs) = wait_timeout {
                settings = settings.wait_timeout(check_seconds("--wait-timeout", secs)?);
            }
            if let Some(title) = focus {
                settings = settings.focus_window(title);
            }
            let max_duration = max_duration
                .map(|secs| check_seconds("--max-duration", secs))
                .transpose()?;

            let base_dir = reference_dir.unwrap_or_else(|| store.base_dir());
            let resolver = ReferenceResolver::with_base_dir(base_dir);

            let log = EffectLog::new();
            let page_source = match &page {
                Some(path) => fs::read_to_string(path)
                    .map_err(|e| CliError::Input(format!("{}: {}", path.display(), e)))?,
                None => String::new(),
            };
            let mut env = Environment::new(
                open_screen(screen.as_deref())?,
                Box::new(RecordingInput::new(log.clone())),
                Box::new(StaticPage::new(log.clone()).with_source(page_source)),
                Box::new(NoFocus::new(log.clone())),
            );

            let kept = keep || output.is_some();
            let session = match &output {
                Some(dir) => Session::in_dir(dir).keep(true),
                None => Session::with_name(&file_stem(&macro_file)).keep(keep),
            }
            .for_macro(&macro_file);
            session.init()?;

            let mut runner = MacroRunner::new(settings, resolver);
            if let Some(limit) = max_duration {
                let cancel = runner.cancel_token();
                thread::spawn(move || {
                    thread::sleep(limit);
                    warn!(limit_secs = limit.as_secs_f64(), "maximum run duration reached; cancelling");
                    cancel.cancel();
                });
            }

            info!(path = %macro_file.display(), steps = steps.len(), "running macro");
            let report = runner.run_with_progress(steps.steps(), &mut env, |event, _| {
                if !json {
                    print_progress(event);
                }
            });

            if let Some(failure) = &report.failure {
                if let Some(frame) = runner.last_frame() {
                    match session.save_failure_capture(failure.step_index, frame) {
                        Ok(path) => info!(path = %path.display(), "saved failure capture"),
                        Err(e) => warn!("could not save failure capture: {}", e),
                    }
                }
            }
            let report_path = session.save_report(&report)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
                let effects = log.snapshot();
                if !effects.is_empty() {
                    println!("\nEffects ({}):", effects.len());
                    for effect in &effects {
                        println!("  {}", serde_json::to_string(effect)?);
                    }
                }
                if kept {
                    println!("\nReport: {}", report_path.display());
                }
            }

            Ok(exit_byte(report.exit_code()))
        }

        Commands::Check {
            macro_file,
            reference_dir,
        } => {
            let store = MacroStore::new(&macro_file);
            let steps = store
                .load()
                .map_err(|e| CliError::Input(format!("{}: {}", macro_file.display(), e)))?;
            let resolver = ReferenceResolver::with_base_dir(reference_dir.unwrap_or_else(|| store.base_dir()));

            let mut problems = 0;
            for (index, step) in steps.steps().iter().enumerate() {
                let verdict = validate_step(step).and_then(|_| {
                    step.reference
                        .as_ref()
                        .map(|r| resolver.resolve(r).map(|_| ()))
                        .unwrap_or(Ok(()))
                });
                match verdict {
                    Ok(()) => println!("  [{}] {:<20} ok", index, step.action),
                    Err(e) => {
                        problems += 1;
                        println!("  [{}] {:<20} {}: {}", index, step.action, e.kind(), e);
                    }
                }
            }

            if problems == 0 {
                println!("{}: {} steps, all valid", macro_file.display(), steps.len());
                Ok(0)
            } else {
                println!("{}: {} of {} steps invalid", macro_file.display(), problems, steps.len());
                Ok(2)
            }
        }

        Commands::Locate {
            template,
            screen,
            confidence,
            region,
        } => {
            let threshold = match confidence {
                Some(c) => check_confidence(c)?,
                None => config::default_confidence(),
            };
            let region = region.as_deref().map(parse_region).transpose()?;
            let template = match Template::load(&template) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return Ok(exit_byte(e.kind().exit_code()));
                }
            };
            let frame = image::open(&screen)
                .map_err(|e| CliError::Input(format!("{}: {}", screen.display(), e)))?
                .to_rgb8();

            match best_match(&template, &frame, region) {
                Some(found) if found.confidence >= threshold => {
                    println!("{}", serde_json::to_string_pretty(&found)?);
                    Ok(0)
                }
                Some(found) => {
                    println!(
                        "no match at confidence {:.2} (best {:.3} at {},{})",
                        threshold, found.confidence, found.region.x, found.region.y
                    );
                    Ok(exit_byte(ErrorKind::MatchNotFound.exit_code()))
                }
                None => {
                    println!("template does not fit in the search area");
                    Ok(exit_byte(ErrorKind::MatchNotFound.exit_code()))
                }
            }
        }

        Commands::Mock {
            width,
            height,
            output,
            color,
            template,
        } => {
            let color_bytes = parse_hex_color(&color)?;
            let mut fb = MockFramebuffer::try_with_color(width, height, color_bytes)
                .map_err(|e| CliError::Input(e.to_string()))?;

            // Sample content: a caption and a labelled button
            fb.draw_text(10, 10, "Mock Screen", [255, 255, 255], color_bytes);
            fb.draw_rect(40, 60, 120, 40, [40, 90, 200]);
            fb.draw_text(56, 76, "Submit", [255, 255, 255], [40, 90, 200]);
            fb.save_png(&output)?;

            println!("Created mock screen: {}", output.display());
            println!("  Size: {}x{}", fb.width(), fb.height());

            if let Some(path) = template {
                fb.crop(40, 60, 120, 40).save_png(&path)?;
                println!("Created template: {} (button at 40,60 120x40)", path.display());
            }
            Ok(0)
        }
    }
}

fn open_screen(path: Option<&Path>) -> CliResult<Box<dyn ScreenSource>> {
    if let Some(path) = path {
        let screen = ImageFileScreen::open(path)
            .map_err(|e| CliError::Input(format!("{}: {}", path.display(), e)))?;
        return Ok(Box::new(screen));
    }
    live_or_blank_screen()
}

#[cfg(feature = "live-screen")]
fn live_or_blank_screen() -> CliResult<Box<dyn ScreenSource>> {
    Ok(Box::new(macroflow::screen::LiveScreen::primary()?))
}

#[cfg(not(feature = "live-screen"))]
fn live_or_blank_screen() -> CliResult<Box<dyn ScreenSource>> {
    warn!("no --screen given and live capture is not compiled in; using a blank screen");
    Ok(Box::new(MockFramebuffer::new(DEFAULT_MOCK_WIDTH, DEFAULT_MOCK_HEIGHT)))
}

fn print_progress(event: &RunProgress) {
    match event {
        RunProgress::Started { total } => println!("Running {} steps", total),
        RunProgress::StepSucceeded { index, action, elapsed } => {
            println!("  [{}] {:<20} ok ({} ms)", index, action, elapsed.as_millis())
        }
        RunProgress::StepFailed { index, action, kind } => {
            println!("  [{}] {:<20} FAILED ({})", index, action, kind)
        }
        RunProgress::StepStarted { .. } | RunProgress::Finished { .. } => {}
    }
}

fn print_report(report: &RunReport) {
    println!();
    match &report.failure {
        None => println!(
            "Run {:?}: {} steps in {} ms",
            report.status,
            report.steps.len(),
            report.total_elapsed_ms
        ),
        Some(failure) => {
            println!(
                "Run {:?} at step {} ({}): {}",
                report.status, failure.step_index, failure.action, failure.error_kind
            );
            println!("  {}", failure.message);
            if let Some(best) = failure.best_confidence {
                println!("  Best confidence: {:.3}", best);
            }
            if let Some(waited) = failure.waited_ms {
                println!("  Waited: {} ms", waited);
            }
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "run".to_string())
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn check_confidence(value: f64) -> CliResult<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(CliError::Input(format!("confidence must be between 0 and 1, got {}", value)))
    }
}

fn check_seconds(flag: &str, value: f64) -> CliResult<Duration> {
    let invalid = || CliError::Input(format!("{} must be a non-negative number of seconds", flag));
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(value).map_err(|_| invalid())
}

/// Parse `x,y,width,height`
fn parse_region(value: &str) -> CliResult<Region> {
    let parts: Vec<u32> = value
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| CliError::Input(format!("invalid region '{}'", value)))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(Region::new(*x, *y, *w, *h)),
        _ => Err(CliError::Input(format!("region must be x,y,width,height, got '{}'", value))),
    }
}

fn parse_hex_color(hex: &str) -> CliResult<[u8; 3]> {
    let hex = hex.trim_start_matches('#');
    let invalid = || CliError::Input("Color must be 6 hex digits (e.g., 'ff0000')".into());
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(invalid());
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).map_err(|_| invalid());
    Ok([channel(0..2)?, channel(2..4)?, channel(4..6)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_seconds_rejects_out_of_range_values() {
        assert!(matches!(check_seconds("--wait-timeout", 1.5), Ok(d) if d == Duration::from_millis(1500)));
        for value in [-1.0, f64::NAN, f64::INFINITY, 1e20, 1e300] {
            let err = check_seconds("--max-duration", value).unwrap_err();
            assert!(matches!(err, CliError::Input(_)), "{}", value);
        }
    }
}
