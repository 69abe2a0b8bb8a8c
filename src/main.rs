//! Frame Pilot CLI - desktop entry point
//!
//! Validates step graphs, scores patterns against screenshots, and replays
//! a graph over a directory of recorded frames without a device.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use frame_pilot::config::Settings;
use frame_pilot::engine::{RunController, RunStatus, StepGraph};
use frame_pilot::ports::{ActionPort, DryRunPort, ReplaySource};
use frame_pilot::stealth::HumanizedPort;
use frame_pilot::vision::{Frame, Matcher, PatternLibrary};

const SAMPLE_GRAPH: &str = include_str!("../demos/daily_commission.json");

#[derive(Debug, Parser)]
#[command(
    name = "pilot",
    about = "Screen-driven automation engine: validate, match and replay step graphs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check a step graph against the pattern library.
    Validate(ValidateArgs),

    /// Score patterns against a screenshot.
    Match(MatchArgs),

    /// Replay a step graph over recorded screenshots.
    Run(RunArgs),

    /// Print the bundled example step graph.
    Sample,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Settings file (JSON); defaults apply when omitted
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Pattern directory, overriding the settings file
    #[arg(long)]
    patterns: Option<PathBuf>,
}

impl CommonArgs {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.settings {
            Some(path) => Settings::load(path)
                .with_context(|| format!("loading settings from {}", path.display()))?,
            None => Settings::default(),
        };
        if let Some(dir) = &self.patterns {
            settings.patterns.directory = dir.clone();
        }
        Ok(settings)
    }
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// Step graph definition (JSON)
    graph: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct MatchArgs {
    /// Screenshot to score against
    screenshot: PathBuf,

    /// Patterns to score; every loaded pattern when omitted
    names: Vec<String>,

    /// Minimum confidence reported as a match
    #[arg(long)]
    threshold: Option<f32>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Step graph definition (JSON)
    graph: PathBuf,

    /// Directory of screenshots served in file-name order
    #[arg(long)]
    frames: PathBuf,

    /// Start over from the first screenshot after the last one
    #[arg(long)]
    cycle: bool,

    /// Apply input humanization to the logged gestures
    #[arg(long)]
    humanize: bool,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate(args) => validate(args),
        Commands::Match(args) => score(args),
        Commands::Run(args) => replay(args),
        Commands::Sample => {
            println!("{SAMPLE_GRAPH}");
            Ok(())
        }
    }
}

fn load_library(settings: &Settings) -> Result<PatternLibrary> {
    let dir = &settings.patterns.directory;
    PatternLibrary::load_with_extensions(dir, &settings.patterns.extension_refs())
        .with_context(|| format!("loading patterns from {}", dir.display()))
}

fn load_graph(path: &Path) -> Result<StepGraph> {
    StepGraph::load(path).with_context(|| format!("reading step graph {}", path.display()))
}

fn validate(args: ValidateArgs) -> Result<()> {
    let settings = args.common.settings()?;
    let graph = load_graph(&args.graph)?;
    let library = load_library(&settings)?;

    graph.validate(&library)?;

    println!(
        "{}: {} steps, {} patterns required, all present",
        graph.name.as_deref().unwrap_or("step graph"),
        graph.steps.len(),
        graph.required_patterns().len()
    );
    Ok(())
}

fn score(args: MatchArgs) -> Result<()> {
    let settings = args.common.settings()?;
    let library = load_library(&settings)?;
    let threshold = args.threshold.unwrap_or(settings.engine.default_threshold);

    let image = image::open(&args.screenshot)
        .with_context(|| format!("opening {}", args.screenshot.display()))?;
    let frame = Frame::new(image.to_rgb8());

    let names: Vec<String> = if args.names.is_empty() {
        library.names().map(str::to_string).collect()
    } else {
        args.names
    };

    let matcher = Matcher::new(&library);
    for name in &names {
        let result = matcher.score(&frame, name)?;
        let verdict = if result.confidence > threshold {
            "match"
        } else {
            "-"
        };
        println!(
            "{:<24} {:.3}  {:<5} at {}",
            name, result.confidence, verdict, result.center
        );
    }

    if let Some(best) = matcher.match_best_of(&frame, names.as_slice(), threshold)? {
        println!("best: {} ({:.3})", best.pattern_name, best.confidence);
    }
    Ok(())
}

fn replay(args: RunArgs) -> Result<()> {
    let settings = args.common.settings()?;
    let graph = load_graph(&args.graph)?;
    let library = load_library(&settings)?;

    let mut source = ReplaySource::from_dir(&args.frames, &settings.patterns.extension_refs())
        .with_context(|| format!("reading frames from {}", args.frames.display()))?;
    if source.is_empty() {
        bail!("no screenshots found in {}", args.frames.display());
    }
    if args.cycle {
        source = source.cycling();
    }

    let dry_run = Arc::new(DryRunPort::new());
    let port: Arc<dyn ActionPort> = if args.humanize {
        Arc::new(HumanizedPort::new(dry_run.clone(), settings.stealth.clone()))
    } else {
        dry_run.clone()
    };

    let controller = RunController::new(
        Arc::new(library),
        Arc::new(source),
        port,
        settings.engine.clone(),
    );
    let handle = controller.start(graph)?;
    handle.join();

    let state = handle.status();
    println!("{}", serde_json::to_string_pretty(&state)?);
    println!(
        "{} taps, {} swipes",
        dry_run.tap_count(),
        dry_run.swipe_count()
    );

    match state.status {
        RunStatus::Completed => Ok(()),
        status => bail!(
            "run ended {:?}{}",
            status,
            state
                .failure
                .map(|f| format!(": {}", f.code()))
                .unwrap_or_default()
        ),
    }
}
