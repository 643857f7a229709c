// ConvStream - main.rs
//
// Command-line entry point. Handles:
// 1. CLI argument parsing
// 2. Config loading (explicit --config file or the platform config dir)
// 3. Logging initialisation (debug mode support)
// 4. `watch`: run the engine, printing bus traffic as JSON lines
// 5. `analyze`: one-shot ingest of a directory, run analyzers, print/export

use convstream::app::service::{Engine, EngineConfig};
use convstream::core::export;
use convstream::core::filter::EventFilter;
use convstream::core::model::{EventType, TimeWindow};
use convstream::platform::config::{self, AppConfig, PlatformPaths};
use convstream::util::{self, error::{ConfigError, CoreError}};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// ConvStream - real-time ingestion and analytics for multi-agent
/// conversation logs.
///
/// Tails `conversations_*.jsonl` files, routes events over a topic bus, runs
/// statistical, temporal, behavioral and performance analyzers, and flags
/// anomalies.
#[derive(Parser, Debug)]
#[command(name = "convstream", version, about)]
struct Cli {
    /// Config file (defaults to config.toml in the platform config dir).
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (equivalent to RUST_LOG=debug).
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    /// Also write logs to this file.
    #[arg(long = "log-file", global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tail a directory and print bus envelopes as JSON lines.
    Watch(WatchArgs),
    /// Ingest a directory from the beginning and run analyzers once.
    Analyze(AnalyzeArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Directory holding the conversation logs (overrides [watch] directory).
    #[arg(long = "dir")]
    dir: Option<PathBuf>,

    /// Cursor table file (overrides [tailer] positions_file).
    #[arg(long = "positions")]
    positions: Option<PathBuf>,

    /// Keep cursors in memory only; every run starts from the beginning.
    #[arg(long = "no-persist", conflicts_with = "positions")]
    no_persist: bool,

    /// Topic patterns to print. `*` matches one segment, `#` the rest.
    #[arg(short = 't', long = "topic", default_value = "#")]
    topics: Vec<String>,

    /// Catch up on existing data first and replay buffered envelopes from the
    /// last N hours before switching to live output.
    #[arg(long = "replay-hours")]
    replay_hours: Option<i64>,

    /// Stop after this many seconds (runs until killed if omitted).
    #[arg(long = "duration-secs")]
    duration_secs: Option<u64>,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Event types to include (repeatable), e.g. `blocker`, `task_completed`.
    #[arg(long = "type")]
    event_types: Vec<String>,

    /// Match events whose agent or worker id equals this value.
    #[arg(long = "agent")]
    agent: Option<String>,

    #[arg(long = "worker")]
    worker: Option<String>,

    #[arg(long = "task")]
    task: Option<String>,

    /// Case-insensitive substring search.
    #[arg(long = "search")]
    search: Option<String>,

    /// Regex search over the message.
    #[arg(long = "regex")]
    regex: Option<String>,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Directory holding the conversation logs (overrides [watch] directory).
    #[arg(long = "dir")]
    dir: Option<PathBuf>,

    /// Analyzers to run (repeatable). All registered analyzers if omitted.
    #[arg(short = 'a', long = "analyzer")]
    analyzers: Vec<String>,

    /// Trailing window ending at the latest event. The whole buffer if omitted.
    #[arg(long = "window-hours", conflicts_with_all = ["since", "until"])]
    window_hours: Option<i64>,

    /// Window start (RFC 3339).
    #[arg(long = "since")]
    since: Option<DateTime<Utc>>,

    /// Window end, exclusive (RFC 3339).
    #[arg(long = "until")]
    until: Option<DateTime<Utc>>,

    #[command(flatten)]
    filter: FilterArgs,

    /// Write analysis results here (.csv or .json).
    #[arg(long = "export")]
    export: Option<PathBuf>,

    /// Write the matching events here (.csv or .json).
    #[arg(long = "events-export")]
    events_export: Option<PathBuf>,

    /// Print reports as JSON instead of text.
    #[arg(long = "json")]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let paths = PlatformPaths::resolve();

    // Config is read before logging so its level and file apply; warnings are
    // reported once the subscriber is up.
    let loaded = match &cli.config {
        Some(path) => config::load_config_file(path),
        None => Ok(config::load_config(&paths.config_dir)),
    };
    let (app_config, warnings) = match loaded {
        Ok(v) => v,
        Err(e) => {
            util::logging::init(cli.debug, None, cli.log_file.as_deref());
            tracing::error!(error = %e, "Failed to load config");
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let log_file = cli.log_file.as_deref().or(app_config.log_file.as_deref());
    util::logging::init(cli.debug, app_config.log_level.as_deref(), log_file);
    tracing::info!(
        version = util::constants::APP_VERSION,
        debug = cli.debug,
        "ConvStream starting"
    );
    for w in &warnings {
        tracing::warn!("Config: {}", w);
    }

    let result = match &cli.command {
        Command::Watch(args) => run_watch(args, &app_config, &paths),
        Command::Analyze(args) => run_analyze(args, &app_config),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// CLI directory > config file directory; validated before any thread starts.
fn resolve_watch_dir(cli_dir: Option<&Path>, app: &AppConfig) -> Result<PathBuf, CoreError> {
    let dir = cli_dir
        .map(Path::to_path_buf)
        .or_else(|| app.watch_dir.clone())
        .ok_or_else(|| {
            CoreError::Config(ConfigError::InvalidWatchPath {
                path: PathBuf::new(),
                reason: "no directory given; pass --dir or set [watch] directory".to_string(),
            })
        })?;
    Ok(config::validate_watch_dir(&dir)?)
}

// =============================================================================
// watch
// =============================================================================

fn run_watch(args: &WatchArgs, app: &AppConfig, paths: &PlatformPaths) -> Result<(), CoreError> {
    let watch_dir = resolve_watch_dir(args.dir.as_deref(), app)?;
    let mut engine_config =
        EngineConfig::from_app_config(app, watch_dir, Some(paths.positions_file()));
    if let Some(p) = &args.positions {
        engine_config.positions_file = Some(p.clone());
    }
    if args.no_persist {
        engine_config.positions_file = None;
    }

    let mut engine = Engine::new(engine_config)?;
    let stdout = std::io::stdout();

    let mut subs = Vec::with_capacity(args.topics.len());
    if let Some(hours) = args.replay_hours {
        engine.ingest_once()?;
        let since = Utc::now() - ChronoDuration::hours(hours.max(0));
        for topic in &args.topics {
            let (replayed, sub) = engine.subscribe_with_replay(topic, since);
            let mut out = stdout.lock();
            for envelope in &replayed {
                print_json_line(&mut out, envelope.as_ref());
            }
            subs.push(sub);
        }
    } else {
        for topic in &args.topics {
            subs.push(engine.subscribe(topic));
        }
    }

    engine.start()?;
    tracing::info!(topics = ?args.topics, "Watching");

    let deadline = args
        .duration_secs
        .map(|s| Instant::now() + Duration::from_secs(s));
    loop {
        let mut printed = 0usize;
        {
            let mut out = stdout.lock();
            for sub in &subs {
                for envelope in sub.drain() {
                    print_json_line(&mut out, envelope.as_ref());
                    printed += 1;
                }
            }
            let _ = out.flush();
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if printed == 0 {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    engine.shutdown();
    let health = engine.health();
    tracing::info!(
        status = ?health.status,
        events = health.events_total,
        parse_errors = health.parse_errors_total,
        "Watch finished"
    );
    for reason in &health.reasons {
        tracing::warn!("Health: {}", reason);
    }
    Ok(())
}

fn print_json_line<T: serde::Serialize, W: Write>(out: &mut W, value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
        }
        Err(e) => tracing::warn!(error = %e, "Failed to serialise envelope"),
    }
}

// =============================================================================
// analyze
// =============================================================================

fn build_filter(args: &FilterArgs) -> Result<EventFilter, CoreError> {
    let mut filter = EventFilter {
        event_types: args.event_types.iter().map(|t| EventType::parse(t)).collect(),
        agent: args.agent.clone(),
        worker_id: args.worker.clone(),
        task_id: args.task.clone(),
        text_search: args.search.clone().unwrap_or_default(),
        ..EventFilter::default()
    };
    if let Some(pattern) = &args.regex {
        filter.set_regex(pattern)?;
    }
    Ok(filter)
}

fn run_analyze(args: &AnalyzeArgs, app: &AppConfig) -> Result<(), CoreError> {
    let watch_dir = resolve_watch_dir(args.dir.as_deref(), app)?;
    // One-shot runs always start from the beginning of every file.
    let mut engine_config = EngineConfig::from_app_config(app, watch_dir, None);
    engine_config.positions_file = None;
    let engine = Engine::new(engine_config)?;

    let outcome = engine.ingest_once()?;
    tracing::info!(
        events = outcome.events,
        parse_errors = outcome.parse_errors,
        "Ingest finished"
    );

    let filter = build_filter(&args.filter)?;
    let Some(buffered) = engine.buffered_window() else {
        println!("No conversation events found.");
        return Ok(());
    };
    let window = match (args.window_hours, args.since, args.until) {
        (Some(hours), _, _) => TimeWindow::trailing(buffered.end, hours),
        (None, since, until) => TimeWindow::new(
            since.unwrap_or(buffered.start),
            until.unwrap_or(buffered.end),
        ),
    };

    let reports = if args.analyzers.is_empty() {
        engine.analyze_all(window, &filter)
    } else {
        args.analyzers
            .iter()
            .map(|name| engine.get_analysis(name, window, &filter))
            .collect::<Result<Vec<_>, _>>()?
    };

    if args.json {
        let mut out = std::io::stdout().lock();
        print_json_line(&mut out, &reports);
    } else {
        println!("Window: {window}");
        for report in &reports {
            let flag = if report.complete { "" } else { " (incomplete)" };
            println!("\n[{}]{flag}", report.analyzer_name);
            for r in report.results.iter() {
                println!("  {:<48} {:>14.4}", r.series_key(), r.value);
            }
        }
    }

    if let Some(path) = &args.export {
        let results: Vec<_> = reports
            .iter()
            .flat_map(|r| r.results.iter().cloned())
            .collect();
        let n = export::write_results_file(&results, path)?;
        tracing::info!(path = %path.display(), rows = n, "Results exported");
    }
    if let Some(path) = &args.events_export {
        let events = engine.bus().conversations_in(&window, &filter);
        let n = export::write_events_file(&events, path)?;
        tracing::info!(path = %path.display(), rows = n, "Events exported");
    }

    let health = engine.health();
    for reason in &health.reasons {
        eprintln!("Warning: {reason}");
    }
    Ok(())
}
